//! Batch inference driver: decode -> normalize -> forward -> denormalize -> encode
//! for every discovered input.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use image::ImageError;
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, error, info};

use crate::codec::{self, DEFAULT_JPEG_QUALITY};
use crate::device::Device;
use crate::discovery::relative_name;
use crate::error::{Result, UpscaleError};
use crate::logging::CrashScope;
use crate::network::{NetworkModel, OnnxNetwork, RrdbNetConfig};
use crate::tensor;

/// What to do when a single file fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the run on the first per-file error.
    FailFast,
    /// Log the error, record it in the summary and move on.
    #[default]
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = UpscaleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" | "abort" => Ok(Self::FailFast),
            "continue" | "skip" => Ok(Self::Continue),
            other => Err(UpscaleError::Argument(format!(
                "unknown failure policy '{other}' (expected fail-fast or continue)"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    pub failure_policy: FailurePolicy,
    /// Worker threads. `1` processes files strictly one after another.
    pub jobs: usize,
    pub jpeg_quality: u8,
    /// Create missing parent directories under the output root.
    pub create_output_dirs: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            jobs: 1,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            create_output_dirs: false,
        }
    }
}

/// One discovered file, announced before it is processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    /// 1-based position in discovery order.
    pub index: usize,
    pub input: PathBuf,
    /// Path relative to the input root; also the name under the output root.
    pub relative: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub failed: Vec<(PathBuf, String)>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Load the fixed RRDBNet x4 export on `device`.
pub fn initialize(
    model_path: &Path,
    device: Device,
    strict: bool,
    trt_cache_dir: Option<&Path>,
) -> Result<OnnxNetwork> {
    OnnxNetwork::load(
        model_path,
        device,
        &RrdbNetConfig::default(),
        strict,
        trt_cache_dir,
    )
}

pub struct Driver<M> {
    network: M,
    input_root: PathBuf,
    output_root: PathBuf,
    options: RunOptions,
}

impl<M: NetworkModel> Driver<M> {
    pub fn new(
        network: M,
        input_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        options: RunOptions,
    ) -> Self {
        Self {
            network,
            input_root: input_root.into(),
            output_root: output_root.into(),
            options,
        }
    }

    pub fn network(&self) -> &M {
        &self.network
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn plan(&self, index: usize, input: &Path) -> Result<WorkItem> {
        let relative = relative_name(&self.input_root, input)?;
        Ok(WorkItem {
            index,
            input: input.to_path_buf(),
            output: self.output_root.join(&relative),
            relative,
        })
    }

    /// Upscale one file into `output`.
    pub fn infer_one(&self, input: &Path, output: &Path) -> Result<()> {
        let started = Instant::now();
        let _crash_scope = CrashScope::enter(input);

        let pixels = codec::decode_bgr(input)?;
        let (h, w, _) = pixels.dim();
        let tensor_in =
            tensor::normalize(&pixels).map_err(|e| UpscaleError::inference(input, e.to_string()))?;

        let tensor_out = self
            .network
            .forward(&tensor_in)
            .map_err(|e| UpscaleError::inference(input, format!("{e:#}")))?;

        let scale = self.network.scale();
        let expected = [1, tensor::CHANNELS, h * scale, w * scale];
        if tensor_out.shape() != expected {
            return Err(UpscaleError::inference(
                input,
                format!(
                    "network returned shape {:?}, expected {expected:?}",
                    tensor_out.shape()
                ),
            ));
        }

        let upscaled = tensor::denormalize(tensor_out.view())
            .map_err(|e| UpscaleError::inference(input, e.to_string()))?;

        if self.options.create_output_dirs {
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent).map_err(|e| UpscaleError::Encode {
                    path: output.to_path_buf(),
                    source: ImageError::IoError(e),
                })?;
            }
        }
        codec::encode_bgr(&upscaled, output, self.options.jpeg_quality)?;

        debug!(
            input = %input.display(),
            output = %output.display(),
            width = w,
            height = h,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upscaled"
        );
        Ok(())
    }

    /// Process every path from `inputs`, calling `on_item` as each one is
    /// picked up. Items are announced in discovery order even with several
    /// workers.
    ///
    /// Under [`FailurePolicy::FailFast`] the first per-file error is returned;
    /// otherwise failures are collected into the summary.
    pub fn run<I, F>(&self, inputs: I, on_item: F) -> Result<RunSummary>
    where
        I: Iterator<Item = PathBuf> + Send,
        F: FnMut(&WorkItem) + Send,
    {
        let started = Instant::now();
        let summary = if self.options.jobs <= 1 {
            self.run_sequential(inputs, on_item)?
        } else {
            self.run_parallel(inputs, on_item)?
        };

        info!(
            processed = summary.processed,
            failed = summary.failed.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Run finished"
        );
        Ok(summary)
    }

    fn run_sequential<I, F>(&self, inputs: I, mut on_item: F) -> Result<RunSummary>
    where
        I: Iterator<Item = PathBuf>,
        F: FnMut(&WorkItem),
    {
        let mut summary = RunSummary::default();
        for (offset, input) in inputs.enumerate() {
            let outcome = self.plan(offset + 1, &input).and_then(|item| {
                on_item(&item);
                self.infer_one(&item.input, &item.output)
            });

            match outcome {
                Ok(()) => summary.processed += 1,
                Err(err) => self.record_failure(&mut summary, input, err)?,
            }
        }
        Ok(summary)
    }

    fn run_parallel<I, F>(&self, inputs: I, on_item: F) -> Result<RunSummary>
    where
        I: Iterator<Item = PathBuf> + Send,
        F: FnMut(&WorkItem) + Send,
    {
        let queue = Mutex::new((inputs.enumerate(), on_item));
        let summary = Mutex::new(RunSummary::default());
        let first_error: Mutex<Option<UpscaleError>> = Mutex::new(None);
        let stop = AtomicBool::new(false);

        thread::scope(|scope| {
            for worker in 0..self.options.jobs {
                let (queue, summary, first_error, stop) = (&queue, &summary, &first_error, &stop);
                scope.spawn(move || {
                    let _span = debug_span!("worker", id = worker).entered();
                    while !stop.load(Ordering::Relaxed) {
                        let (input, planned) = {
                            let mut guard = queue.lock().unwrap_or_else(PoisonError::into_inner);
                            let (pending, on_item) = &mut *guard;
                            let Some((offset, input)) = pending.next() else {
                                break;
                            };
                            let planned = self.plan(offset + 1, &input);
                            if let Ok(item) = &planned {
                                on_item(item);
                            }
                            (input, planned)
                        };

                        let outcome =
                            planned.and_then(|item| self.infer_one(&item.input, &item.output));

                        let mut summary = summary.lock().unwrap_or_else(PoisonError::into_inner);
                        match outcome {
                            Ok(()) => summary.processed += 1,
                            Err(err) => {
                                if let Err(err) = self.record_failure(&mut summary, input, err) {
                                    stop.store(true, Ordering::Relaxed);
                                    let mut slot =
                                        first_error.lock().unwrap_or_else(PoisonError::into_inner);
                                    if slot.is_none() {
                                        *slot = Some(err);
                                    }
                                }
                            }
                        }
                    }
                });
            }
        });

        if let Some(err) = first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(err);
        }
        let mut summary = summary.into_inner().unwrap_or_else(PoisonError::into_inner);
        summary.failed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(summary)
    }

    fn record_failure(
        &self,
        summary: &mut RunSummary,
        input: PathBuf,
        err: UpscaleError,
    ) -> Result<()> {
        error!(input = %input.display(), error = %err, "Failed to upscale");
        if err.is_fatal() || self.options.failure_policy == FailurePolicy::FailFast {
            return Err(err);
        }
        summary.failed.push((input, err.to_string()));
        Ok(())
    }
}
