//! Locating the ONNX Runtime shared library (`ort` is built with
//! `load-dynamic`) and making CUDA / cuDNN / TensorRT visible to it.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Dependency tiers of the GPU libraries; lower tiers load first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GpuLibTier {
    Cuda,
    Cudnn,
    Tensorrt,
}

/// What [`setup_runtime_libs`] resolved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuntimeLibs {
    pub searched: Vec<PathBuf>,
    /// ONNX Runtime library handed to `ort`, if any.
    pub ort_dylib: Option<PathBuf>,
    /// True when `ORT_DYLIB_PATH` was already set by the caller.
    pub ort_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

impl RuntimeLibs {
    pub fn log(&self) {
        match &self.ort_dylib {
            Some(path) if path.is_file() => {
                info!(path = %path.display(), from_env = self.ort_from_env, "ONNX Runtime library")
            }
            Some(path) => warn!(
                path = %path.display(),
                "{ORT_DYLIB_ENV} points at a missing file"
            ),
            None => warn!(
                searched = ?self.searched,
                "No bundled ONNX Runtime found; relying on the default loader search path"
            ),
        }
        if !self.preloaded.is_empty() {
            debug!(libs = ?self.preloaded, "Preloaded GPU runtime libraries");
        }
    }
}

/// Directories probed for runtime libraries, in priority order:
/// `<exe_dir>` (Windows only), `<exe_dir>/lib`, `<exe_dir>/../lib`,
/// `<cwd>/lib`, then `/usr/local/lib` and `/usr/lib` on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn gpu_lib_tier(name: &str) -> Option<GpuLibTier> {
    let name = name.to_ascii_lowercase();
    const CUDA: [&str; 4] = ["libcudart", "libcublas", "libcufft", "libcurand"];
    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(GpuLibTier::Cuda)
    } else if name.starts_with("libcudnn") {
        Some(GpuLibTier::Cudnn)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(GpuLibTier::Tensorrt)
    } else {
        None
    }
}

#[cfg(windows)]
fn gpu_lib_tier(name: &str) -> Option<GpuLibTier> {
    let name = name.to_ascii_lowercase();
    const CUDA: [&str; 3] = ["cudart64_", "cublas64_", "cublaslt64_"];
    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(GpuLibTier::Cuda)
    } else if name.starts_with("cudnn64_") {
        Some(GpuLibTier::Cudnn)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(GpuLibTier::Tensorrt)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_shared_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries found under `dirs`, ordered CUDA, cuDNN, TensorRT. The first
/// directory holding a given file name wins. ONNX Runtime's own provider
/// libraries are excluded; they need `libonnxruntime` loaded first.
fn gpu_libs_in_dirs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut libs: Vec<(GpuLibTier, String, PathBuf)> = Vec::new();

    for entries in dirs.iter().filter_map(|dir| std::fs::read_dir(dir).ok()) {
        for path in entries.flatten().map(|entry| entry.path()) {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !is_shared_lib(&name, &path) || !seen.insert(name.clone()) {
                continue;
            }
            if let Some(tier) = gpu_lib_tier(&name) {
                libs.push((tier, name, path));
            }
        }
    }

    libs.sort();
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// dlopen with RTLD_GLOBAL so later loads by ONNX Runtime resolve against
/// these handles; `LD_LIBRARY_PATH` changes after startup are ignored by glibc.
#[cfg(unix)]
fn preload(path: &Path) -> bool {
    // SAFETY: the library is only kept resident; no symbols are called here.
    let opened = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    };
    opened.map(std::mem::forget).is_ok()
}

#[cfg(windows)]
fn preload(path: &Path) -> bool {
    // SAFETY: as above.
    let opened = unsafe { libloading::Library::new(path) };
    opened.map(std::mem::forget).is_ok()
}

#[cfg(windows)]
fn prepend_to_path(dirs: &[PathBuf]) {
    let existing = env::var_os("PATH").unwrap_or_default();
    let merged = dirs
        .iter()
        .filter(|dir| dir.is_dir())
        .cloned()
        .chain(env::split_paths(&existing))
        .collect::<Vec<_>>();
    if let Ok(joined) = env::join_paths(merged) {
        env::set_var("PATH", joined);
    }
}

/// Point `ort` at a bundled ONNX Runtime and, for accelerator devices,
/// preload the GPU libraries next to it.
///
/// Must run before the first session is built and before worker threads start.
pub fn setup_runtime_libs(preload_gpu_libs: bool) -> RuntimeLibs {
    let searched = candidate_lib_dirs();
    let mut libs = RuntimeLibs {
        ort_dylib: env::var_os(ORT_DYLIB_ENV).map(PathBuf::from),
        ..RuntimeLibs::default()
    };
    libs.ort_from_env = libs.ort_dylib.is_some();

    if libs.ort_dylib.is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&searched) {
            env::set_var(ORT_DYLIB_ENV, &path);
            libs.ort_dylib = Some(path);
        }

        #[cfg(windows)]
        prepend_to_path(&searched);
    }

    if preload_gpu_libs {
        libs.preloaded = gpu_libs_in_dirs(&searched)
            .into_iter()
            .filter(|path| preload(path))
            .collect();
    }

    libs.searched = searched;
    libs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib_once() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            let lib = cwd.join("lib");
            assert_eq!(dirs.iter().filter(|dir| **dir == lib).count(), 1);
        }
    }

    #[test]
    fn find_ort_dylib_in_dirs_prefers_first_match() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir should be created");
        std::fs::create_dir_all(&second).expect("second dir should be created");
        std::fs::write(second.join(ORT_LIB_NAME), b"second").expect("second lib should exist");

        let dirs = [first.clone(), second.clone()];
        assert_eq!(find_ort_dylib_in_dirs(&dirs), Some(second.join(ORT_LIB_NAME)));

        std::fs::write(first.join(ORT_LIB_NAME), b"first").expect("first lib should exist");
        assert_eq!(find_ort_dylib_in_dirs(&dirs), Some(first.join(ORT_LIB_NAME)));
    }

    #[test]
    fn find_ort_dylib_in_empty_dirs_is_none() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        assert_eq!(find_ort_dylib_in_dirs(&[temp.path().to_path_buf()]), None);
    }

    #[cfg(unix)]
    #[test]
    fn gpu_lib_tiers_order_cuda_before_cudnn_before_trt() {
        assert!(gpu_lib_tier("libcudart.so.12") < gpu_lib_tier("libcudnn.so.9"));
        assert!(gpu_lib_tier("libcublasLt.so.12") < gpu_lib_tier("libcudnn_ops.so.9"));
        assert!(gpu_lib_tier("libcudnn.so.9") < gpu_lib_tier("libnvinfer.so.10"));
    }

    #[cfg(unix)]
    #[test]
    fn gpu_lib_tier_excludes_ort_and_unknown_libs() {
        assert_eq!(gpu_lib_tier("libonnxruntime.so.1.23.2"), None);
        assert_eq!(gpu_lib_tier("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(gpu_lib_tier("libpng16.so.16"), None);
    }

    #[cfg(unix)]
    #[test]
    fn gpu_libs_are_sorted_by_tier_and_deduplicated() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libz.so.1"] {
            std::fs::write(a.join(name), b"").unwrap();
        }
        for name in ["libcudart.so.12", "libcudnn.so.9"] {
            std::fs::write(b.join(name), b"").unwrap();
        }

        let libs = gpu_libs_in_dirs(&[a.clone(), b.clone()]);
        assert_eq!(
            libs,
            vec![
                b.join("libcudart.so.12"),
                a.join("libcudnn.so.9"),
                a.join("libnvinfer.so.10"),
            ]
        );
    }

    #[cfg(windows)]
    #[test]
    fn gpu_lib_tiers_order_cuda_before_cudnn_before_trt() {
        assert!(gpu_lib_tier("cudart64_12.dll") < gpu_lib_tier("cudnn64_9.dll"));
        assert!(gpu_lib_tier("cudnn64_9.dll") < gpu_lib_tier("nvinfer.dll"));
        assert_eq!(gpu_lib_tier("onnxruntime.dll"), None);
    }
}
