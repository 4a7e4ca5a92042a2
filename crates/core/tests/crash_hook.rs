//! The crash hook runs in a re-executed copy of this test binary so the
//! panics it provokes do not take the harness down.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use esrgan_core::codec::{encode_bgr, DEFAULT_JPEG_QUALITY};
use esrgan_core::discovery::InputSet;
use esrgan_core::logging::{install_crash_hook, set_crash_context, CRASH_DIR_NAME, LOG_DIR_NAME};
use esrgan_core::tensor::{ImageTensor, PixelArray};
use esrgan_core::{Device, Driver, NetworkModel, RunOptions};
use tempfile::tempdir;

const SCENARIO_ENV: &str = "ESRGAN_CRASH_SCENARIO";
const DATA_DIR_ENV: &str = "ESRGAN_CRASH_DATA_DIR";

struct ExplodingNetwork;

impl NetworkModel for ExplodingNetwork {
    fn scale(&self) -> usize {
        4
    }

    fn forward(&self, _input: &ImageTensor) -> anyhow::Result<ImageTensor> {
        panic!("forward pass blew up");
    }
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME)
}

fn run_scenario(scenario: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test binary path"))
        .args(["crash_scenario", "--exact", "--nocapture"])
        .env(SCENARIO_ENV, scenario)
        .env(DATA_DIR_ENV, data_dir)
        .output()
        .expect("spawn test binary")
}

fn reports(dir: &Path) -> Vec<String> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .expect("crash dir exists")
        .map(|entry| entry.expect("crash dir entry").path())
        .collect();
    paths.sort();
    paths
        .iter()
        .map(|path| fs::read_to_string(path).expect("readable report"))
        .collect()
}

#[test]
fn crash_scenario() {
    let Ok(scenario) = std::env::var(SCENARIO_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(DATA_DIR_ENV).expect("data dir for scenario"));

    let dir = install_crash_hook(&data_dir).expect("install crash hook");
    assert_eq!(install_crash_hook(&data_dir.join("elsewhere")).unwrap(), dir);

    match scenario.as_str() {
        "worker_panic" => {
            set_crash_context(Path::new("models/x4.onnx"), Device::Cuda { device_id: 0 });

            let input_root = data_dir.join("LR");
            fs::create_dir_all(input_root.join("sub")).unwrap();
            encode_bgr(
                &PixelArray::zeros((4, 4, 3)),
                &input_root.join("sub/frame.png"),
                DEFAULT_JPEG_QUALITY,
            )
            .unwrap();

            let driver = Driver::new(
                ExplodingNetwork,
                &input_root,
                data_dir.join("results"),
                RunOptions {
                    jobs: 2,
                    create_output_dirs: true,
                    ..RunOptions::default()
                },
            );
            let _ = driver.run(InputSet::new(&input_root).iter(), |_| {});
            unreachable!("a worker panic propagates out of the run");
        }
        "blocked_crash_dir" => {
            fs::remove_dir_all(&dir).unwrap();
            fs::write(&dir, b"in the way").unwrap();
            panic!("panic with nowhere to report");
        }
        other => panic!("unknown crash scenario {other}"),
    }
}

#[test]
fn worker_panic_report_names_model_device_and_image() {
    let data_dir = tempdir().unwrap();
    let output = run_scenario("worker_panic", data_dir.path());
    assert!(!output.status.success());

    let reports = reports(&crash_dir(data_dir.path()));
    let report = reports
        .iter()
        .find(|text| text.contains("message: forward pass blew up"))
        .unwrap_or_else(|| panic!("no report for the worker panic in {reports:?}"));

    assert!(report.starts_with("esrgan "));
    assert!(report.contains("panicked at: "));
    assert!(report.contains("model: models/x4.onnx"));
    assert!(report.contains("device: cuda:0"));
    let input_line = report
        .lines()
        .find(|line| line.starts_with("input: "))
        .expect("input line");
    assert!(input_line.ends_with("frame.png"), "{input_line}");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("forward pass blew up"));
    assert!(!stderr.contains("panicked while processing panic"));
}

#[test]
fn unwritable_crash_dir_warns_once_and_keeps_the_original_panic() {
    let data_dir = tempdir().unwrap();
    let output = run_scenario("blocked_crash_dir", data_dir.path());
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("panic with nowhere to report"));
    assert_eq!(
        stderr.matches("Warning: could not write crash report").count(),
        1,
        "{stderr}"
    );
    assert!(crash_dir(data_dir.path()).is_file());
}
