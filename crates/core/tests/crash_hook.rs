use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tempfile::tempdir;
use nss_core::error::GpuError;
use nss_core::gpu::Device;
use nss_core::logging::{crash_dir, install_panic_hook};

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env("NSS_PANIC_CHILD_MODE", mode)
        .env("NSS_PANIC_CHILD_DATA_DIR", data_dir)
        .output()
        .expect("run panic hook child")
}

fn collect_crash_artifacts(crash_dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(crash_dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("read crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var("NSS_PANIC_CHILD_MODE") else {
        return;
    };

    let data_dir = PathBuf::from(
        std::env::var("NSS_PANIC_CHILD_DATA_DIR")
            .expect("NSS_PANIC_CHILD_DATA_DIR must be set"),
    );

    let installed = install_panic_hook(&data_dir).expect("install crash hook");
    assert_eq!(installed, crash_dir(&data_dir));
    let reinstalled = install_panic_hook(&data_dir).expect("second install is a no-op");
    assert_eq!(reinstalled, installed);

    match mode.as_str() {
        "write_success" => panic!("intentional panic for crash_hook_writes_crash_file"),
        "gpu_pass" => {
            let device = Device::cpu_reference();
            let queue = device.create_command_queue("crash-test");
            let mut stream = queue.create_stream("crash-test.frame");
            stream.encode_pass("nss.upsample", || {
                panic!("intentional panic inside a compute pass")
            });
            let error = stream.commit().wait().expect_err("panicking pass fails");
            assert!(matches!(error, GpuError::CommandFailed { .. }));
            println!("pass failure surfaced: {error}");
        }
        "write_failure" => {
            let dir = crash_dir(&data_dir);
            if dir.exists() {
                fs::remove_dir_all(&dir).expect("remove crash directory");
            }
            fs::write(&dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("intentional panic for crash_hook_unwritable_crash_dir");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn crash_hook_writes_crash_file() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_success", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let crash_artifacts = collect_crash_artifacts(&crash_dir(data_dir.path()));
    assert!(!crash_artifacts.is_empty(), "expected crash artifact");

    let newest_artifact = crash_artifacts.last().expect("artifact path");
    let contents = fs::read_to_string(newest_artifact).expect("read crash artifact");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("payload=intentional panic for crash_hook_writes_crash_file"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace_policy="));
    assert!(contents.contains("backtrace:"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn crash_hook_unwritable_crash_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_failure", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("intentional panic for crash_hook_unwritable_crash_dir"));
    assert!(stderr.contains("nss: could not write crash report under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn panicking_compute_pass_is_recorded_and_reported() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("gpu_pass", data_dir.path());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "pass panic must not abort the process");
    assert!(stdout.contains("pass failure surfaced: command `nss.upsample` failed"));

    let crash_artifacts = collect_crash_artifacts(&crash_dir(data_dir.path()));
    assert_eq!(crash_artifacts.len(), 1);

    let contents = fs::read_to_string(&crash_artifacts[0]).expect("read crash artifact");
    assert!(contents.contains("payload=intentional panic inside a compute pass"));
}
