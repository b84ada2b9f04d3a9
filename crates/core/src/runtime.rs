use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Extra directory searched before every other candidate.
const ENV_LIB_DIR: &str = "NSS_LIB_DIR";
const ENV_ORT_DYLIB_PATH: &str = "ORT_DYLIB_PATH";

/// What [`setup_runtime_libs`] found, for logging once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibStatus {
    pub searched_dirs: Vec<PathBuf>,
    pub ort_dylib: Option<PathBuf>,
    /// `ORT_DYLIB_PATH` was already set by the environment.
    pub ort_preconfigured: bool,
    pub preloaded: Vec<PathBuf>,
}

/// Search directories for runtime libraries.
///
/// Probes these locations in order:
///   1. `$NSS_LIB_DIR`
///   2. `<exe_dir>/` (Windows only)
///   3. `<exe_dir>/lib/`
///   4. `<exe_dir>/../lib/`
///   5. `<cwd>/lib/`
///   6. `/usr/local/lib/` (Unix only)
///   7. `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = env::var_os(ENV_LIB_DIR) {
        if !dir.is_empty() {
            dirs.push(PathBuf::from(dir));
        }
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn normalize_windows_path_key(path: &Path) -> String {
    path.to_string_lossy()
        .replace('/', "\\")
        .to_ascii_lowercase()
}

#[cfg(windows)]
fn build_path_with_prepended_dirs(current: Option<OsString>, dirs: &[PathBuf]) -> OsString {
    use std::collections::HashSet;

    let fallback = current.clone().unwrap_or_default();
    let mut merged = Vec::new();
    let mut seen = HashSet::<String>::new();

    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        let key = normalize_windows_path_key(dir);
        if seen.insert(key) {
            merged.push(dir.clone());
        }
    }

    if let Some(path) = current {
        for dir in env::split_paths(&path) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            let key = normalize_windows_path_key(&dir);
            if seen.insert(key) {
                merged.push(dir);
            }
        }
    }

    env::join_paths(merged).unwrap_or(fallback)
}

#[cfg(windows)]
fn prepend_candidate_dirs_to_path(dirs: &[PathBuf]) {
    let merged = build_path_with_prepended_dirs(env::var_os("PATH"), dirs);
    env::set_var("PATH", merged);
}

/// Return a load-priority tier for known GPU runtime libs, or `None` for
/// anything we should NOT preload (ORT providers, unrelated system libs).
///
/// ORT providers are NOT preloaded because they depend on symbols exported
/// by `libonnxruntime.so`, which is loaded later by the ORT crate itself.
///
///   0 — CUDA runtime (libcudart, libcublas, libcublasLt, libcufft, libcurand)
///   1 — cuDNN (libcudnn*)
///   2 — TensorRT (libnvinfer*, libnvonnxparser*)
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("libcudart")
        || name.starts_with("libcublaslt")
        || name.starts_with("libcublas")
        || name.starts_with("libcufft")
        || name.starts_with("libcurand")
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("cudart64_")
        || name.starts_with("cublas64_")
        || name.starts_with("cublaslt64_")
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

/// Accelerator libraries under `dirs` in the order they must be loaded.
///
/// Deduplicates by file name; the first directory in `dirs` that contains
/// a given library wins, so caller ordering matters.
fn plan_preload(dirs: &[PathBuf]) -> Vec<PathBuf> {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }

            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// Pre-load libraries via RTLD_GLOBAL or LoadLibrary so that ORT's
/// execution providers find them in the process address space.
///
/// glibc caches `LD_LIBRARY_PATH` at startup, so `env::set_var` after
/// `main()` begins has no effect on dlopen search paths.
fn preload_libs(libs: &[PathBuf]) -> Vec<PathBuf> {
    libs.iter()
        .filter(|path| unsafe { load_library(path) })
        .cloned()
        .collect()
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Locate ONNX Runtime for `ort`'s `load-dynamic` feature and preload the
/// CUDA, cuDNN and TensorRT libraries next to it.
///
/// Call this at the very start of `main()`, before any ORT or tracing init.
pub fn setup_runtime_libs() -> RuntimeLibStatus {
    let dirs = candidate_lib_dirs();
    let ort_preconfigured = env::var_os(ENV_ORT_DYLIB_PATH).is_some();

    let ort_dylib = if ort_preconfigured {
        env::var_os(ENV_ORT_DYLIB_PATH).map(PathBuf::from)
    } else {
        let found = find_ort_dylib_in_dirs(&dirs);
        if let Some(path) = &found {
            env::set_var(ENV_ORT_DYLIB_PATH, path);
        }

        #[cfg(windows)]
        prepend_candidate_dirs_to_path(&dirs);

        found
    };

    let preloaded = preload_libs(&plan_preload(&dirs));
    RuntimeLibStatus {
        searched_dirs: dirs,
        ort_dylib,
        ort_preconfigured,
        preloaded,
    }
}

/// Log which runtime libraries were resolved, for diagnostics.
/// Call after tracing is initialized.
pub fn log_runtime_lib_status(status: &RuntimeLibStatus) {
    match &status.ort_dylib {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            preconfigured = status.ort_preconfigured,
            "ORT library"
        ),
        Some(path) => warn!(
            path = %path.display(),
            "ORT_DYLIB_PATH points at a missing file"
        ),
        None => warn!(
            searched = status.searched_dirs.len(),
            "ORT library not found; ORT will try default search paths"
        ),
    }
    for lib in &status.preloaded {
        debug!(path = %lib.display(), "Preloaded accelerator library");
    }
}
