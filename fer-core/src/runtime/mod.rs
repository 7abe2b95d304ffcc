use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::session::Session;

use crate::error::DemoError;

#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";

/// Locate the ONNX Runtime library and initialise ORT from it.
///
/// Priority order:
/// 1) `preferred` (from the settings file), if it exists
/// 2) Existing ORT_DYLIB_PATH (if file exists)
/// 3) models/onnxruntime*/lib/<lib> near current exe/cwd
/// 4) system library directories
/// 5) the bare library name, left to the platform loader
///
/// Must run before any other ORT call. A library that cannot be loaded is
/// reported as [`DemoError::ModelLoad`] instead of aborting the process.
pub fn init_ort(preferred: Option<&Path>) -> Result<PathBuf> {
    let path = resolve_dylib(preferred);
    load_dylib(&path)?;
    tracing::info!(path = %path.display(), "ONNX Runtime loaded");
    Ok(path)
}

fn resolve_dylib(preferred: Option<&Path>) -> PathBuf {
    if let Some(path) = preferred {
        if path.is_file() {
            return path.to_path_buf();
        }
        tracing::warn!(path = %path.display(), "configured ort_dylib does not exist; ignoring");
    }

    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return existing_path;
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    if let Some(candidate) = ort_candidates().into_iter().find(|c| c.is_file()) {
        return candidate;
    }

    tracing::warn!("could not locate {ORT_LIB_NAME}; falling back to the system loader");
    PathBuf::from(ORT_LIB_NAME)
}

/// ORT panics when its library fails to load; turn that into an error.
fn load_dylib(path: &Path) -> Result<()> {
    let failure = |reason: String| DemoError::ModelLoad {
        what: "ONNX Runtime".into(),
        path: path.to_path_buf(),
        reason,
    };

    let target = path.display().to_string();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| ort::init_from(target).commit()));
    match outcome {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(failure(e.to_string()).into()),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "library could not be loaded".into());
            Err(failure(reason).into())
        }
    }
}

fn ort_candidates() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..5 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIB_NAME));
        candidates.push(root.join("models").join(ORT_LIB_NAME));
    }

    candidates.push(PathBuf::from("/usr/local/lib").join(ORT_LIB_NAME));
    candidates.push(PathBuf::from("/usr/lib").join(ORT_LIB_NAME));
    candidates.push(PathBuf::from("/opt/homebrew/lib").join(ORT_LIB_NAME));
    candidates
}

// ── Compute device ───────────────────────────────────────────────────────────

/// Where inference runs. Chosen once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    /// Use CUDA when the loaded ONNX Runtime was built with it. Call after
    /// [`init_ort`].
    pub fn detect() -> Self {
        match CUDAExecutionProvider::default().is_available() {
            Ok(true) => Device::Cuda,
            Ok(false) => Device::Cpu,
            Err(e) => {
                tracing::warn!("could not query execution providers: {e}; using CPU");
                Device::Cpu
            }
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda => f.write_str("cuda"),
        }
    }
}

/// Build an ORT session for `model_path`. A missing file or a failed
/// commit is reported as [`DemoError::ModelLoad`].
pub fn build_session(model_path: &Path, what: &str, device: Device) -> Result<Session> {
    if !model_path.is_file() {
        return Err(DemoError::ModelLoad {
            what: what.to_string(),
            path: model_path.to_path_buf(),
            reason: "weight file not found".into(),
        }
        .into());
    }

    let model_load = |reason: String| DemoError::ModelLoad {
        what: what.to_string(),
        path: model_path.to_path_buf(),
        reason,
    };

    let mut builder = Session::builder().map_err(|e| model_load(e.to_string()))?;
    builder = builder
        .with_intra_threads(num_threads())
        .context("failed to set ORT intra threads")?;
    if device == Device::Cuda {
        builder = builder
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .context("failed to register CUDA execution provider")?;
    }
    let session = builder
        .commit_from_file(model_path)
        .map_err(|e| model_load(e.to_string()))?;

    tracing::debug!(model = what, path = %model_path.display(), %device, "ORT session ready");
    Ok(session)
}

fn num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Extract output `index` of a finished run as a shape + flat copy of its data.
pub(crate) fn output_f32(
    outputs: &ort::session::SessionOutputs<'_>,
    index: usize,
) -> Result<(Vec<i64>, Vec<f32>)> {
    let value = outputs
        .iter()
        .nth(index)
        .with_context(|| format!("model produced no output #{index}"))?
        .1;
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .with_context(|| format!("failed to extract output #{index} as f32"))?;
    Ok((shape.to_vec(), data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_weights_are_a_model_load_failure() {
        let err = build_session(Path::new("/nonexistent/model.onnx"), "test model", Device::Cpu)
            .unwrap_err();
        assert_eq!(
            crate::error::FailureKind::of(&err),
            crate::error::FailureKind::ModelLoad
        );
    }

    #[test]
    fn unloadable_library_is_a_model_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join(ORT_LIB_NAME);
        std::fs::write(&bogus, b"not a shared library").unwrap();

        let err = init_ort(Some(&bogus)).unwrap_err();
        match err.downcast_ref::<DemoError>() {
            Some(DemoError::ModelLoad { what, path, .. }) => {
                assert_eq!(what, "ONNX Runtime");
                assert_eq!(path, &bogus);
            }
            other => panic!("expected ModelLoad, got {other:?}"),
        }
    }

    #[test]
    fn preferred_library_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join(ORT_LIB_NAME);
        std::fs::write(&lib, b"").unwrap();
        assert_eq!(resolve_dylib(Some(&lib)), lib);
    }

    #[test]
    fn candidates_cover_models_dir() {
        let c = ort_candidates();
        assert!(c.iter().any(|p| p.ends_with(Path::new("models").join(ORT_LIB_NAME))));
    }
}
