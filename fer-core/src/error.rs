//! Failure taxonomy for one processed file.
//!
//! Library code returns `anyhow::Result` with context; the variants below are
//! raised at the points where the caller has to tell failures apart and are
//! recovered with [`FailureKind::of`].

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("no face detected in {source_name} (enforce-detection is on)")]
    DetectionFailure { source_name: String },

    #[error("failed to load {what} from {}: {reason}", path.display())]
    ModelLoad {
        what: String,
        path: PathBuf,
        reason: String,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode {name}: {reason}")]
    Decode { name: String, reason: String },

    #[error("unsupported input {name}: expected one of {expected}")]
    UnsupportedInput { name: String, expected: String },
}

impl DemoError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DemoError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Coarse classification of any pipeline error, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DetectionFailure,
    ModelLoad,
    Io,
    InvalidInput,
    Other,
}

impl FailureKind {
    pub fn of(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<DemoError>() {
                return match e {
                    DemoError::DetectionFailure { .. } => FailureKind::DetectionFailure,
                    DemoError::ModelLoad { .. } => FailureKind::ModelLoad,
                    DemoError::Io { .. } => FailureKind::Io,
                    DemoError::Decode { .. } | DemoError::UnsupportedInput { .. } => {
                        FailureKind::InvalidInput
                    }
                };
            }
            if cause.is::<std::io::Error>() {
                return FailureKind::Io;
            }
        }
        FailureKind::Other
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::DetectionFailure => "detection failure",
            FailureKind::ModelLoad => "model load failure",
            FailureKind::Io => "I/O failure",
            FailureKind::InvalidInput => "invalid input",
            FailureKind::Other => "error",
        };
        f.write_str(s)
    }
}
