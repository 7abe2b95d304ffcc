pub mod classifier;
pub mod config;
pub mod detection;
pub mod emotion;
pub mod error;
pub mod pipeline;
pub mod preprocess;
pub mod rendering;
pub mod runtime;
pub mod tracking;
pub mod video;

// Re-export the top-level pipeline error type so callers only need `fer_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
