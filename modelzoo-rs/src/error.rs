//! Error types for modelzoo-rs.
//!
//! Every fallible operation in the crate returns [`Result`]. Configuration
//! and missing-checkpoint errors surface to the caller immediately; nothing
//! in the core retries.
//!
//! # Example
//!
//! ```rust
//! use modelzoo_rs::{ZooConfig, ZooError};
//!
//! # fn main() {
//! match ZooConfig::from_preset("unknown-task") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(ZooError::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for modelzoo-rs operations.
pub type Result<T> = std::result::Result<T, ZooError>;

/// Errors that can occur in modelzoo-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ZooError {
    /// Invalid configuration: unknown kinds, bad values, or an adapter
    /// configuration that was required to match and matched nothing.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Checkpoint path does not exist.
    #[error("checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    /// Checkpoint exists but cannot be written, read or applied.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A collective was called with vectors of different lengths across
    /// processes.
    #[error("collective mismatch: expected length {expected}, got {actual}")]
    CollectiveMismatch {
        /// Length contributed by the reducing rank.
        expected: usize,
        /// Length contributed by the offending rank.
        actual: usize,
    },

    /// Distributed runtime failure (not initialized, transport failure).
    #[error("distributed error: {0}")]
    Distributed(String),

    /// Model construction or graph error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (checkpoint header) error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Safetensors encoding error.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for ZooError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        ZooError::Template(err.to_string())
    }
}

impl ZooError {
    /// Whether this error comes from configuration (fails before training).
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, ZooError::Config(_) | ZooError::ConfigParse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = ZooError::Config("unknown optimizer: lamb".to_string());
        assert_eq!(
            error.to_string(),
            "configuration error: unknown optimizer: lamb"
        );
        assert!(error.is_config());
    }

    #[test]
    fn test_checkpoint_not_found_display() {
        let error = ZooError::CheckpointNotFound(PathBuf::from("/tmp/missing.safetensors"));
        assert_eq!(
            error.to_string(),
            "checkpoint not found: /tmp/missing.safetensors"
        );
        assert!(!error.is_config());
    }

    #[test]
    fn test_collective_mismatch_display() {
        let error = ZooError::CollectiveMismatch {
            expected: 8,
            actual: 6,
        };
        assert_eq!(
            error.to_string(),
            "collective mismatch: expected length 8, got 6"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: ZooError = io_error.into();
        assert!(matches!(error, ZooError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: ZooError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
        assert!(error.is_config());
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: ZooError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: ZooError = io::Error::new(io::ErrorKind::NotFound, "x").into();
        assert!(error.source().is_some());
    }

    #[test]
    fn test_template_error_conversion() {
        use indicatif::ProgressStyle;

        if let Err(template_error) = ProgressStyle::default_bar().template("{wide_bar:.}") {
            let error: ZooError = template_error.into();
            assert!(error.to_string().contains("template error"));
        }
    }
}
