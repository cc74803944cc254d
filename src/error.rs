use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LayerError {
    #[error("source {source_name} unavailable: {message}")]
    SourceUnavailable {
        source_name: String,
        message: String,
    },

    #[error("source {source_name} returned status {status}: {message}")]
    SourceStatus {
        source_name: String,
        status: u16,
        message: String,
    },

    #[error("failed to decode source {source_name}: {message}")]
    DecodeFailure {
        source_name: String,
        message: String,
    },

    #[error("fetch cancelled: {0}")]
    Cancelled(String),

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("invalid source descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid source name: {0}")]
    InvalidSourceName(String),

    #[error("duplicate region identifier: {0}")]
    DuplicateRegion(String),

    #[error("source not configured or not fetched: {0}")]
    MissingSource(String),

    #[error("unknown layer: {0}")]
    UnknownLayer(String),

    #[error("missing config file metro-layers.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("snapshot not found: {0}")]
    SnapshotMissing(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("HTTP request failed: {0}")]
    Http(String),
}

impl LayerError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LayerError::SourceUnavailable { .. }
                | LayerError::SourceStatus { .. }
                | LayerError::DecodeFailure { .. }
                | LayerError::Cancelled(_)
        )
    }

    pub fn source_name(&self) -> Option<&str> {
        match self {
            LayerError::SourceUnavailable { source_name, .. }
            | LayerError::SourceStatus { source_name, .. }
            | LayerError::DecodeFailure { source_name, .. } => Some(source_name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds() {
        let unavailable = LayerError::SourceUnavailable {
            source_name: "tracts".to_string(),
            message: "timeout".to_string(),
        };
        assert!(unavailable.is_fatal());
        assert_eq!(unavailable.source_name(), Some("tracts"));
        assert!(!LayerError::DegenerateGeometry("ring".to_string()).is_fatal());
        assert!(
            unavailable
                .to_string()
                .contains("source tracts unavailable")
        );
    }
}
