use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure taxonomy used for reporting and retry expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network timeouts, remote 5xx, temporary locks. Safe to retry by rerun.
    TransientExternal,
    /// Corrupt archive members, unparseable geometry, encoding mismatches.
    Data,
    /// External binary exited non-zero or emitted a fatal marker.
    Tool,
    /// Environment defects: cross-volume moves, scratch collisions, log access.
    State,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::TransientExternal => "transient_external",
            ErrorClass::Data => "data",
            ErrorClass::Tool => "tool",
            ErrorClass::State => "state",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient_external" => Some(ErrorClass::TransientExternal),
            "data" => Some(ErrorClass::Data),
            "tool" => Some(ErrorClass::Tool),
            "state" => Some(ErrorClass::State),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid locality key: {0}")]
    InvalidLocality(String),

    #[error("invalid product name: {0}")]
    InvalidProduct(String),

    #[error("invalid member key: {0}")]
    InvalidMember(String),

    #[error("invalid group key: {0}")]
    InvalidGroup(String),

    #[error("unknown stage: {0}")]
    InvalidStage(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("catalog response could not be decoded: {0}")]
    CatalogDecode(String),

    #[error("download failed: {0}")]
    TransportHttp(String),

    #[error("download returned status {status}: {message}")]
    TransportStatus { status: u16, message: String },

    #[error("download size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("{program} failed: {message}")]
    ToolFailed { program: String, message: String },

    #[error("{program} timed out after {seconds}s")]
    ToolTimeout { program: String, seconds: u64 },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to relocate {from} to {to}: {message}")]
    Relocation {
        from: String,
        to: String,
        message: String,
    },

    #[error("scratch workspace collision: {0}")]
    ScratchCollision(String),

    #[error("stage log error: {0}")]
    StageLog(String),
}

impl HarvestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HarvestError::CatalogHttp(_)
            | HarvestError::CatalogStatus { .. }
            | HarvestError::TransportHttp(_)
            | HarvestError::TransportStatus { .. }
            | HarvestError::SizeMismatch { .. }
            | HarvestError::ToolTimeout { .. } => ErrorClass::TransientExternal,
            HarvestError::InvalidLocality(_)
            | HarvestError::InvalidProduct(_)
            | HarvestError::InvalidMember(_)
            | HarvestError::InvalidGroup(_)
            | HarvestError::CatalogDecode(_)
            | HarvestError::Archive(_) => ErrorClass::Data,
            HarvestError::MissingTool(_) | HarvestError::ToolFailed { .. } => ErrorClass::Tool,
            HarvestError::InvalidStage(_)
            | HarvestError::ConfigRead(_)
            | HarvestError::ConfigParse(_)
            | HarvestError::ConfigInvalid(_)
            | HarvestError::Filesystem(_)
            | HarvestError::Relocation { .. }
            | HarvestError::ScratchCollision(_)
            | HarvestError::StageLog(_) => ErrorClass::State,
        }
    }

    /// Text stored as the diagnostic of a Failure row.
    pub fn diagnostic(&self) -> String {
        format!("[{}] {}", self.class(), self)
    }
}

impl From<rusqlite::Error> for HarvestError {
    fn from(err: rusqlite::Error) -> Self {
        HarvestError::StageLog(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            HarvestError::TransportStatus {
                status: 503,
                message: "busy".to_string()
            }
            .class(),
            ErrorClass::TransientExternal
        );
        assert_eq!(
            HarvestError::Archive("bad crc".to_string()).class(),
            ErrorClass::Data
        );
        assert_eq!(
            HarvestError::ToolFailed {
                program: "ogr2ogr".to_string(),
                message: "ERROR 1".to_string()
            }
            .class(),
            ErrorClass::Tool
        );
        assert_eq!(
            HarvestError::Relocation {
                from: "a".to_string(),
                to: "b".to_string(),
                message: "EXDEV".to_string()
            }
            .class(),
            ErrorClass::State
        );
    }

    #[test]
    fn diagnostic_carries_class_prefix() {
        let err = HarvestError::Archive("zip entry path traversal detected".to_string());
        assert_eq!(
            err.diagnostic(),
            "[data] archive error: zip entry path traversal detected"
        );
        assert_eq!(ErrorClass::parse("data"), Some(ErrorClass::Data));
    }
}
