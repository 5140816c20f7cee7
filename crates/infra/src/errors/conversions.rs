//! Conversions from external infrastructure errors into domain errors.

use std::io::{Error as IoError, ErrorKind};

use relaysync_domain::RelaySyncError;
use serde_json::Error as JsonError;
use toml::de::Error as TomlError;

/// Error newtype that keeps conversions on the infrastructure side and can be
/// converted back into the domain error.
#[derive(Debug)]
pub struct InfraError(pub RelaySyncError);

impl From<InfraError> for RelaySyncError {
    fn from(value: InfraError) -> Self {
        value.0
    }
}

impl From<RelaySyncError> for InfraError {
    fn from(value: RelaySyncError) -> Self {
        InfraError(value)
    }
}

trait IntoRelaySyncError {
    fn into_relaysync(self) -> RelaySyncError;
}

/* -------------------------------------------------------------------------- */
/* std::io::Error → RelaySyncError */
/* -------------------------------------------------------------------------- */

impl IntoRelaySyncError for IoError {
    fn into_relaysync(self) -> RelaySyncError {
        match self.kind() {
            ErrorKind::NotFound => RelaySyncError::NotFound(self.to_string()),
            ErrorKind::PermissionDenied => {
                RelaySyncError::Source(format!("permission denied: {self}"))
            }
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
                RelaySyncError::InvalidInput(self.to_string())
            }
            _ => RelaySyncError::Internal(format!("i/o failure: {self}")),
        }
    }
}

/* -------------------------------------------------------------------------- */
/* serde_json::Error → RelaySyncError */
/* -------------------------------------------------------------------------- */

impl IntoRelaySyncError for JsonError {
    fn into_relaysync(self) -> RelaySyncError {
        if self.is_io() {
            return RelaySyncError::Internal(format!("i/o failure while encoding JSON: {self}"));
        }
        RelaySyncError::InvalidInput(format!("invalid JSON at line {}: {self}", self.line()))
    }
}

/* -------------------------------------------------------------------------- */
/* toml::de::Error → RelaySyncError */
/* -------------------------------------------------------------------------- */

impl IntoRelaySyncError for TomlError {
    fn into_relaysync(self) -> RelaySyncError {
        RelaySyncError::Config(format!("invalid TOML: {}", self.message()))
    }
}

impl From<IoError> for InfraError {
    fn from(value: IoError) -> Self {
        InfraError(value.into_relaysync())
    }
}

impl From<JsonError> for InfraError {
    fn from(value: JsonError) -> Self {
        InfraError(value.into_relaysync())
    }
}

impl From<TomlError> for InfraError {
    fn from(value: TomlError) -> Self {
        InfraError(value.into_relaysync())
    }
}
