//! Structured autoscaler errors.
//!
//! Every failure that crosses the orchestrator boundary is an
//! `AutoscalerError`: a kind plus a message that callers extend with
//! context via [`AutoscalerError::add_prefix`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AutoscalerResult<T> = Result<T, AutoscalerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A cloud provider call failed.
    CloudProvider,
    /// A Kubernetes API call failed.
    ApiCall,
    /// An invariant was violated.
    Internal,
    /// A limit was reached for this tick; retrying later may succeed.
    Transient,
    /// User-supplied configuration is invalid.
    Configuration,
    /// The provider does not know the node group.
    NodeGroupDoesNotExist,
}

impl ErrorKind {
    /// Stable name used for sorting, metric labels and log output.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::CloudProvider => "cloudProviderError",
            ErrorKind::ApiCall => "apiCallError",
            ErrorKind::Internal => "internalError",
            ErrorKind::Transient => "transientError",
            ErrorKind::Configuration => "configurationError",
            ErrorKind::NodeGroupDoesNotExist => "nodeGroupDoesNotExistError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct AutoscalerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AutoscalerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cloud_provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CloudProvider, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Wrap any error, keeping its display text as the message.
    pub fn from_error(kind: ErrorKind, err: impl fmt::Display) -> Self {
        Self::new(kind, err.to_string())
    }

    /// Prepend context to the message, keeping the kind.
    pub fn add_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.message = format!("{}{}", prefix.as_ref(), self.message);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_keeps_kind() {
        let err = AutoscalerError::cloud_provider("quota exceeded")
            .add_prefix("failed to increase node group size: ");
        assert_eq!(err.kind, ErrorKind::CloudProvider);
        assert_eq!(
            err.to_string(),
            "failed to increase node group size: quota exceeded"
        );
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ErrorKind::Internal.as_str(), "internalError");
        assert_eq!(
            ErrorKind::NodeGroupDoesNotExist.to_string(),
            "nodeGroupDoesNotExistError"
        );
    }
}
