//! Cloud provider error types.

use kubescale_core::{AutoscalerError, ErrorKind};
use thiserror::Error;

pub type CloudProviderResult<T> = Result<T, CloudProviderError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudProviderError {
    /// The provider does not support the operation.
    #[error("not implemented")]
    NotImplemented,

    #[error("node group {0} does not exist")]
    NodeGroupDoesNotExist(String),

    #[error("{0}")]
    Provider(String),
}

impl From<CloudProviderError> for AutoscalerError {
    fn from(err: CloudProviderError) -> Self {
        let kind = match err {
            CloudProviderError::NodeGroupDoesNotExist(_) => ErrorKind::NodeGroupDoesNotExist,
            _ => ErrorKind::CloudProvider,
        };
        AutoscalerError::from_error(kind, err)
    }
}
