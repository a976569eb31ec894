use thiserror::Error;

use crate::api::ApiError;
use crate::cache::MergeError;

use super::ResourceKind;

/// Why a refresh reported `false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Could not merge response: {0}")]
    Merge(#[from] MergeError),

    #[error("Refresh of {0} failed")]
    Dependency(ResourceKind),

    #[error("Not logged in")]
    NotLoggedIn,
}
