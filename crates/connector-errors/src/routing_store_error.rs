use super::AccountStoreError;
use std::error::Error as StdError;
use thiserror::Error;

/// Errors for the CcpRoutingStore
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CcpRoutingStoreError {
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + 'static>),
}

impl From<AccountStoreError> for CcpRoutingStoreError {
    fn from(src: AccountStoreError) -> Self {
        CcpRoutingStoreError::Other(Box::new(src))
    }
}
