use std::error::Error as StdError;
use thiserror::Error;

/// Errors for the AccountStore
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AccountStoreError {
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + 'static>),
    #[error("account `{0}` was not found")]
    AccountNotFound(String),
    #[error("account `{0}` already exists")]
    AccountExists(String),
    #[error("account `{0}` was deleted")]
    AccountDeleted(String),
    #[error("invalid account settings: {0}")]
    InvalidAccountSettings(String),
    #[error("wrong account length (expected {expected}, got {actual})")]
    WrongLength { expected: usize, actual: usize },
}
