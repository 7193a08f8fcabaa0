use std::error::Error as StdError;
use thiserror::Error;
use uuid::Uuid;

/// Errors for the BalanceStore
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BalanceStoreError {
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + 'static>),
    /// The reservation would have pushed the account's net balance below its
    /// configured minimum.
    #[error("insufficient balance on account {account_id}: net {net} cannot cover {amount}")]
    InsufficientBalance {
        account_id: Uuid,
        net: i64,
        amount: u64,
    },
    /// Settlement amounts must be positive signed integers.
    #[error("amount `{0}` must be a positive signed integer")]
    NegativeAmount(i64),
}
