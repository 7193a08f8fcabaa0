use std::error::Error as StdError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by links and the link manager
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send + 'static>),
    #[error("no link registered for account {0}")]
    NoLink(Uuid),
    #[error("link for account {0} is not connected")]
    NotConnected(Uuid),
    #[error("link for account {0} is tripped, skipping {1} more attempts")]
    CircuitOpen(Uuid, u8),
    #[error("could not decrypt link secret")]
    Decrypt,
    #[error("could not connect: {0}")]
    Connect(String),
}
