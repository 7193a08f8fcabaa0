use connector_packet::Address;
use std::error::Error as StdError;
use thiserror::Error;

/// Errors for the AddressStore
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AddressStoreError {
    #[error("{0}")]
    Other(#[from] Box<dyn StdError + Send>),
    #[error("could not save address: {0}")]
    SetAddress(Address),
    #[error("could not clear address: {0}")]
    ClearAddress(Address),
}
