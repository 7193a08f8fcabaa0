//! Error types shared by the connector's store traits.
//!
//! Every store concern gets its own error enum so that services can translate
//! failures into the right ILP reject code without inspecting strings.

mod account_store_error;
pub use account_store_error::AccountStoreError;

mod address_store_error;
pub use address_store_error::AddressStoreError;

mod balance_store_error;
pub use balance_store_error::BalanceStoreError;

mod routing_store_error;
pub use routing_store_error::CcpRoutingStoreError;

mod link_error;
pub use link_error::LinkError;
