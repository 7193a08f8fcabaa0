//! # connector-ildcp
//!
//! Server implementation of the [Interledger Dynamic Configuration Protocol (IL-DCP)](https://github.com/interledger/rfcs/blob/master/0031-dynamic-configuration-protocol/0031-dynamic-configuration-protocol.md).
//!
//! Child accounts query `peer.config` for the ILP address and asset details
//! they should operate under; the connector answers locally, derived from
//! its own address and the child's account settings.

mod packet;
mod server;

pub use packet::{is_ildcp_request, IldcpRequest, IldcpResponse, IldcpResponseBuilder};
pub use server::IldcpService;
