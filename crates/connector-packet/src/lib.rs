//! ILP packet serialization/deserialization.
//!
//! Everything on the wire is ASN.1 OER. The `oer` module holds the
//! primitives, `packet` the Prepare/Fulfill/Reject envelopes and `address`
//! the validated address and routing-prefix types.

mod address;
mod error;
mod errors;
pub mod oer;
mod packet;

pub use self::address::{Address, AddressError, AddressPrefix};
pub use self::error::{ErrorClass, ErrorCode};
pub use self::errors::ParseError;

pub use self::packet::{Fulfill, Packet, PacketType, Prepare, Reject};
pub use self::packet::{FulfillBuilder, PrepareBuilder, RejectBuilder};
pub use self::packet::MaxPacketAmountDetails;
