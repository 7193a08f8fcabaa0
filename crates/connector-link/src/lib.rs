//! The link abstraction: a bidirectional channel to one counterparty.
//!
//! Concrete transports (BTP over WebSockets, ILP-over-HTTP, ...) live outside
//! the core and only need to implement [`Link`](./trait.Link.html). The
//! [`LinkManager`](./struct.LinkManager.html) owns the registry of links,
//! exposes them to the switch as an `OutgoingService`, publishes typed
//! connectivity events, and trips a per-link circuit breaker when a peer
//! keeps failing.

mod manager;
mod mock;
mod secrets;

pub use manager::{LinkEvent, LinkManager};
pub use mock::MockLink;
pub use secrets::{Decryptor, NoopDecryptor};

use async_trait::async_trait;
use connector_errors::LinkError;
use connector_packet::Prepare;
use connector_service::IlpResult;

/// A bidirectional channel to a peer or counterparty.
///
/// Implementations own their transport's lifecycle. `send_packet` resolves
/// with the peer's Fulfill or Reject; transport-level failures must be
/// surfaced as a `T01` Reject so the switch always gets exactly one response
/// packet per prepare.
#[async_trait]
pub trait Link: Clone + Send + Sync + 'static {
    async fn connect(&self) -> Result<(), LinkError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn send_packet(&self, prepare: Prepare) -> IlpResult;
}
