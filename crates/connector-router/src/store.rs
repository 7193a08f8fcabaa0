use connector_service::AccountStore;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A store that keeps a forwarding snapshot of the routing table.
///
/// The snapshot is immutable and shared; route updates swap in a fresh `Arc`
/// so that readers never wait on a writer.
pub trait RouterStore: AccountStore + Clone + Send + Sync + 'static {
    /// The current forwarding table: address prefix (`""` is the catch-all)
    /// to next-hop account id.
    fn routing_table(&self) -> Arc<HashMap<String, Uuid>>;
}
