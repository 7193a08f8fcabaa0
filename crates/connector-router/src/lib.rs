//! # connector-router
//!
//! Turns an incoming request into an outgoing one by resolving the next hop
//! for the packet's destination from the store's routing table snapshot.
//!
//! The table snapshot maps address prefixes to the account id of the next
//! hop. The router picks the longest prefix that matches the destination on
//! whole-segment boundaries; the route-control subsystem is responsible for
//! keeping the snapshot up to date.

mod router;
mod store;

pub use router::Router;
pub use store::RouterStore;
