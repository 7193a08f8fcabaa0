//! # connector-ccp
//!
//! Implementation of the Connector-to-Connector Protocol (CCP) used to
//! exchange routing information between peers, plus the routing tables it
//! maintains.
//!
//! Route updates ride inside ordinary ILP Prepare packets addressed to the
//! reserved `peer.route.*` destinations, so they flow through the same
//! packet switch as everything else and are intercepted by the
//! [`CcpRouteManager`](./struct.CcpRouteManager.html) before reaching the
//! router.

#[cfg(test)]
mod fixtures;
mod packet;
mod routing_table;
mod server;
#[cfg(test)]
mod test_helpers;

pub use packet::{Mode, Route, RouteControlRequest, RouteProp, RouteUpdateRequest};
pub use packet::{
    CCP_CONTROL_DESTINATION, CCP_RESPONSE, CCP_UPDATE_DESTINATION, PEER_PROTOCOL_CONDITION,
    PEER_PROTOCOL_FULFILLMENT,
};
pub use routing_table::RoutingTable;
pub use server::{CcpRouteManager, CcpRouteManagerBuilder};

use async_trait::async_trait;
use connector_errors::CcpRoutingStoreError;
use connector_service::Account;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// How an account relates to us in the routing graph.
///
/// The numeric order matters: when ranking otherwise equal routes, a route
/// learned from a child wins over one learned from a peer, which wins over
/// one learned from a parent.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoutingRelation {
    Parent = 1,
    Peer = 2,
    Child = 3,
}

impl RoutingRelation {
    /// Whether a route learned from an account with this relation may be
    /// re-advertised to an account with the `target` relation.
    ///
    /// Routes learned from children are fair game for everyone. Routes
    /// learned from peers or parents must only flow downhill to children,
    /// otherwise we would offer to carry traffic between our providers.
    pub fn allows_advertising_to(self, target: RoutingRelation) -> bool {
        match self {
            RoutingRelation::Child => true,
            RoutingRelation::Peer | RoutingRelation::Parent => {
                target == RoutingRelation::Child
            }
        }
    }
}

/// Account attributes the route manager needs.
pub trait CcpRoutingAccount: Account {
    /// The type of relationship we have with this account
    fn routing_relation(&self) -> RoutingRelation;

    /// Indicates whether we should send CCP Route Updates to this account
    fn should_send_routes(&self) -> bool {
        false
    }

    /// Indicates whether we should accept CCP Route Update Requests from this account
    fn should_receive_routes(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait CcpRoutingStore: Clone {
    type Account: CcpRoutingAccount;

    /// Accounts we broadcast route updates to, minus the ones listed in
    /// `ignore_accounts` (used to skip peers that keep erroring).
    async fn get_accounts_to_send_routes_to(
        &self,
        ignore_accounts: Vec<Uuid>,
    ) -> Result<Vec<Self::Account>, CcpRoutingStoreError>;

    async fn get_accounts_to_receive_routes_from(
        &self,
    ) -> Result<Vec<Self::Account>, CcpRoutingStoreError>;

    /// The routes we know about without any peer's help: one map of the
    /// accounts directly reachable on our own node, one map of statically
    /// configured prefixes.
    async fn get_local_and_configured_routes(
        &self,
    ) -> Result<
        (
            HashMap<String, Self::Account>,
            HashMap<String, Self::Account>,
        ),
        CcpRoutingStoreError,
    >;

    /// Atomically replaces the forwarding snapshot used by the router.
    async fn set_routes(
        &mut self,
        routes: Vec<(String, Self::Account)>,
    ) -> Result<(), CcpRoutingStoreError>;
}
