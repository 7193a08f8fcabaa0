use super::RouterStore;
use async_trait::async_trait;
use connector_packet::{ErrorCode, RejectBuilder};
use connector_service::{
    AddressStore, IlpResult, IncomingRequest, IncomingService, OutgoingService,
};
use std::collections::HashMap;
use tracing::{error, trace};
use uuid::Uuid;

/// Resolves the next hop for each incoming packet and hands the request to
/// the outgoing half of the switch.
///
/// Note that the router does *not* intercept peer-protocol destinations
/// (`peer.route.*`, `peer.config`) — those services sit in front of it in
/// the chain, so anything reaching the router is meant to be forwarded.
#[derive(Clone)]
pub struct Router<S, O> {
    store: S,
    next: O,
}

impl<S, O> Router<S, O>
where
    S: AddressStore + RouterStore,
    O: OutgoingService<S::Account> + Clone + Send + 'static,
{
    pub fn new(store: S, next: O) -> Self {
        Router { store, next }
    }
}

/// Returns the account id registered under the longest prefix that matches
/// the destination on whole-segment boundaries.
///
/// Tries the destination itself, then progressively shorter segment chains,
/// then the catch-all (empty) prefix. `g.bar` is tried for `g.bar.alice`
/// but never for `g.bart.alice`.
fn resolve_next_hop(routing_table: &HashMap<String, Uuid>, destination: &str) -> Option<Uuid> {
    let mut end = destination.len();
    loop {
        if let Some(account_id) = routing_table.get(&destination[..end]) {
            return Some(*account_id);
        }
        match destination[..end].rfind('.') {
            Some(separator) => end = separator,
            None => break,
        }
    }
    routing_table.get("").copied()
}

#[async_trait]
impl<S, O> IncomingService<S::Account> for Router<S, O>
where
    S: AddressStore + RouterStore,
    O: OutgoingService<S::Account> + Clone + Send + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<S::Account>) -> IlpResult {
        let destination = request.prepare.destination();
        let ilp_address = self.store.get_ilp_address();

        let next_hop = resolve_next_hop(&self.store.routing_table(), &destination);
        let next_hop = match next_hop {
            Some(account_id) => account_id,
            None => {
                error!("No route found for request: {:?}", request);
                return Err(RejectBuilder {
                    code: ErrorCode::F02_UNREACHABLE,
                    message: &[],
                    triggered_by: Some(&ilp_address),
                    data: &[],
                }
                .build());
            }
        };

        let to = match self.store.get_accounts(vec![next_hop]).await {
            Ok(mut accounts) if !accounts.is_empty() => accounts.remove(0),
            other => {
                if let Err(err) = other {
                    error!(
                        "Error loading next-hop account {} for destination {}: {}",
                        next_hop, destination, err
                    );
                }
                return Err(RejectBuilder {
                    code: ErrorCode::T00_INTERNAL_ERROR,
                    message: &[],
                    triggered_by: Some(&ilp_address),
                    data: &[],
                }
                .build());
            }
        };
        trace!(
            "Forwarding request for destination {} to account {}",
            destination,
            next_hop
        );
        self.next.send_request(request.into_outgoing(to)).await
    }
}
