use crate::{
    packet::{
        Mode, Route, RouteControlRequest, RouteUpdateRequest, CCP_CONTROL_DESTINATION,
        CCP_RESPONSE, CCP_UPDATE_DESTINATION,
    },
    routing_table::{best_of, RoutingTable},
    CcpRoutingAccount, CcpRoutingStore, RoutingRelation,
};
use async_trait::async_trait;
use connector_errors::CcpRoutingStoreError;
use connector_packet::{Address, ErrorCode, RejectBuilder};
use connector_service::{
    Account, AddressStore, IlpResult, IncomingRequest, IncomingService, OutgoingRequest,
    OutgoingService,
};
use parking_lot::{Mutex, RwLock};
use ring::digest::{digest, SHA256};
use std::collections::HashMap;
use std::{
    cmp::min,
    str,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Hold-down time advertised with our route updates, in milliseconds.
const DEFAULT_ROUTE_EXPIRY_TIME: u32 = 30000;
const DEFAULT_BROADCAST_INTERVAL: u64 = 30000;
const DUMMY_ROUTING_TABLE_ID: [u8; 16] = [0; 16];

fn hash(preimage: &[u8; 32]) -> [u8; 32] {
    let mut out = [0; 32];
    out.copy_from_slice(digest(&SHA256, preimage).as_ref());
    out
}

/// One epoch's worth of changes: the routes added (tagged with the relation
/// they were learned from, for the re-advertisement eligibility check) and
/// the prefixes withdrawn.
type EpochChanges = (Vec<(Route, RoutingRelation)>, Vec<String>);

/// What we know about one peer's routing table, tracked between updates.
#[derive(Clone, Copy, Debug)]
struct PeerSyncState {
    routing_table_id: [u8; 16],
    /// The next `from_epoch_index` we expect from this peer.
    epoch: u32,
}

#[derive(Debug)]
struct BackoffParams {
    /// The total number of route broadcast intervals we should wait before
    /// trying again. Incremented for each broadcast failure.
    max: u8,
    /// How many more intervals we should wait before trying to send again
    /// (0 means we should try again on the next loop)
    skip_intervals: u8,
}

/// Builder for [CcpRouteManager](./struct.CcpRouteManager.html).
pub struct CcpRouteManagerBuilder<I, O, S> {
    /// The next incoming handler, used for requests that are not CCP messages.
    next_incoming: I,
    /// The outgoing handler used to send CCP messages. Note this bypasses
    /// the Router because updates go to specific peers.
    outgoing: O,
    store: S,
    ilp_address: Address,
    broadcast_interval: u64,
}

impl<I, O, S, A> CcpRouteManagerBuilder<I, O, S>
where
    I: IncomingService<A> + Clone + Send + Sync + 'static,
    O: OutgoingService<A> + Clone + Send + Sync + 'static,
    S: AddressStore + CcpRoutingStore<Account = A> + Clone + Send + Sync + 'static,
    A: CcpRoutingAccount + Send + Sync + 'static,
{
    pub fn new(ilp_address: Address, store: S, outgoing: O, next_incoming: I) -> Self {
        CcpRouteManagerBuilder {
            ilp_address,
            next_incoming,
            outgoing,
            store,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
        }
    }

    /// Set the broadcast interval (in milliseconds)
    pub fn broadcast_interval(&mut self, ms: u64) -> &mut Self {
        self.broadcast_interval = ms;
        self
    }

    pub fn to_service(&self) -> CcpRouteManager<I, O, S, A> {
        let service = CcpRouteManager {
            ilp_address: Arc::new(RwLock::new(self.ilp_address.clone())),
            next_incoming: self.next_incoming.clone(),
            outgoing: self.outgoing.clone(),
            store: self.store.clone(),
            forwarding_table: Arc::new(RwLock::new(RoutingTable::default())),
            forwarding_table_updates: Arc::new(RwLock::new(Vec::new())),
            last_epoch_updates_sent_for: Arc::new(AtomicU32::new(0)),
            local_table: Arc::new(RwLock::new(RoutingTable::default())),
            learned_table: Arc::new(RwLock::new(RoutingTable::default())),
            peer_sync_states: Arc::new(RwLock::new(HashMap::new())),
            unavailable_accounts: Arc::new(Mutex::new(HashMap::new())),
        };

        #[cfg(not(test))]
        {
            let broadcast_interval = self.broadcast_interval;
            let service_clone = service.clone();
            tokio::spawn(async move {
                service_clone
                    .start_broadcast_interval(broadcast_interval)
                    .await
            });
        }

        service
    }
}

/// The routing manager: handles incoming CCP messages, tracks what each
/// peer has told us, keeps the local and forwarding tables up to date and
/// broadcasts our own updates.
#[derive(Clone)]
pub struct CcpRouteManager<I, O, S, A: Account> {
    ilp_address: Arc<RwLock<Address>>,
    /// The next incoming handler, used for requests that are not CCP messages.
    next_incoming: I,
    /// The outgoing handler used to send CCP messages. Note this bypasses
    /// the Router because updates go to specific peers.
    outgoing: O,
    /// The table we advertise to our peers: the local table with our own
    /// address pushed onto each route's path.
    forwarding_table: Arc<RwLock<RoutingTable<A>>>,
    last_epoch_updates_sent_for: Arc<AtomicU32>,
    /// Index 0 holds the transition from epoch 0 to epoch 1.
    forwarding_table_updates: Arc<RwLock<Vec<EpochChanges>>>,
    /// The best route we currently use for each prefix, combining
    /// configuration and everything peers have broadcast. Saved to the store
    /// so the Router forwards according to it.
    local_table: Arc<RwLock<RoutingTable<A>>>,
    /// Every route peers have advertised to us, keyed (prefix, peer).
    /// Multiple peers may advertise the same prefix; reconciliation per peer
    /// is tracked in `peer_sync_states`.
    learned_table: Arc<RwLock<RoutingTable<A>>>,
    peer_sync_states: Arc<RwLock<HashMap<Uuid, PeerSyncState>>>,
    store: S,
    /// If broadcasts to an account keep failing we back off before retrying.
    /// Maps the account id to the number of broadcast intervals to skip.
    unavailable_accounts: Arc<Mutex<HashMap<Uuid, BackoffParams>>>,
}

impl<I, O, S, A> CcpRouteManager<I, O, S, A>
where
    I: IncomingService<A> + Clone + Send + Sync + 'static,
    O: OutgoingService<A> + Clone + Send + Sync + 'static,
    S: AddressStore + CcpRoutingStore<Account = A> + Clone + Send + Sync + 'static,
    A: CcpRoutingAccount + Send + Sync + 'static,
{
    /// Runs forever, requesting routes on startup and then broadcasting
    /// updates to peers every `interval` milliseconds.
    pub async fn start_broadcast_interval(&self, interval: u64) {
        self.request_all_routes().await;
        let mut interval = tokio::time::interval(Duration::from_millis(interval));
        loop {
            interval.tick().await;
            // ensure we have the latest ILP Address from the store
            self.update_ilp_address();
            // Do not consume the result if an error since we want to keep the loop going
            let _ = self.broadcast_routes().await;
        }
    }

    fn update_ilp_address(&self) {
        let current_ilp_address = self.ilp_address.read();
        let ilp_address = self.store.get_ilp_address();
        if ilp_address != *current_ilp_address {
            debug!(
                "Changing ILP address from {} to {}",
                *current_ilp_address, ilp_address
            );
            // release the read lock
            drop(current_ilp_address);
            *self.ilp_address.write() = ilp_address;
        }
    }

    pub async fn broadcast_routes(&self) -> Result<(), CcpRoutingStoreError> {
        self.update_best_routes(None).await?;
        self.send_route_updates().await
    }

    /// Request routes from all the peers we are willing to receive routes
    /// from, mostly for when the server starts up without any.
    async fn request_all_routes(&self) {
        let accounts = self
            .store
            .get_accounts_to_receive_routes_from()
            .await
            .unwrap_or_else(|_| Vec::new());
        for account in accounts {
            self.send_route_control_request(account, DUMMY_ROUTING_TABLE_ID, 0)
                .await;
        }
    }

    /// Handle a CCP Route Control Request. If it comes from an account we
    /// broadcast routes to, reply with a Route Update Request for the epochs
    /// it is missing.
    async fn handle_route_control_request(&self, request: IncomingRequest<A>) -> IlpResult {
        if !request.from.should_send_routes() {
            return Err(RejectBuilder {
                code: ErrorCode::F00_BAD_REQUEST,
                message: b"We are not configured to send routes to you, sorry",
                triggered_by: Some(&self.ilp_address.read()),
                data: &[],
            }
            .build());
        }

        let control = match RouteControlRequest::try_from(&request.prepare) {
            Ok(control) => control,
            Err(_) => {
                return Err(RejectBuilder {
                    code: ErrorCode::F00_BAD_REQUEST,
                    message: b"Invalid route control request",
                    triggered_by: Some(&self.ilp_address.read()),
                    data: &[],
                }
                .build());
            }
        };
        debug!(
            "Got route control request from account {} (id: {}): {:?}",
            request.from.username(),
            request.from.id(),
            control
        );

        if control.mode == Mode::Sync {
            // Don't skip them in the route update broadcasts anymore since
            // this tells us that they are online
            {
                let mut unavailable_accounts = self.unavailable_accounts.lock();
                if unavailable_accounts.remove(&request.from.id()).is_some() {
                    debug!(
                        "Account {} (id: {}) is no longer unavailable, will resume broadcasting routes to it",
                        request.from.username(),
                        request.from.id()
                    );
                }
            }

            let (from_epoch_index, to_epoch_index) = {
                let forwarding_table = self.forwarding_table.read();
                let to_epoch_index = forwarding_table.epoch();
                let from_epoch_index =
                    if control.last_known_routing_table_id != forwarding_table.id() {
                        0
                    } else {
                        min(control.last_known_epoch, to_epoch_index)
                    };
                (from_epoch_index, to_epoch_index)
            };

            #[cfg(test)]
            self.send_route_update(request.from.clone(), from_epoch_index, to_epoch_index)
                .await;

            #[cfg(not(test))]
            {
                tokio::spawn({
                    let self_clone = self.clone();
                    async move {
                        self_clone
                            .send_route_update(
                                request.from.clone(),
                                from_epoch_index,
                                to_epoch_index,
                            )
                            .await
                    }
                });
            }
        }
        Ok(CCP_RESPONSE.clone())
    }

    /// Remove invalid routes before processing the Route Update Request
    fn filter_routes(&self, mut update: RouteUpdateRequest) -> RouteUpdateRequest {
        update.new_routes.retain(|route| {
            let ilp_address = self.ilp_address.read();
            let address_scheme = ilp_address.scheme();
            if !route.prefix.starts_with(address_scheme) {
                warn!("Got route for a different global prefix: {:?}", route);
                false
            } else if route.prefix.len() <= address_scheme.len() + 1 {
                // note the + 1 is due to address_scheme not including a trailing "."
                warn!("Got route broadcast for the global prefix: {:?}", route);
                false
            } else if route.prefix.starts_with(&ilp_address as &str) {
                debug!(
                    "Ignoring route broadcast for a prefix that starts with our own address: {:?}",
                    route
                );
                false
            } else if route.path.iter().any(|hop| hop == &ilp_address as &str) {
                debug!(
                    "Ignoring route broadcast for a route that includes us: {:?}",
                    route
                );
                false
            } else {
                true
            }
        });
        update
    }

    /// Reconciles a (filtered) Route Update Request against what we have
    /// learned from this peer so far.
    ///
    /// A different routing table id means the peer rebuilt its table: we
    /// discard everything previously learned from it and re-baseline at the
    /// request's `from` epoch. A `from` epoch beyond the one we expect means
    /// we missed updates and must ask for a full resync, so nothing is
    /// applied. Anything up to and including the current epoch is a
    /// duplicate and ignored. Only then are the withdrawals and inserts
    /// applied, all of them or none, and the tracked epoch advanced to `to`.
    ///
    /// Returns the prefixes whose routes changed.
    fn apply_route_update(
        &self,
        peer: &A,
        update: RouteUpdateRequest,
    ) -> Result<Vec<String>, String> {
        let mut learned_table = self.learned_table.write();
        let mut sync_states = self.peer_sync_states.write();
        let state = sync_states
            .entry(peer.id())
            .or_insert_with(|| PeerSyncState {
                routing_table_id: update.routing_table_id,
                epoch: 0,
            });

        let mut changed_prefixes = Vec::new();

        if state.routing_table_id != update.routing_table_id {
            debug!(
                "Saw new routing table. Old ID: {}, new ID: {}",
                hex::encode(state.routing_table_id),
                hex::encode(update.routing_table_id)
            );
            changed_prefixes.extend(learned_table.remove_all_routes_from(peer.id()));
            state.routing_table_id = update.routing_table_id;
            state.epoch = update.from_epoch_index;
        }

        if update.from_epoch_index > state.epoch {
            return Err(format!(
                "Gap in routing table. Expected epoch: {}, got from_epoch: {}",
                state.epoch, update.from_epoch_index
            ));
        }

        if update.to_epoch_index <= state.epoch {
            trace!(
                "Ignoring duplicate routing update for epoch: {}",
                state.epoch
            );
            return Ok(changed_prefixes);
        }

        if update.new_routes.is_empty() && update.withdrawn_routes.is_empty() {
            trace!(
                "Got heartbeat route update for table ID: {}, epoch: {}",
                hex::encode(state.routing_table_id),
                state.epoch
            );
            state.epoch = update.to_epoch_index;
            return Ok(changed_prefixes);
        }

        for prefix in update.withdrawn_routes.iter() {
            if learned_table.remove_route(prefix, peer.id()) {
                changed_prefixes.push(prefix.clone());
            }
        }

        for route in update.new_routes.into_iter() {
            let prefix = route.prefix.clone();
            if learned_table.add_route(peer.clone(), route) {
                changed_prefixes.push(prefix);
            }
        }

        state.epoch = update.to_epoch_index;
        trace!(
            "Applied update from peer {}, next expected epoch: {}",
            peer.id(),
            state.epoch
        );

        Ok(changed_prefixes)
    }

    /// Check if this Route Update Request is valid and, if so, apply it.
    /// If it changed anything we recheck which routes are now best.
    async fn handle_route_update_request(&self, request: IncomingRequest<A>) -> IlpResult {
        // Ignore the request if we don't accept routes from them
        if !request.from.should_receive_routes() {
            return Err(RejectBuilder {
                code: ErrorCode::F00_BAD_REQUEST,
                message: b"Your route broadcasts are not accepted here",
                triggered_by: Some(&self.ilp_address.read()),
                data: &[],
            }
            .build());
        }

        let update = match RouteUpdateRequest::try_from(&request.prepare) {
            Ok(update) => update,
            Err(_) => {
                return Err(RejectBuilder {
                    code: ErrorCode::F00_BAD_REQUEST,
                    message: b"Invalid route update request",
                    triggered_by: Some(&self.ilp_address.read()),
                    data: &[],
                }
                .build());
            }
        };
        debug!(
            "Got route update request from account {}: {:?}",
            request.from.id(),
            update
        );

        // Filter out routes that don't make sense or that we won't accept
        let update = self.filter_routes(update);

        match self.apply_route_update(&request.from, update) {
            Ok(prefixes_updated) => {
                if prefixes_updated.is_empty() {
                    trace!("Route update request did not contain any prefixes we need to update our routes for");
                    return Ok(CCP_RESPONSE.clone());
                }

                debug!(
                    "Recalculating best routes for prefixes: {}",
                    prefixes_updated.join(", ")
                );

                #[cfg(not(test))]
                {
                    tokio::spawn({
                        let self_clone = self.clone();
                        async move { self_clone.update_best_routes(Some(prefixes_updated)).await }
                    });
                }

                #[cfg(test)]
                {
                    let ilp_address = self.ilp_address.clone();
                    if self
                        .update_best_routes(Some(prefixes_updated))
                        .await
                        .is_err()
                    {
                        return Err(RejectBuilder {
                            code: ErrorCode::T00_INTERNAL_ERROR,
                            message: b"Error processing route update",
                            data: &[],
                            triggered_by: Some(&ilp_address.read()),
                        }
                        .build());
                    }
                }
                Ok(CCP_RESPONSE.clone())
            }
            Err(message) => {
                warn!("Error handling incoming Route Update request, sending a Route Control request to get updated routing table info from peer. Error was: {}", &message);
                let reject = RejectBuilder {
                    code: ErrorCode::F00_BAD_REQUEST,
                    message: message.as_bytes(),
                    data: &[],
                    triggered_by: Some(&self.ilp_address.read()),
                }
                .build();

                let (table_id, epoch) = {
                    let sync_states = self.peer_sync_states.read();
                    let state = &sync_states[&request.from.id()];
                    (state.routing_table_id, state.epoch)
                };

                #[cfg(not(test))]
                tokio::spawn({
                    let self_clone = self.clone();
                    let account = request.from.clone();
                    async move {
                        self_clone
                            .send_route_control_request(account, table_id, epoch)
                            .await;
                    }
                });

                #[cfg(test)]
                self.send_route_control_request(request.from.clone(), table_id, epoch)
                    .await;
                Err(reject)
            }
        }
    }

    /// Request a Route Update from the specified peer. This is sent when we
    /// get a Route Update Request from them with a gap in the epochs since
    /// the last one we saw.
    async fn send_route_control_request(
        &self,
        account: A,
        last_known_routing_table_id: [u8; 16],
        last_known_epoch: u32,
    ) {
        let account_id = account.id();
        let control = RouteControlRequest {
            mode: Mode::Sync,
            last_known_routing_table_id,
            last_known_epoch,
            features: Vec::new(),
        };
        debug!(
            "Sending Route Control Request to account: {} (id: {}), last known table id: {}, last known epoch: {}",
            account.username(),
            account_id,
            hex::encode(last_known_routing_table_id),
            last_known_epoch
        );
        let prepare = control.to_prepare();
        let result = self
            .outgoing
            .clone()
            .send_request(OutgoingRequest {
                // Route control messages are exchanged directly with the
                // peer, so it is both the from and the to account.
                from: account.clone(),
                to: account,
                original_amount: prepare.amount(),
                prepare,
            })
            .await;

        if let Err(err) = result {
            warn!(
                "Error sending Route Control Request to account {}: {:?}",
                account_id, err
            )
        }
    }

    /// Check whether the Local Routing Table currently has the best routes
    /// for the given prefixes. This is triggered when an incoming Route
    /// Update Request contains new or modified routes that might be better
    /// than our existing ones.
    ///
    /// If `prefixes` is None, check every prefix we know about.
    async fn update_best_routes(
        &self,
        prefixes: Option<Vec<String>>,
    ) -> Result<(), CcpRoutingStoreError> {
        let (local_routes, configured_routes) =
            self.store.get_local_and_configured_routes().await?;
        let ilp_address = self.ilp_address.read().clone();
        let mut store = self.store.clone();

        let (better_routes, withdrawn_routes) = {
            // Note we only use a read lock here and later get a write lock
            // if we need to update the tables
            let local_table = self.local_table.read();
            let learned_table = self.learned_table.read();

            let prefixes_to_check: Vec<String> = if let Some(prefixes) = prefixes {
                prefixes
            } else {
                let mut prefixes: Vec<String> = configured_routes
                    .keys()
                    .chain(local_routes.keys())
                    .cloned()
                    .collect();
                prefixes.extend(learned_table.iter().map(|(prefix, _)| prefix.clone()));
                prefixes.sort();
                prefixes.dedup();
                prefixes
            };

            // See which prefixes now have a different best route and which
            // ones are no longer routable at all
            let mut better_routes: Vec<(String, A, Route)> =
                Vec::with_capacity(prefixes_to_check.len());
            let mut withdrawn_routes: Vec<String> = Vec::new();
            for prefix in prefixes_to_check {
                if let Some((best_next_account, best_route)) = get_best_route_for_prefix(
                    &local_routes,
                    &configured_routes,
                    &learned_table,
                    &prefix,
                ) {
                    if let Some((next_account, _)) = best_of(local_table.get_routes_for(&prefix))
                    {
                        if next_account.id() == best_next_account.id() {
                            continue;
                        }
                    }
                    better_routes.push((prefix, best_next_account, best_route));
                } else if local_table.get_routes_for(&prefix).is_empty() {
                    // Nothing to withdraw either
                    continue;
                } else {
                    // No longer have a route to this prefix
                    withdrawn_routes.push(prefix);
                }
            }
            (better_routes, withdrawn_routes)
        };

        // Update the local and forwarding tables
        if !better_routes.is_empty() || !withdrawn_routes.is_empty() {
            let update_routes = {
                let mut local_table = self.local_table.write();
                let mut forwarding_table = self.forwarding_table.write();
                let mut forwarding_table_updates = self.forwarding_table_updates.write();

                let mut new_routes: Vec<(Route, RoutingRelation)> =
                    Vec::with_capacity(better_routes.len());

                for (prefix, account, mut route) in better_routes {
                    debug!(
                        "Setting new route for prefix: {} -> Account: {} (id: {})",
                        prefix,
                        account.username(),
                        account.id(),
                    );
                    local_table.set_route(prefix.clone(), account.clone(), route.clone());

                    // Update the forwarding table

                    // Don't advertise routes that don't start with the
                    // global prefix or that advertise the whole global prefix
                    let address_scheme = ilp_address.scheme();
                    let correct_address_scheme = route.prefix.starts_with(address_scheme)
                        && route.prefix != address_scheme;
                    // We do want to advertise our address
                    let is_our_address = route.prefix == &ilp_address as &str;
                    // Don't advertise local routes because advertising only
                    // our address will be enough to ensure the packet gets
                    // to us and we can route it to the correct account
                    let is_local_route =
                        route.prefix.starts_with(&ilp_address as &str) && route.path.is_empty();
                    let not_local_route = is_our_address || !is_local_route;
                    // Don't include routes we're also withdrawing
                    let not_withdrawn_route = !withdrawn_routes.contains(&prefix);

                    if correct_address_scheme && not_local_route && not_withdrawn_route {
                        let old_route = best_of(forwarding_table.get_routes_for(&prefix));
                        if old_route.is_none() || old_route.unwrap().0.id() != account.id() {
                            route.path.insert(0, ilp_address.to_string());
                            // Each hop hashes the auth before forwarding
                            route.auth = hash(&route.auth);
                            forwarding_table.set_route(
                                prefix.clone(),
                                account.clone(),
                                route.clone(),
                            );
                            new_routes.push((route, account.routing_relation()));
                        }
                    }
                }

                for prefix in withdrawn_routes.iter() {
                    debug!("Removed route for prefix: {}", prefix);
                    local_table.delete_route(prefix);
                    forwarding_table.delete_route(prefix);
                }

                let epoch = forwarding_table.increment_epoch();
                forwarding_table_updates.push((new_routes, withdrawn_routes));
                debug_assert_eq!(epoch as usize + 1, forwarding_table_updates.len());

                local_table
                    .iter()
                    .filter_map(|(prefix, routes)| {
                        best_of(routes).map(|(account, _)| (prefix.clone(), account.clone()))
                    })
                    .collect::<Vec<(String, A)>>()
            };

            store.set_routes(update_routes).await
        } else {
            // The routing table hasn't changed
            Ok(())
        }
    }

    /// Send RouteUpdateRequests to all peers we send routing messages to.
    ///
    /// Updates are built once per routing relation, because which routes a
    /// peer may see depends on the relation the route was learned from.
    async fn send_route_updates(&self) -> Result<(), CcpRoutingStoreError> {
        // Check which accounts we should skip this iteration
        let accounts_to_skip: Vec<Uuid> = {
            let mut unavailable_accounts = self.unavailable_accounts.lock();
            let mut skip = Vec::new();
            for (id, backoff) in unavailable_accounts.iter_mut() {
                if backoff.skip_intervals > 0 {
                    skip.push(*id);
                }
                backoff.skip_intervals = backoff.skip_intervals.saturating_sub(1);
            }
            skip
        };
        if !accounts_to_skip.is_empty() {
            trace!("Skipping accounts: {:?}", accounts_to_skip);
        }

        let mut accounts = self
            .store
            .get_accounts_to_send_routes_to(accounts_to_skip)
            .await?;
        accounts.sort_unstable_by_key(|a| a.id());
        accounts.dedup_by_key(|a| a.id());

        if accounts.is_empty() {
            trace!("No accounts to broadcast routes to");
            return Ok(());
        }

        let to_epoch_index = self.forwarding_table.read().epoch();
        let from_epoch_index = self
            .last_epoch_updates_sent_for
            .swap(to_epoch_index, Ordering::SeqCst);

        let mut results = Vec::new();
        let mut outgoing = self.outgoing.clone();
        for relation in &[
            RoutingRelation::Parent,
            RoutingRelation::Peer,
            RoutingRelation::Child,
        ] {
            let targets: Vec<A> = accounts
                .iter()
                .filter(|a| a.routing_relation() == *relation)
                .cloned()
                .collect();
            if targets.is_empty() {
                continue;
            }

            let route_update_request =
                self.create_route_update(from_epoch_index, to_epoch_index, *relation);
            trace!(
                "Sending route update for epochs {} - {} to {:?} accounts: {:?}",
                from_epoch_index,
                to_epoch_index,
                relation,
                targets.iter().map(|a| a.id()).collect::<Vec<_>>(),
            );
            let prepare = route_update_request.to_prepare();

            for account in targets {
                let result = outgoing
                    .send_request(OutgoingRequest {
                        from: account.clone(),
                        to: account.clone(),
                        original_amount: prepare.amount(),
                        prepare: prepare.clone(),
                    })
                    .await;
                results.push((account, result));
            }
        }

        // Handle the results of the route broadcast attempts
        let mut unavailable_accounts = self.unavailable_accounts.lock();
        for (account, result) in results.into_iter() {
            match (account.routing_relation(), result) {
                (RoutingRelation::Child, Err(err)) => {
                    if let Some(backoff) = unavailable_accounts.get_mut(&account.id()) {
                        // Increase the number of intervals we'll skip
                        // (but don't overflow the value it's stored in)
                        backoff.max = backoff.max.saturating_add(1);
                        backoff.skip_intervals = backoff.max;
                    } else {
                        // Skip sending to this account next time
                        unavailable_accounts.insert(
                            account.id(),
                            BackoffParams {
                                max: 1,
                                skip_intervals: 1,
                            },
                        );
                    }
                    trace!(
                        "Error sending route update to {:?} account {} (id: {}), increased backoff to {}: {:?}",
                        account.routing_relation(),
                        account.username(),
                        account.id(),
                        unavailable_accounts[&account.id()].max,
                        err
                    );
                }
                (_, Err(err)) => {
                    warn!(
                        "Error sending route update to {:?} account {} (id: {}): {:?}",
                        account.routing_relation(),
                        account.username(),
                        account.id(),
                        err
                    );
                }
                (_, Ok(_)) => {
                    if unavailable_accounts.remove(&account.id()).is_some() {
                        debug!(
                            "Account {} (id: {}) is no longer unavailable, resuming route broadcasts",
                            account.username(),
                            account.id()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Create a RouteUpdateRequest for the given range of forwarding-table
    /// epochs, as seen by accounts with the given routing relation. Routes
    /// whose source relation does not allow re-advertising to
    /// `target_relation` are left out.
    fn create_route_update(
        &self,
        from_epoch_index: u32,
        to_epoch_index: u32,
        target_relation: RoutingRelation,
    ) -> RouteUpdateRequest {
        let (start, end) = (from_epoch_index as usize, to_epoch_index as usize);
        let (routing_table_id, current_epoch_index) = {
            let table = self.forwarding_table.read();
            (table.id(), table.epoch())
        };
        let forwarding_table_updates = self.forwarding_table_updates.read();
        let epochs_to_take = end.saturating_sub(start);

        // Merge the new routes and withdrawn routes from all of the given epochs
        let mut new_routes: Vec<Route> = Vec::with_capacity(epochs_to_take);
        let mut withdrawn_routes: Vec<String> = Vec::new();

        // Send our own prefix with the first update so the peer can route
        // to us even though there is no Account corresponding to our own
        // address in the forwarding table.
        if start == 0 {
            new_routes.push(Route {
                prefix: self.ilp_address.read().to_string(),
                path: Vec::new(),
                auth: [0; 32],
                props: Vec::new(),
            });
        }

        // Iterate through each of the given epochs
        for (new, withdrawn) in forwarding_table_updates
            .iter()
            .skip(start)
            .take(epochs_to_take)
        {
            for (new_route, learned_from) in new {
                if !learned_from.allows_advertising_to(target_relation) {
                    continue;
                }
                new_routes.push(new_route.clone());
                // If the route was previously withdrawn, ignore that now
                // since it was added back
                withdrawn_routes.retain(|prefix| prefix != &new_route.prefix);
            }

            for withdrawn_route in withdrawn {
                withdrawn_routes.push(withdrawn_route.clone());
                // If the route was previously added, ignore that since it
                // was withdrawn later
                new_routes.retain(|route| route.prefix.as_str() != withdrawn_route.as_str());
            }
        }

        RouteUpdateRequest {
            routing_table_id,
            from_epoch_index,
            to_epoch_index,
            current_epoch_index,
            new_routes,
            withdrawn_routes,
            speaker: self.ilp_address.read().clone(),
            hold_down_time: DEFAULT_ROUTE_EXPIRY_TIME,
        }
    }

    /// Send a Route Update Request to one account for the given epoch
    /// range. Used when a peer has fallen behind and requested a specific
    /// range of updates.
    async fn send_route_update(&self, account: A, from_epoch_index: u32, to_epoch_index: u32) {
        let prepare = self
            .create_route_update(
                from_epoch_index,
                to_epoch_index,
                account.routing_relation(),
            )
            .to_prepare();
        let account_id = account.id();
        debug!(
            "Sending individual route update to account: {} for epochs from: {} to: {}",
            account_id, from_epoch_index, to_epoch_index
        );
        let result = self
            .outgoing
            .clone()
            .send_request(OutgoingRequest {
                from: account.clone(),
                to: account,
                original_amount: prepare.amount(),
                prepare,
            })
            .await;

        if let Err(err) = result {
            error!(
                "Error sending route update to account {}: {:?}",
                account_id, err
            )
        }
    }
}

/// The best route we have for a prefix, checking configured routes first
/// (including shorter configured prefixes), then routes to local accounts,
/// then everything peers have advertised.
fn get_best_route_for_prefix<A: CcpRoutingAccount>(
    local_routes: &HashMap<String, A>,
    configured_routes: &HashMap<String, A>,
    learned_table: &RoutingTable<A>,
    prefix: &str,
) -> Option<(A, Route)> {
    // Check if we have a configured route for that specific prefix
    // or any shorter prefix ("example.a.b.c" will match "example.a.b" and "example.a")
    let segments: Vec<&str> = prefix.split('.').collect();
    for i in 0..segments.len() {
        let configured_prefix = segments[0..segments.len() - i].join(".");
        if let Some(account) = configured_routes.get(&configured_prefix) {
            return Some((
                account.clone(),
                Route {
                    prefix: account.ilp_address().to_string(),
                    auth: [0; 32],
                    path: Vec::new(),
                    props: Vec::new(),
                },
            ));
        }
    }

    if let Some(account) = local_routes.get(prefix) {
        return Some((
            account.clone(),
            Route {
                prefix: account.ilp_address().to_string(),
                auth: [0; 32],
                path: Vec::new(),
                props: Vec::new(),
            },
        ));
    }

    learned_table
        .best_route(prefix)
        .map(|(account, route)| (account.clone(), route.clone()))
}

#[async_trait]
impl<I, O, S, A> IncomingService<A> for CcpRouteManager<I, O, S, A>
where
    I: IncomingService<A> + Clone + Send + Sync + 'static,
    O: OutgoingService<A> + Clone + Send + Sync + 'static,
    S: AddressStore + CcpRoutingStore<Account = A> + Clone + Send + Sync + 'static,
    A: CcpRoutingAccount + Send + Sync + 'static,
{
    /// Handle the IncomingRequest if it is a CCP protocol message or
    /// pass it on to the next handler if not
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let destination = request.prepare.destination();
        if destination == *CCP_CONTROL_DESTINATION {
            self.handle_route_control_request(request).await
        } else if destination == *CCP_UPDATE_DESTINATION {
            self.handle_route_update_request(request).await
        } else {
            self.next_incoming.handle_request(request).await
        }
    }
}

#[cfg(test)]
mod handle_route_control_request {
    use super::*;
    use crate::fixtures::*;
    use crate::test_helpers::*;
    use connector_packet::PrepareBuilder;
    use std::time::{Duration, SystemTime};

    #[tokio::test]
    async fn handles_valid_request() {
        test_service_with_routes()
            .0
            .handle_request(IncomingRequest {
                prepare: CONTROL_REQUEST.to_prepare(),
                from: ROUTING_ACCOUNT.clone(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_from_non_sending_account() {
        let result = test_service()
            .handle_request(IncomingRequest {
                prepare: CONTROL_REQUEST.to_prepare(),
                from: NON_ROUTING_ACCOUNT.clone(),
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            str::from_utf8(result.unwrap_err().message()).unwrap(),
            "We are not configured to send routes to you, sorry"
        );
    }

    #[tokio::test]
    async fn rejects_invalid_packet() {
        let result = test_service()
            .handle_request(IncomingRequest {
                prepare: PrepareBuilder {
                    destination: CCP_CONTROL_DESTINATION.clone(),
                    amount: 0,
                    expires_at: SystemTime::now() + Duration::from_secs(30),
                    data: &[],
                    execution_condition: &crate::packet::PEER_PROTOCOL_CONDITION,
                }
                .build(),
                from: ROUTING_ACCOUNT.clone(),
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            str::from_utf8(result.unwrap_err().message()).unwrap(),
            "Invalid route control request"
        );
    }

    #[tokio::test]
    async fn sends_update_in_response() {
        let (mut service, outgoing_requests) = test_service_with_routes();
        service.forwarding_table.write().set_id([0; 16]);
        service.update_best_routes(None).await.unwrap();
        service
            .handle_request(IncomingRequest {
                from: ROUTING_ACCOUNT.clone(),
                prepare: RouteControlRequest {
                    last_known_routing_table_id: [0; 16],
                    mode: Mode::Sync,
                    last_known_epoch: 0,
                    features: Vec::new(),
                }
                .to_prepare(),
            })
            .await
            .unwrap();
        let requests = outgoing_requests.lock();
        let request: &OutgoingRequest<TestAccount> = &requests[0];
        assert_eq!(request.to.id(), ROUTING_ACCOUNT.id());
        let update = RouteUpdateRequest::try_from(&request.prepare).unwrap();
        assert_eq!(update.routing_table_id, [0; 16]);
        assert_eq!(update.from_epoch_index, 0);
        assert_eq!(update.to_epoch_index, 1);
        assert_eq!(update.current_epoch_index, 1);
        // Our own address plus the two routes in the store
        assert_eq!(update.new_routes.len(), 3);
    }

    #[tokio::test]
    async fn sends_whole_table_if_id_changed() {
        let (mut service, outgoing_requests) = test_service_with_routes();
        service.update_best_routes(None).await.unwrap();
        service
            .handle_request(IncomingRequest {
                from: ROUTING_ACCOUNT.clone(),
                prepare: RouteControlRequest {
                    last_known_routing_table_id: [99; 16],
                    mode: Mode::Sync,
                    last_known_epoch: 1,
                    features: Vec::new(),
                }
                .to_prepare(),
            })
            .await
            .unwrap();
        let requests = outgoing_requests.lock();
        let update = RouteUpdateRequest::try_from(&requests[0].prepare).unwrap();
        assert_eq!(update.from_epoch_index, 0);
    }
}

#[cfg(test)]
mod handle_route_update_request {
    use super::*;
    use crate::fixtures::*;
    use crate::test_helpers::*;
    use connector_packet::PrepareBuilder;
    use std::time::{Duration, SystemTime};

    #[tokio::test]
    async fn handles_valid_request() {
        let mut service = test_service();
        let mut update = UPDATE_REQUEST_SIMPLE.clone();
        update.to_epoch_index = 1;
        update.from_epoch_index = 0;

        service
            .handle_request(IncomingRequest {
                prepare: update.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_from_non_receiving_account() {
        let result = test_service()
            .handle_request(IncomingRequest {
                prepare: UPDATE_REQUEST_SIMPLE.to_prepare(),
                from: NON_ROUTING_ACCOUNT.clone(),
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            str::from_utf8(result.unwrap_err().message()).unwrap(),
            "Your route broadcasts are not accepted here",
        );
    }

    #[tokio::test]
    async fn rejects_invalid_packet() {
        let result = test_service()
            .handle_request(IncomingRequest {
                prepare: PrepareBuilder {
                    destination: CCP_UPDATE_DESTINATION.clone(),
                    amount: 0,
                    expires_at: SystemTime::now() + Duration::from_secs(30),
                    data: &[],
                    execution_condition: &crate::packet::PEER_PROTOCOL_CONDITION,
                }
                .build(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            str::from_utf8(result.unwrap_err().message()).unwrap(),
            "Invalid route update request",
        );
    }

    #[tokio::test]
    async fn adds_routes_to_learned_table() {
        let mut service = test_service();
        let mut update = UPDATE_REQUEST_COMPLEX.clone();
        update.to_epoch_index = 1;
        update.from_epoch_index = 0;

        service
            .handle_request(IncomingRequest {
                prepare: update.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await
            .unwrap();

        let learned_table = service.learned_table.read();
        assert_eq!(learned_table.get_routes_for("example.prefix1").len(), 1);
        assert_eq!(learned_table.get_routes_for("example.prefix2").len(), 1);
    }

    #[tokio::test]
    async fn filters_routes_containing_own_address_in_path() {
        let mut service = test_service();
        let mut update = UPDATE_REQUEST_COMPLEX.clone();
        update.to_epoch_index = 1;
        update.from_epoch_index = 0;
        update.new_routes[0].path = vec![
            "example.peer".to_string(),
            // This is us: the route has looped.
            "example.connector".to_string(),
        ];

        service
            .handle_request(IncomingRequest {
                prepare: update.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await
            .unwrap();

        let learned_table = service.learned_table.read();
        assert!(learned_table.get_routes_for("example.prefix1").is_empty());
        assert_eq!(learned_table.get_routes_for("example.prefix2").len(), 1);
    }

    #[tokio::test]
    async fn filters_routes_for_other_schemes_and_own_prefix() {
        let mut service = test_service();
        let mut update = UPDATE_REQUEST_COMPLEX.clone();
        update.to_epoch_index = 1;
        update.from_epoch_index = 0;
        update.new_routes[0].prefix = "other.scheme".to_string();
        update.new_routes[1].prefix = "example.connector.sub-account".to_string();

        service
            .handle_request(IncomingRequest {
                prepare: update.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await
            .unwrap();

        let learned_table = service.learned_table.read();
        assert!(learned_table.get_routes_for("other.scheme").is_empty());
        assert!(learned_table
            .get_routes_for("example.connector.sub-account")
            .is_empty());
    }

    #[tokio::test]
    async fn requests_resync_on_epoch_gap() {
        let (mut service, outgoing_requests) = test_service_with_routes();
        let mut update = UPDATE_REQUEST_SIMPLE.clone();
        // We expect epoch 0 but the peer starts at 5: there is a gap.
        update.from_epoch_index = 5;
        update.to_epoch_index = 6;

        let result = service
            .handle_request(IncomingRequest {
                prepare: update.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await;
        assert!(result.is_err());

        // A Route Control Request was sent to get a full resync
        let requests = outgoing_requests.lock();
        let control = RouteControlRequest::try_from(&requests[0].prepare).unwrap();
        assert_eq!(control.mode, Mode::Sync);
        assert_eq!(control.last_known_epoch, 0);
    }

    #[tokio::test]
    async fn resets_learned_routes_when_table_id_changes() {
        let mut service = test_service();
        let mut update = UPDATE_REQUEST_COMPLEX.clone();
        update.to_epoch_index = 1;
        update.from_epoch_index = 0;
        service
            .handle_request(IncomingRequest {
                prepare: update.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            service
                .learned_table
                .read()
                .get_routes_for("example.prefix1")
                .len(),
            1
        );

        // The same peer restarts with a new table that no longer contains
        // prefix1
        let mut update = UPDATE_REQUEST_SIMPLE.clone();
        update.routing_table_id = [42; 16];
        update.from_epoch_index = 0;
        update.to_epoch_index = 1;
        let mut route = UPDATE_REQUEST_COMPLEX.new_routes[1].clone();
        route.prefix = "example.prefix9".to_string();
        update.new_routes.push(route);
        service
            .handle_request(IncomingRequest {
                prepare: update.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await
            .unwrap();

        let learned_table = service.learned_table.read();
        assert!(learned_table.get_routes_for("example.prefix1").is_empty());
        assert_eq!(learned_table.get_routes_for("example.prefix9").len(), 1);
    }

    #[tokio::test]
    async fn ignores_duplicate_update() {
        let mut service = test_service();
        let mut update = UPDATE_REQUEST_COMPLEX.clone();
        update.to_epoch_index = 1;
        update.from_epoch_index = 0;

        service
            .handle_request(IncomingRequest {
                prepare: update.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await
            .unwrap();
        // Applying the exact same epoch range again changes nothing
        let mut update = UPDATE_REQUEST_COMPLEX.clone();
        update.to_epoch_index = 1;
        update.from_epoch_index = 0;
        update.withdrawn_routes = vec!["example.prefix1".to_string()];
        service
            .handle_request(IncomingRequest {
                prepare: update.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await
            .unwrap();

        let learned_table = service.learned_table.read();
        assert_eq!(learned_table.get_routes_for("example.prefix1").len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_advances_epoch_without_changes() {
        let mut service = test_service();
        let mut heartbeat = UPDATE_REQUEST_SIMPLE.clone();
        heartbeat.from_epoch_index = 0;
        heartbeat.to_epoch_index = 5;

        service
            .handle_request(IncomingRequest {
                prepare: heartbeat.to_prepare(),
                from: CHILD_ACCOUNT.clone(),
            })
            .await
            .unwrap();

        assert_eq!(
            service.peer_sync_states.read()[&CHILD_ACCOUNT.id()].epoch,
            5
        );
    }
}
