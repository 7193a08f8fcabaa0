use crate::Link;
use async_trait::async_trait;
use connector_packet::{ErrorCode, RejectBuilder};
use connector_service::{
    Account, AddressStore, IlpResult, OutgoingRequest, OutgoingService,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// How many consecutive unreachable sends trip a link's circuit breaker.
const CIRCUIT_BREAKER_THRESHOLD: u8 = 3;
/// Capacity of the connectivity event channel. Slow subscribers that fall
/// further behind than this lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Typed connectivity notification published by the link manager.
///
/// There is one channel per manager with a statically known event type, not
/// a process-global event bus; subscribe once, receive every event from then
/// on.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    Connected { account_id: Uuid },
    Disconnected { account_id: Uuid },
    Error { account_id: Uuid, message: String },
}

#[derive(Debug)]
struct Breaker {
    consecutive_failures: u8,
    /// The total number of sends we skip once tripped. Grows by one every
    /// time the breaker trips again.
    max: u8,
    /// How many more sends to skip before letting a probe through.
    skip_remaining: u8,
}

impl Breaker {
    fn new() -> Self {
        Breaker {
            consecutive_failures: 0,
            max: 0,
            skip_remaining: 0,
        }
    }
}

/// Registry of the links for each account, exposed to the switch as the
/// outgoing service at the bottom of the chain.
#[derive(Clone)]
pub struct LinkManager<S, L, A> {
    store: S,
    links: Arc<RwLock<HashMap<Uuid, L>>>,
    breakers: Arc<Mutex<HashMap<Uuid, Breaker>>>,
    events: broadcast::Sender<LinkEvent>,
    account_type: PhantomData<A>,
}

impl<S, L, A> LinkManager<S, L, A>
where
    S: AddressStore,
    L: Link,
    A: Account,
{
    pub fn new(store: S) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        LinkManager {
            store,
            links: Arc::new(RwLock::new(HashMap::new())),
            breakers: Arc::new(Mutex::new(HashMap::new())),
            events,
            account_type: PhantomData,
        }
    }

    /// Subscribes to connectivity events. Every subscriber sees every event
    /// emitted after the call.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn register_link(&self, account_id: Uuid, link: L) {
        self.links.write().insert(account_id, link);
        trace!("Registered link for account {}", account_id);
    }

    /// Removes the account's link, disconnecting it first.
    pub async fn unregister_link(&self, account_id: Uuid) {
        let link = self.links.write().remove(&account_id);
        if let Some(link) = link {
            link.disconnect().await;
            self.emit(LinkEvent::Disconnected { account_id });
        }
    }

    pub fn get_link(&self, account_id: &Uuid) -> Option<L> {
        self.links.read().get(account_id).cloned()
    }

    /// Connects every registered link, emitting a Connected or Error event
    /// per account.
    pub async fn connect_all(&self) {
        let links: Vec<(Uuid, L)> = self
            .links
            .read()
            .iter()
            .map(|(id, link)| (*id, link.clone()))
            .collect();
        for (account_id, link) in links {
            match link.connect().await {
                Ok(()) => {
                    debug!("Link for account {} connected", account_id);
                    self.emit(LinkEvent::Connected { account_id });
                }
                Err(err) => {
                    warn!("Error connecting link for account {}: {}", account_id, err);
                    self.emit(LinkEvent::Error {
                        account_id,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    fn emit(&self, event: LinkEvent) {
        // Erroring only means there are no subscribers right now.
        let _ = self.events.send(event);
    }

    /// Returns true if the breaker for this account is open and the send
    /// should be skipped.
    fn breaker_is_open(&self, account_id: Uuid) -> bool {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get_mut(&account_id) {
            if breaker.skip_remaining > 0 {
                breaker.skip_remaining -= 1;
                return true;
            }
        }
        false
    }

    fn record_failure(&self, account_id: Uuid) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(account_id).or_insert_with(Breaker::new);
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        if breaker.consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD {
            breaker.max = breaker.max.saturating_add(1);
            breaker.skip_remaining = breaker.max;
            warn!(
                "Link for account {} tripped its circuit breaker, skipping the next {} sends",
                account_id, breaker.skip_remaining
            );
        }
    }

    fn record_success(&self, account_id: Uuid) {
        let mut breakers = self.breakers.lock();
        if breakers.remove(&account_id).is_some() {
            debug!("Link for account {} is healthy again", account_id);
        }
    }
}

#[async_trait]
impl<S, L, A> OutgoingService<A> for LinkManager<S, L, A>
where
    S: AddressStore + Send + Sync + 'static,
    L: Link,
    A: Account + Sync + 'static,
{
    /// Resolves the destination account's link and sends the prepare over
    /// it. Absent, disconnected, or tripped links produce a `T01` reject so
    /// the caller always gets a response packet.
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        let account_id = request.to.id();
        let ilp_address = self.store.get_ilp_address();
        let unreachable = |message: &[u8]| {
            RejectBuilder {
                code: ErrorCode::T01_PEER_UNREACHABLE,
                message,
                triggered_by: Some(&ilp_address),
                data: &[],
            }
            .build()
        };

        let link = match self.get_link(&account_id) {
            Some(link) => link,
            None => {
                warn!(
                    "No link registered for account {} (id: {})",
                    request.to.username(),
                    account_id
                );
                return Err(unreachable(b"No link configured for account"));
            }
        };

        if !link.is_connected() {
            debug!(
                "Link for account {} is not connected, rejecting packet",
                account_id
            );
            return Err(unreachable(b"Link is not connected"));
        }

        if self.breaker_is_open(account_id) {
            return Err(unreachable(b"Link is temporarily suspended"));
        }

        let result = link.send_packet(request.prepare).await;
        match &result {
            Ok(_) => self.record_success(account_id),
            Err(reject) if reject.code() == ErrorCode::T01_PEER_UNREACHABLE => {
                self.record_failure(account_id);
            }
            // Rejects from further down the path mean the link itself works.
            Err(_) => self.record_success(account_id),
        }
        result
    }
}
