use async_trait::async_trait;
use connector_service::{Account, IlpResult, OutgoingRequest, OutgoingService};
use std::time::Duration;

pub const DEFAULT_ROUND_TRIP_TIME: u64 = 500;

/// Extension trait for accounts with a configured response-time estimate.
pub trait RoundTripTimeAccount: Account {
    /// Estimate of how long (in milliseconds) a round trip to this account takes
    fn round_trip_time(&self) -> u64 {
        DEFAULT_ROUND_TRIP_TIME
    }
}

/// # Expiry Shortener Service
///
/// Outgoing service that shortens each forwarded packet's expiry by the
/// expected round-trip margin of both hops, so that we always hear the
/// next hop's response before our own incoming deadline passes and never
/// have to eat the difference.
#[derive(Clone)]
pub struct ExpiryShortenerService<O> {
    next: O,
}

impl<O> ExpiryShortenerService<O> {
    pub fn new(next: O) -> Self {
        ExpiryShortenerService { next }
    }
}

#[async_trait]
impl<O, A> OutgoingService<A> for ExpiryShortenerService<O>
where
    O: OutgoingService<A> + Send + Sync,
    A: RoundTripTimeAccount + Sync + 'static,
{
    async fn send_request(&mut self, mut request: OutgoingRequest<A>) -> IlpResult {
        let time_to_subtract = request.from.round_trip_time() + request.to.round_trip_time();
        let new_expiry = request.prepare.expires_at() - Duration::from_millis(time_to_subtract);
        request.prepare.set_expires_at(new_expiry);
        self.next.send_request(request).await
    }
}
