use async_trait::async_trait;
use connector_packet::{ErrorCode, RejectBuilder};
use connector_service::{
    Account, AddressStore, IlpResult, IncomingRequest, IncomingService,
};
use std::marker::PhantomData;
use tracing::{error, warn};

/// Extension trait for [`Account`](../connector_service/trait.Account.html) with rate limiting related information
pub trait RateLimitAccount: Account {
    /// The maximum packets per minute allowed for this account
    fn packets_per_minute_limit(&self) -> Option<u32> {
        None
    }

    /// The maximum units per minute allowed for this account
    fn amount_per_minute_limit(&self) -> Option<u64> {
        None
    }
}

/// Rate limiting related errors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitError {
    /// Account exceeded their packet limit
    PacketLimitExceeded,
    /// Account exceeded their amount limit
    ThroughputLimitExceeded,
    /// There was an internal error when trying to connect to the store
    StoreError,
}

/// Store trait which manages the rate limit related information of accounts
#[async_trait]
pub trait RateLimitStore {
    /// The provided account must implement [`RateLimitAccount`](./trait.RateLimitAccount.html)
    type Account: RateLimitAccount;

    /// Apply rate limits based on the packets-per-minute and amount-per-minute
    /// limits set on the provided account
    async fn apply_rate_limits(
        &self,
        account: Self::Account,
        prepare_amount: u64,
    ) -> Result<(), RateLimitError>;

    /// Refunds the throughput limit which was charged to an account.
    /// Called if the node receives a reject packet after trying to forward
    /// a packet to a peer, meaning that effectively reject packets do not
    /// count towards a node's throughput limits.
    async fn refund_throughput_limit(
        &self,
        account: Self::Account,
        prepare_amount: u64,
    ) -> Result<(), RateLimitError>;
}

/// # Rate Limit Service
///
/// Incoming service responsible for rejecting requests from accounts that
/// have reached their rate limit. Does both packet-count based limiting and
/// amount based limiting, according to the account's configuration.
///
/// Forwards everything else. Requires a `RateLimitAccount` and a
/// `RateLimitStore`.
#[derive(Clone)]
pub struct RateLimitService<S, I, A> {
    store: S,
    next: I,
    account_type: PhantomData<A>,
}

impl<S, I, A> RateLimitService<S, I, A>
where
    S: AddressStore + RateLimitStore<Account = A> + Send + Sync,
    I: IncomingService<A> + Send + Sync,
    A: RateLimitAccount + Sync,
{
    pub fn new(store: S, next: I) -> Self {
        RateLimitService {
            store,
            next,
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<S, I, A> IncomingService<A> for RateLimitService<S, I, A>
where
    S: AddressStore + RateLimitStore<Account = A> + Send + Sync + 'static,
    I: IncomingService<A> + Send + Sync + 'static,
    A: RateLimitAccount + Sync + 'static,
{
    /// On receiving a request:
    /// 1. Apply the account's rate limits to the request
    /// 1. If no limit was hit, forward the request
    ///     - If the forward ends in a reject, the sender should not be
    ///       charged towards their throughput limit, so refund it
    /// 1. If a limit was hit, reject with the appropriate ErrorCode
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let ilp_address = self.store.get_ilp_address();
        let account = request.from.clone();
        let prepare_amount = request.prepare.amount();
        let has_throughput_limit = account.amount_per_minute_limit().is_some();
        match self
            .store
            .apply_rate_limits(request.from.clone(), prepare_amount)
            .await
        {
            Ok(_) => {
                let packet = self.next.handle_request(request).await;
                // If we did not get a fulfill, we should refund the sender
                if packet.is_err() && has_throughput_limit {
                    if let Err(err) = self
                        .store
                        .refund_throughput_limit(account, prepare_amount)
                        .await
                    {
                        // If refunding failed, that's too bad, we will just
                        // return the reject from the peer
                        error!("Error refunding throughput limit: {:?}", err);
                    }
                }

                packet
            }
            Err(err) => {
                let code = match err {
                    RateLimitError::PacketLimitExceeded => {
                        if let Some(limit) = account.packets_per_minute_limit() {
                            warn!("Account {} was rate limited for sending too many packets. Limit is: {} per minute", account.id(), limit);
                        }
                        ErrorCode::T05_RATE_LIMITED
                    }
                    RateLimitError::ThroughputLimitExceeded => {
                        if let Some(limit) = account.amount_per_minute_limit() {
                            warn!("Account {} was throughput limited for trying to send too much money. Limit is: {} per minute", account.id(), limit);
                        }
                        ErrorCode::T04_INSUFFICIENT_LIQUIDITY
                    }
                    RateLimitError::StoreError => ErrorCode::T00_INTERNAL_ERROR,
                };

                Err(RejectBuilder {
                    code,
                    triggered_by: Some(&ilp_address),
                    message: &[],
                    data: &[],
                }
                .build())
            }
        }
    }
}
