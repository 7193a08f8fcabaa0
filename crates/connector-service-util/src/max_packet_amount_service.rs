use async_trait::async_trait;
use connector_packet::{ErrorCode, MaxPacketAmountDetails, RejectBuilder};
use connector_service::{
    Account, AddressStore, IlpResult, IncomingRequest, IncomingService,
};
use std::marker::PhantomData;
use tracing::debug;

/// Extension trait for accounts with a configured per-packet amount ceiling.
pub trait MaxPacketAmountAccount: Account {
    fn max_packet_amount(&self) -> u64;
}

/// # MaxPacketAmount Service
///
/// Incoming service that rejects packets above the account's configured
/// maximum. Connectors limit packet size for liquidity and risk reasons:
/// each in-flight packet ties up credit until it settles, so many small
/// packets are preferable to one big one.
///
/// Requires a `MaxPacketAmountAccount` and no store.
#[derive(Clone)]
pub struct MaxPacketAmountService<S, I, A> {
    store: S,
    next: I,
    account_type: PhantomData<A>,
}

impl<S, I, A> MaxPacketAmountService<S, I, A>
where
    S: AddressStore,
    I: IncomingService<A>,
    A: MaxPacketAmountAccount,
{
    pub fn new(store: S, next: I) -> Self {
        MaxPacketAmountService {
            store,
            next,
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<S, I, A> IncomingService<A> for MaxPacketAmountService<S, I, A>
where
    S: AddressStore + Send + Sync,
    I: IncomingService<A> + Send + Sync,
    A: MaxPacketAmountAccount + Sync + 'static,
{
    /// Forward if `request.prepare.amount <= request.from.max_packet_amount`,
    /// else reject with `F08` carrying the amounts so the sender can adjust.
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let max_packet_amount = request.from.max_packet_amount();
        if request.prepare.amount() <= max_packet_amount {
            self.next.handle_request(request).await
        } else {
            debug!(
                "Packet amount {} exceeds max packet amount {} for account {}",
                request.prepare.amount(),
                max_packet_amount,
                request.from.id()
            );
            let details =
                MaxPacketAmountDetails::new(request.prepare.amount(), max_packet_amount)
                    .to_bytes();
            Err(RejectBuilder {
                code: ErrorCode::F08_AMOUNT_TOO_LARGE,
                message: &[],
                triggered_by: Some(&self.store.get_ilp_address()),
                data: &details[..],
            }
            .build())
        }
    }
}
