use async_trait::async_trait;
use connector_packet::{ErrorCode, FulfillBuilder, RejectBuilder};
use connector_service::{
    Account, AddressStore, IlpResult, IncomingRequest, IncomingService,
};
use std::marker::PhantomData;
use tracing::debug;

/// The well-known ping preimage, `pingpingpingpingpingpingpingping` in ASCII.
pub const PING_PROTOCOL_FULFILLMENT: [u8; 32] = *b"pingpingpingpingpingpingpingping";
/// SHA-256 of [`PING_PROTOCOL_FULFILLMENT`].
pub const PING_PROTOCOL_CONDITION: [u8; 32] = [
    140, 0, 188, 12, 97, 79, 100, 247, 225, 224, 11, 89, 165, 123, 175, 92, 87, 182, 161, 25,
    169, 13, 84, 175, 72, 152, 54, 161, 63, 155, 199, 126,
];

/// # Ping Service
///
/// Incoming service that answers pings addressed to the operator's own
/// address. A prepare carrying the well-known ping condition is fulfilled
/// locally with the fixed ping fulfillment; it is never forwarded over any
/// link and never reaches the balance path. Senders use this end-to-end to
/// measure whether (and how expensively) a connector is reachable.
#[derive(Clone)]
pub struct PingService<S, I, A> {
    store: S,
    next: I,
    account_type: PhantomData<A>,
}

impl<S, I, A> PingService<S, I, A>
where
    S: AddressStore,
    I: IncomingService<A>,
    A: Account,
{
    pub fn new(store: S, next: I) -> Self {
        PingService {
            store,
            next,
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<S, I, A> IncomingService<A> for PingService<S, I, A>
where
    S: AddressStore + Send + Sync,
    I: IncomingService<A> + Send + Sync,
    A: Account + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let ilp_address = self.store.get_ilp_address();
        if request.prepare.destination() != ilp_address {
            return self.next.handle_request(request).await;
        }

        // The packet is addressed to us directly. We only speak ping.
        if request.prepare.execution_condition() == PING_PROTOCOL_CONDITION {
            debug!(
                "Responding to ping from account {} (id: {})",
                request.from.username(),
                request.from.id()
            );
            Ok(FulfillBuilder {
                fulfillment: &PING_PROTOCOL_FULFILLMENT,
                data: &[],
            }
            .build())
        } else {
            Err(RejectBuilder {
                code: ErrorCode::F00_BAD_REQUEST,
                message: b"Unknown condition for packet addressed to the connector",
                triggered_by: Some(&ilp_address),
                data: &[],
            }
            .build())
        }
    }
}
