use async_trait::async_trait;
use connector_packet::{ErrorCode, RejectBuilder};
use connector_service::{
    Account, AddressStore, IlpResult, IncomingRequest, IncomingService,
};
use std::marker::PhantomData;
use tracing::debug;

/// # Allowed Destination Service
///
/// Incoming service that rejects packets whose destination cannot be
/// routed from this node at all: anything outside the operator's own
/// allocation scheme is unreachable here, except the reserved `peer.*`
/// protocol destinations and `self.*` local destinations, which later
/// services handle without routing.
#[derive(Clone)]
pub struct AllowedDestinationService<S, I, A> {
    store: S,
    next: I,
    account_type: PhantomData<A>,
}

impl<S, I, A> AllowedDestinationService<S, I, A>
where
    S: AddressStore,
    I: IncomingService<A>,
    A: Account,
{
    pub fn new(store: S, next: I) -> Self {
        AllowedDestinationService {
            store,
            next,
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<S, I, A> IncomingService<A> for AllowedDestinationService<S, I, A>
where
    S: AddressStore + Send + Sync,
    I: IncomingService<A> + Send + Sync,
    A: Account + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let destination = request.prepare.destination();
        let scheme = destination.scheme().to_string();
        if scheme == "peer" || scheme == "self" {
            return self.next.handle_request(request).await;
        }

        let ilp_address = self.store.get_ilp_address();
        if scheme != ilp_address.scheme() {
            debug!(
                "Rejecting packet from account {} for destination {} outside our scheme",
                request.from.id(),
                destination,
            );
            return Err(RejectBuilder {
                code: ErrorCode::F02_UNREACHABLE,
                message: b"Destination is not routable from this connector",
                triggered_by: Some(&ilp_address),
                data: &[],
            }
            .build());
        }

        self.next.handle_request(request).await
    }
}
