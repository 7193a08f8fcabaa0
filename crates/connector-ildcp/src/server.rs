use super::packet::*;
use async_trait::async_trait;
use connector_packet::Fulfill;
use connector_service::{Account, IlpResult, IncomingRequest, IncomingService};
use std::marker::PhantomData;
use tracing::debug;

/// Answers `peer.config` requests with the address and asset details the
/// requesting account is configured with. Everything else passes through.
#[derive(Clone)]
pub struct IldcpService<I, A> {
    next: I,
    account_type: PhantomData<A>,
}

impl<I, A> IldcpService<I, A>
where
    I: IncomingService<A>,
    A: Account,
{
    pub fn new(next: I) -> Self {
        IldcpService {
            next,
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<I, A> IncomingService<A> for IldcpService<I, A>
where
    I: IncomingService<A> + Send + Sync,
    A: Account + Sync + 'static,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        if is_ildcp_request(&request.prepare) {
            let from = &request.from;
            debug!(
                "Responding to query for ildcp info by account: {} (id: {})",
                from.username(),
                from.id()
            );
            let response = IldcpResponseBuilder {
                client_address: from.ilp_address(),
                asset_code: from.asset_code(),
                asset_scale: from.asset_scale(),
            }
            .build();
            Ok(Fulfill::from(response))
        } else {
            self.next.handle_request(request).await
        }
    }
}
