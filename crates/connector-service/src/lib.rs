//! The core abstraction of the packet switch: every filter, the router and
//! the outgoing link dispatcher implement one of two service traits.
//!
//! An [`IncomingService`](./trait.IncomingService.html) handles requests that
//! arrive on one of our links, an [`OutgoingService`](./trait.OutgoingService.html)
//! handles requests we are about to send out. Services wrap one another, so
//! the statically configured chain of filters is just a stack of nested
//! service types; each layer can short-circuit with a reject, delegate to the
//! next layer, and post-process the response on the way back out.

mod account;
mod username;

pub use account::{Account, AccountManagerStore, AccountStore};
pub use username::Username;

use async_trait::async_trait;
use connector_errors::AddressStoreError;
use connector_packet::{Address, Fulfill, Prepare, Reject};
use std::marker::PhantomData;

/// The result of handling an ILP Prepare packet: exactly one of a Fulfill or
/// a Reject.
pub type IlpResult = Result<Fulfill, Reject>;

/// A request that arrived from a peer on one of our links.
#[derive(Debug, Clone)]
pub struct IncomingRequest<A: Account> {
    /// The account the packet was received on
    pub from: A,
    pub prepare: Prepare,
}

/// A request we are about to forward to the next hop.
#[derive(Debug, Clone)]
pub struct OutgoingRequest<A: Account> {
    /// The account the packet was received on
    pub from: A,
    /// The account the packet is being forwarded to
    pub to: A,
    /// The amount of the Prepare as it arrived, before any adjustment.
    /// The prepare's own amount may differ once filters have rewritten it.
    pub original_amount: u64,
    pub prepare: Prepare,
}

impl<A: Account> IncomingRequest<A> {
    /// Turns the incoming request into an outgoing one addressed to `to`.
    pub fn into_outgoing(self, to: A) -> OutgoingRequest<A> {
        OutgoingRequest {
            from: self.from,
            original_amount: self.prepare.amount(),
            prepare: self.prepare,
            to,
        }
    }
}

/// A service that handles incoming requests.
#[async_trait]
pub trait IncomingService<A: Account> {
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult;

    /// Wraps the service such that it can be called by a handler that takes
    /// a boxed service.
    fn boxed(self) -> BoxedIncomingService<A>
    where
        Self: Clone + Send + Sized + 'static,
    {
        Box::new(self)
    }
}

/// A service that sends outgoing requests.
#[async_trait]
pub trait OutgoingService<A: Account> {
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult;

    fn boxed(self) -> BoxedOutgoingService<A>
    where
        Self: Clone + Send + Sized + 'static,
    {
        Box::new(self)
    }
}

pub type BoxedIncomingService<A> = Box<dyn IncomingService<A> + Send>;
pub type BoxedOutgoingService<A> = Box<dyn OutgoingService<A> + Send>;

#[async_trait]
impl<A: Account + 'static> IncomingService<A> for BoxedIncomingService<A> {
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        (**self).handle_request(request).await
    }
}

#[async_trait]
impl<A: Account + 'static> OutgoingService<A> for BoxedOutgoingService<A> {
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        (**self).send_request(request).await
    }
}

/// Adapter to create an `IncomingService` from a closure, mostly for tests
/// and for terminating a chain.
#[derive(Clone)]
pub struct ServiceFn<F, A> {
    handler: F,
    account_type: PhantomData<A>,
}

pub fn incoming_service_fn<A, F>(handler: F) -> ServiceFn<F, A>
where
    A: Account,
    F: FnMut(IncomingRequest<A>) -> IlpResult,
{
    ServiceFn {
        handler,
        account_type: PhantomData,
    }
}

pub fn outgoing_service_fn<A, F>(handler: F) -> ServiceFn<F, A>
where
    A: Account,
    F: FnMut(OutgoingRequest<A>) -> IlpResult,
{
    ServiceFn {
        handler,
        account_type: PhantomData,
    }
}

#[async_trait]
impl<F, A> IncomingService<A> for ServiceFn<F, A>
where
    A: Account + 'static,
    F: FnMut(IncomingRequest<A>) -> IlpResult + Send,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        (self.handler)(request)
    }
}

#[async_trait]
impl<F, A> OutgoingService<A> for ServiceFn<F, A>
where
    A: Account + 'static,
    F: FnMut(OutgoingRequest<A>) -> IlpResult + Send,
{
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        (self.handler)(request)
    }
}

/// Stores the operator's own ILP address.
///
/// The address can change at runtime (e.g. when a parent assigns us one via
/// IL-DCP), so reads return a cheap clone of the current value.
#[async_trait]
pub trait AddressStore: Clone {
    /// Saves the ILP Address in the store's memory
    async fn set_ilp_address(&self, ilp_address: Address) -> Result<(), AddressStoreError>;

    async fn clear_ilp_address(&self) -> Result<(), AddressStoreError>;

    /// Gets the store's ILP address from memory
    fn get_ilp_address(&self) -> Address;
}
