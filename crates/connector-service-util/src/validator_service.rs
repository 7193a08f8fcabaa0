use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use connector_packet::{ErrorCode, RejectBuilder};
use connector_service::{
    Account, AddressStore, IlpResult, IncomingRequest, IncomingService, OutgoingRequest,
    OutgoingService,
};
use ring::digest::{digest, SHA256};
use std::marker::PhantomData;
use tracing::error;

/// The longest we are willing to hold a packet for, regardless of what its
/// sender asked for.
pub const DEFAULT_MAX_EXPIRY_DURATION: u64 = 30000;

/// # Validator Service
///
/// Incoming or Outgoing service responsible for rejecting timed-out and
/// too-long-held requests, and for checking that the fulfillment received
/// for a forwarded packet actually hashes to the `execution_condition` of
/// the original Prepare. Forwards everything else.
#[derive(Clone)]
pub struct ValidatorService<IO, S, A> {
    store: S,
    next: IO,
    max_expiry_duration: u64,
    account_type: PhantomData<A>,
}

impl<I, S, A> ValidatorService<I, S, A>
where
    I: IncomingService<A>,
    S: AddressStore,
    A: Account,
{
    pub fn incoming(store: S, next: I) -> Self {
        ValidatorService {
            store,
            next,
            max_expiry_duration: DEFAULT_MAX_EXPIRY_DURATION,
            account_type: PhantomData,
        }
    }
}

impl<O, S, A> ValidatorService<O, S, A>
where
    O: OutgoingService<A>,
    S: AddressStore,
    A: Account,
{
    pub fn outgoing(store: S, next: O) -> Self {
        ValidatorService {
            store,
            next,
            max_expiry_duration: DEFAULT_MAX_EXPIRY_DURATION,
            account_type: PhantomData,
        }
    }
}

impl<IO, S, A> ValidatorService<IO, S, A> {
    /// Override the maximum hold time (in milliseconds)
    pub fn max_expiry_duration(mut self, ms: u64) -> Self {
        self.max_expiry_duration = ms;
        self
    }
}

#[async_trait]
impl<I, S, A> IncomingService<A> for ValidatorService<I, S, A>
where
    I: IncomingService<A> + Send + Sync,
    S: AddressStore + Send + Sync,
    A: Account + Sync + 'static,
{
    /// On receiving a request:
    /// 1. The prepare must not already be expired, else reject with `R00`
    /// 2. The prepare's expiry must not be further out than the maximum
    ///    hold window, else reject with `F00` — accepting it would leave us
    ///    holding the sender's liquidity for longer than we are willing to
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        let expires_at = DateTime::<Utc>::from(request.prepare.expires_at());
        let now = Utc::now();
        if expires_at < now {
            error!(
                "Incoming packet expired {}ms ago at {:?} (time now: {:?})",
                now.signed_duration_since(expires_at).num_milliseconds(),
                expires_at.to_rfc3339(),
                now.to_rfc3339(),
            );
            return Err(RejectBuilder {
                code: ErrorCode::R00_TRANSFER_TIMED_OUT,
                message: &[],
                triggered_by: Some(&self.store.get_ilp_address()),
                data: &[],
            }
            .build());
        }

        if expires_at - now > Duration::milliseconds(self.max_expiry_duration as i64) {
            error!(
                "Incoming packet expires too far in the future: {} (max hold time is {}ms)",
                expires_at.to_rfc3339(),
                self.max_expiry_duration,
            );
            return Err(RejectBuilder {
                code: ErrorCode::F00_BAD_REQUEST,
                message: b"Packet expires too far in the future",
                triggered_by: Some(&self.store.get_ilp_address()),
                data: &[],
            }
            .build());
        }

        self.next.handle_request(request).await
    }
}

#[async_trait]
impl<O, S, A> OutgoingService<A> for ValidatorService<O, S, A>
where
    O: OutgoingService<A> + Send + Sync,
    S: AddressStore + Send + Sync,
    A: Account + Sync + 'static,
{
    /// On sending a request:
    /// 1. An already-expired packet is rejected with `R00` without being sent
    /// 2. The forward is raced against the packet's own expiry: if no
    ///    response arrives in time, the pending send is dropped and a
    ///    synthetic `R00` reject is returned. Dropping the send means a late
    ///    real response can never be observed, so the balance layer above
    ///    releases each reservation exactly once.
    /// 3. A Fulfill whose fulfillment does not hash to the original
    ///    execution condition is converted into an `F09` reject
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        let mut condition: [u8; 32] = [0; 32];
        condition[..].copy_from_slice(request.prepare.execution_condition());

        let expires_at = DateTime::<Utc>::from(request.prepare.expires_at());
        let now = Utc::now();
        let time_left = expires_at - now;
        let ilp_address = self.store.get_ilp_address();
        if time_left <= Duration::zero() {
            error!(
                "Outgoing packet expired {}ms ago",
                (Duration::zero() - time_left).num_milliseconds(),
            );
            return Err(RejectBuilder {
                code: ErrorCode::R00_TRANSFER_TIMED_OUT,
                message: &[],
                triggered_by: Some(&ilp_address),
                data: &[],
            }
            .build());
        }

        let timeout = time_left
            .to_std()
            .expect("positive duration converts to std");
        let result = tokio::time::timeout(timeout, self.next.send_request(request)).await;

        let fulfill = match result {
            Err(_elapsed) => {
                error!(
                    "Outgoing request timed out after {}ms (expiry was: {})",
                    time_left.num_milliseconds(),
                    expires_at,
                );
                return Err(RejectBuilder {
                    code: ErrorCode::R00_TRANSFER_TIMED_OUT,
                    message: &[],
                    triggered_by: Some(&ilp_address),
                    data: &[],
                }
                .build());
            }
            Ok(Err(reject)) => return Err(reject),
            Ok(Ok(fulfill)) => fulfill,
        };

        let generated_condition = digest(&SHA256, fulfill.fulfillment());
        if generated_condition.as_ref() == condition {
            Ok(fulfill)
        } else {
            error!(
                "Fulfillment did not match condition. Fulfillment: {}, hash: {}, actual condition: {}",
                hex::encode(fulfill.fulfillment()),
                hex::encode(generated_condition),
                hex::encode(condition)
            );
            Err(RejectBuilder {
                code: ErrorCode::F09_INVALID_PEER_RESPONSE,
                message: b"Fulfillment did not match condition",
                triggered_by: Some(&ilp_address),
                data: &[],
            }
            .build())
        }
    }
}


#[cfg(test)]
mod incoming {
    use super::test_helpers::*;
    use super::*;
    use connector_packet::{Address, FulfillBuilder, PrepareBuilder};
    use connector_service::incoming_service_fn;
    use parking_lot::Mutex;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    fn test_prepare(expires_in_secs: i64) -> connector_packet::Prepare {
        let expires_at = if expires_in_secs >= 0 {
            SystemTime::now() + Duration::from_secs(expires_in_secs as u64)
        } else {
            SystemTime::now() - Duration::from_secs((-expires_in_secs) as u64)
        };
        PrepareBuilder {
            destination: Address::from_str("example.destination").unwrap(),
            amount: 100,
            expires_at,
            execution_condition: EXECUTION_CONDITION,
            data: b"test data",
        }
        .build()
    }

    #[tokio::test]
    async fn lets_through_valid_incoming_packet() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_clone = requests.clone();
        let mut validator = ValidatorService::incoming(
            TestStore,
            incoming_service_fn(move |request| {
                requests_clone.lock().push(request);
                Ok(FulfillBuilder {
                    fulfillment: &[0; 32],
                    data: b"test data",
                }
                .build())
            }),
        );
        let result = validator
            .handle_request(IncomingRequest {
                from: TestAccount,
                prepare: test_prepare(20),
            })
            .await;

        assert_eq!(requests.lock().len(), 1);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejects_expired_incoming_packet() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_clone = requests.clone();
        let mut validator = ValidatorService::incoming(
            TestStore,
            incoming_service_fn(move |request| {
                requests_clone.lock().push(request);
                Ok(FulfillBuilder {
                    fulfillment: &[0; 32],
                    data: b"test data",
                }
                .build())
            }),
        );
        let result = validator
            .handle_request(IncomingRequest {
                from: TestAccount,
                prepare: test_prepare(-30),
            })
            .await;

        assert!(requests.lock().is_empty());
        assert_eq!(
            result.unwrap_err().code(),
            ErrorCode::R00_TRANSFER_TIMED_OUT
        );
    }

    #[tokio::test]
    async fn rejects_packet_beyond_max_hold_window() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_clone = requests.clone();
        let mut validator = ValidatorService::incoming(
            TestStore,
            incoming_service_fn(move |request| {
                requests_clone.lock().push(request);
                Ok(FulfillBuilder {
                    fulfillment: &[0; 32],
                    data: b"test data",
                }
                .build())
            }),
        );
        let result = validator
            .handle_request(IncomingRequest {
                from: TestAccount,
                prepare: test_prepare(3600),
            })
            .await;

        assert!(requests.lock().is_empty());
        assert_eq!(result.unwrap_err().code(), ErrorCode::F00_BAD_REQUEST);
    }
}
