use async_trait::async_trait;
use connector_errors::BalanceStoreError;
use connector_packet::{ErrorCode, RejectBuilder};
use connector_service::{
    Account, AddressStore, IlpResult, OutgoingRequest, OutgoingService,
};
use std::marker::PhantomData;
use tracing::{debug, error};
use uuid::Uuid;

/// A snapshot of one account's ledger position.
///
/// `clearing_balance` is what has cleared through packet traffic,
/// `prepaid_amount` is what the counterparty has paid ahead of traffic.
/// The net position is always their sum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountBalance {
    pub clearing_balance: i64,
    pub prepaid_amount: i64,
}

impl AccountBalance {
    pub const ZERO: AccountBalance = AccountBalance {
        clearing_balance: 0,
        prepaid_amount: 0,
    };

    pub fn net_balance(&self) -> i64 {
        self.clearing_balance + self.prepaid_amount
    }
}

/// Extension trait for accounts with a configured minimum balance
/// (i.e. a credit limit — how far negative we let them go).
pub trait MinBalanceAccount: Account {
    fn min_balance(&self) -> Option<i64> {
        None
    }
}

/// Trait responsible for an account's balance as packets get routed.
///
/// All mutations for one account are serialized by the store; calls for
/// unrelated accounts never contend. An account that has never been seen is
/// treated as having zero balances, not as an error.
#[async_trait]
pub trait BalanceStore {
    /// Fetch the current balance for the given account id.
    async fn get_balance(&self, account_id: Uuid) -> Result<AccountBalance, BalanceStoreError>;

    /// Reserves `incoming_amount` against the sending account before the
    /// packet is forwarded. Fails without any state change if the account's
    /// net balance cannot cover it within its minimum-balance limit.
    async fn update_balances_for_prepare(
        &self,
        from_account_id: Uuid,
        incoming_amount: u64,
    ) -> Result<(), BalanceStoreError>;

    /// Commits a forwarded packet once the Fulfill comes back, crediting
    /// the receiving account. Returns the account's new net balance.
    async fn update_balances_for_fulfill(
        &self,
        to_account_id: Uuid,
        outgoing_amount: u64,
    ) -> Result<i64, BalanceStoreError>;

    /// Releases the reservation made for a prepare whose response was a
    /// Reject (or a timeout), restoring the sender's balance exactly.
    async fn update_balances_for_reject(
        &self,
        from_account_id: Uuid,
        incoming_amount: u64,
    ) -> Result<(), BalanceStoreError>;

    /// Re-credits an account when a previously recorded outgoing settlement
    /// has to be reversed. The amount is a signed integer; negative values
    /// are rejected before any state change.
    async fn refund_outgoing_settlement(
        &self,
        account_id: Uuid,
        amount: i64,
    ) -> Result<AccountBalance, BalanceStoreError>;
}

/// # Balance Service
///
/// Outgoing service that reserves the packet's amount against the sender on
/// prepare, then settles the reservation exactly once when the response
/// comes back: committed on Fulfill, released on Reject. The expiry
/// validator downstream converts timeouts into Rejects, so from this
/// service's point of view every prepare gets exactly one response.
#[derive(Clone)]
pub struct BalanceService<S, O, A> {
    store: S,
    next: O,
    account_type: PhantomData<A>,
}

impl<S, O, A> BalanceService<S, O, A>
where
    S: AddressStore + BalanceStore,
    O: OutgoingService<A>,
    A: Account,
{
    pub fn new(store: S, next: O) -> Self {
        BalanceService {
            store,
            next,
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<S, O, A> OutgoingService<A> for BalanceService<S, O, A>
where
    S: AddressStore + BalanceStore + Clone + Send + Sync + 'static,
    O: OutgoingService<A> + Send + Clone + 'static,
    A: Account + Send + Sync + 'static,
{
    /// On send request:
    /// 1. Reserves the amount against the sender; a failed reservation
    ///    becomes a `T04` reject and nothing is forwarded.
    /// 2. Forwards the request.
    ///     - On Fulfill, commits the amount to the receiving account. The
    ///       commit is written in the background so the Fulfill is relayed
    ///       back without waiting on the store — if we sit on it past the
    ///       previous hop's expiry, we don't get paid.
    ///     - On Reject, releases the reservation the same way.
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        // Don't bother touching the store for zero-amount packets.
        if request.prepare.amount() == 0 && request.original_amount == 0 {
            return self.next.send_request(request).await;
        }

        let store = self.store.clone();
        let from_id = request.from.id();
        let to_id = request.to.id();
        let incoming_amount = request.original_amount;
        let outgoing_amount = request.prepare.amount();
        let ilp_address = self.store.get_ilp_address();

        self.store
            .update_balances_for_prepare(from_id, incoming_amount)
            .await
            .map_err(|_| {
                debug!("Rejecting packet because it would exceed a balance limit");
                RejectBuilder {
                    code: ErrorCode::T04_INSUFFICIENT_LIQUIDITY,
                    message: &[],
                    triggered_by: Some(&ilp_address),
                    data: &[],
                }
                .build()
            })?;

        match self.next.send_request(request).await {
            Ok(fulfill) => {
                if outgoing_amount > 0 {
                    let commit = async move {
                        match store
                            .update_balances_for_fulfill(to_id, outgoing_amount)
                            .await
                        {
                            Ok(balance) => {
                                debug!("Account balance after fulfill: {}", balance)
                            }
                            Err(err) => error!(
                                "Error applying balance changes for fulfill from account: {} to account: {}. Incoming amount was: {}, outgoing amount was: {}: {}",
                                from_id, to_id, incoming_amount, outgoing_amount, err
                            ),
                        }
                    };

                    #[cfg(not(test))]
                    tokio::spawn(commit);
                    #[cfg(test)]
                    commit.await;
                }

                Ok(fulfill)
            }
            Err(reject) => {
                // The packet is already rejected; relay the original reject
                // rather than failing on a slow or broken store, which would
                // only replace a specific error with a vague one.
                let release = async move {
                    if let Err(err) = store
                        .update_balances_for_reject(from_id, incoming_amount)
                        .await
                    {
                        error!(
                            "Error rolling back balance change for accounts: {} and {}. Incoming amount was: {}, outgoing amount was: {}: {}",
                            from_id, to_id, incoming_amount, outgoing_amount, err
                        );
                    }
                };

                #[cfg(not(test))]
                tokio::spawn(release);
                #[cfg(test)]
                release.await;

                Err(reject)
            }
        }
    }
}
