use crate::account::{Account, AccountSettings};
use async_trait::async_trait;
use connector_ccp::{CcpRoutingAccount, CcpRoutingStore};
use connector_errors::{
    AccountStoreError, AddressStoreError, BalanceStoreError, CcpRoutingStoreError,
};
use connector_packet::Address;
use connector_router::RouterStore;
use connector_service::{
    Account as AccountTrait, AccountManagerStore, AccountStore, AddressStore, Username,
};
use connector_service_util::{
    AccountBalance, BalanceStore, MinBalanceAccount, RateLimitAccount, RateLimitError,
    RateLimitStore,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct BalanceEntry {
    clearing_balance: i64,
    prepaid_amount: i64,
}

impl BalanceEntry {
    fn snapshot(&self) -> AccountBalance {
        AccountBalance {
            clearing_balance: self.clearing_balance,
            prepaid_amount: self.prepaid_amount,
        }
    }
}

#[derive(Debug)]
struct RateLimitWindow {
    window_start: Instant,
    packets: u32,
    amount: u64,
}

/// An in-memory store for a single connector process.
///
/// Accounts and the routing snapshot are read-mostly: they live behind
/// `RwLock`s and the snapshot itself is swapped atomically as a whole
/// `Arc`, so readers never wait on a route update. Balances are
/// write-heavy: each account's entry has its own `Mutex`, so mutations for
/// one account are serialized while unrelated accounts proceed in
/// parallel; the outer `RwLock` is held only long enough to find or create
/// the entry.
#[derive(Clone)]
pub struct InMemoryStore {
    ilp_address: Arc<RwLock<Address>>,
    accounts: Arc<RwLock<HashMap<Uuid, Account>>>,
    /// Soft-deleted accounts. Kept so that balance history stays auditable;
    /// lookups treat them as deleted, not unknown.
    tombstones: Arc<RwLock<HashMap<Uuid, Account>>>,
    balances: Arc<RwLock<HashMap<Uuid, Arc<Mutex<BalanceEntry>>>>>,
    rate_limits: Arc<Mutex<HashMap<Uuid, RateLimitWindow>>>,
    routing_table: Arc<RwLock<Arc<HashMap<String, Uuid>>>>,
}

impl InMemoryStore {
    pub fn new(ilp_address: Address) -> Self {
        InMemoryStore {
            ilp_address: Arc::new(RwLock::new(ilp_address)),
            accounts: Arc::new(RwLock::new(HashMap::new())),
            tombstones: Arc::new(RwLock::new(HashMap::new())),
            balances: Arc::new(RwLock::new(HashMap::new())),
            rate_limits: Arc::new(Mutex::new(HashMap::new())),
            routing_table: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
        }
    }

    /// Registers an already-constructed account, mostly for tests and
    /// startup configuration.
    pub fn add_account(&self, account: Account) {
        self.accounts.write().insert(account.id(), account);
    }

    fn balance_entry(&self, account_id: Uuid) -> Arc<Mutex<BalanceEntry>> {
        if let Some(entry) = self.balances.read().get(&account_id) {
            return entry.clone();
        }
        // Accounts referenced for the first time start at zero.
        self.balances
            .write()
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(BalanceEntry::default())))
            .clone()
    }

    fn min_balance_of(&self, account_id: Uuid) -> Option<i64> {
        self.accounts
            .read()
            .get(&account_id)
            .and_then(|account| account.min_balance())
    }
}

#[async_trait]
impl AddressStore for InMemoryStore {
    async fn set_ilp_address(&self, ilp_address: Address) -> Result<(), AddressStoreError> {
        *self.ilp_address.write() = ilp_address;
        Ok(())
    }

    async fn clear_ilp_address(&self) -> Result<(), AddressStoreError> {
        *self.ilp_address.write() =
            Address::from_str("local.host").expect("default address is valid");
        Ok(())
    }

    fn get_ilp_address(&self) -> Address {
        self.ilp_address.read().clone()
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    type Account = Account;

    async fn get_accounts(
        &self,
        account_ids: Vec<Uuid>,
    ) -> Result<Vec<Account>, AccountStoreError> {
        let accounts = self.accounts.read();
        let mut result = Vec::with_capacity(account_ids.len());
        for account_id in account_ids {
            match accounts.get(&account_id) {
                Some(account) => result.push(account.clone()),
                None => {
                    return if self.tombstones.read().contains_key(&account_id) {
                        Err(AccountStoreError::AccountDeleted(account_id.to_string()))
                    } else {
                        Err(AccountStoreError::AccountNotFound(account_id.to_string()))
                    };
                }
            }
        }
        Ok(result)
    }

    async fn get_account_id_from_username(
        &self,
        username: &Username,
    ) -> Result<Uuid, AccountStoreError> {
        self.accounts
            .read()
            .iter()
            .find(|(_, account)| account.username() == username)
            .map(|(id, _)| *id)
            .ok_or_else(|| AccountStoreError::AccountNotFound(username.to_string()))
    }
}

#[async_trait]
impl AccountManagerStore for InMemoryStore {
    type AccountSettings = AccountSettings;

    async fn insert_account(
        &self,
        settings: AccountSettings,
    ) -> Result<Account, AccountStoreError> {
        let id = Uuid::new_v4();
        let account = Account::new(id, settings)?;
        let mut accounts = self.accounts.write();
        if accounts
            .values()
            .any(|existing| existing.username() == account.username())
        {
            return Err(AccountStoreError::AccountExists(
                account.username().to_string(),
            ));
        }
        debug!("Inserted account {} (id: {})", account.username(), id);
        accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn update_account(
        &self,
        id: Uuid,
        settings: AccountSettings,
    ) -> Result<Account, AccountStoreError> {
        let account = Account::new(id, settings)?;
        let mut accounts = self.accounts.write();
        if !accounts.contains_key(&id) {
            return Err(if self.tombstones.read().contains_key(&id) {
                AccountStoreError::AccountDeleted(id.to_string())
            } else {
                AccountStoreError::AccountNotFound(id.to_string())
            });
        }
        accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn soft_delete_account(&self, id: Uuid) -> Result<(), AccountStoreError> {
        let account = self
            .accounts
            .write()
            .remove(&id)
            .ok_or_else(|| AccountStoreError::AccountNotFound(id.to_string()))?;
        debug!("Soft-deleted account {} (id: {})", account.username(), id);
        self.tombstones.write().insert(id, account);
        // Balances are retained on purpose. Drop the account's routes from
        // the forwarding snapshot so no new packets go its way.
        let mut routing_table = self.routing_table.write();
        let pruned: HashMap<String, Uuid> = routing_table
            .iter()
            .filter(|(_, account_id)| **account_id != id)
            .map(|(prefix, account_id)| (prefix.clone(), *account_id))
            .collect();
        *routing_table = Arc::new(pruned);
        Ok(())
    }
}

impl RouterStore for InMemoryStore {
    fn routing_table(&self) -> Arc<HashMap<String, Uuid>> {
        self.routing_table.read().clone()
    }
}

#[async_trait]
impl BalanceStore for InMemoryStore {
    async fn get_balance(&self, account_id: Uuid) -> Result<AccountBalance, BalanceStoreError> {
        let entry = self.balance_entry(account_id);
        let entry = entry.lock();
        Ok(entry.snapshot())
    }

    async fn update_balances_for_prepare(
        &self,
        from_account_id: Uuid,
        incoming_amount: u64,
    ) -> Result<(), BalanceStoreError> {
        if incoming_amount == 0 {
            return Ok(());
        }
        let min_balance = self.min_balance_of(from_account_id);
        let entry = self.balance_entry(from_account_id);
        let mut entry = entry.lock();

        if let Some(min_balance) = min_balance {
            let net = entry.clearing_balance + entry.prepaid_amount;
            if net - (incoming_amount as i64) < min_balance {
                trace!(
                    "Refusing to reserve {} against account {}: net balance is {}, min is {}",
                    incoming_amount,
                    from_account_id,
                    net,
                    min_balance
                );
                return Err(BalanceStoreError::InsufficientBalance {
                    account_id: from_account_id,
                    net,
                    amount: incoming_amount,
                });
            }
        }

        entry.clearing_balance -= incoming_amount as i64;
        trace!(
            "Reserved {} against account {}, clearing balance is now {}",
            incoming_amount,
            from_account_id,
            entry.clearing_balance
        );
        Ok(())
    }

    async fn update_balances_for_fulfill(
        &self,
        to_account_id: Uuid,
        outgoing_amount: u64,
    ) -> Result<i64, BalanceStoreError> {
        let entry = self.balance_entry(to_account_id);
        let mut entry = entry.lock();
        entry.clearing_balance += outgoing_amount as i64;
        Ok(entry.clearing_balance + entry.prepaid_amount)
    }

    async fn update_balances_for_reject(
        &self,
        from_account_id: Uuid,
        incoming_amount: u64,
    ) -> Result<(), BalanceStoreError> {
        if incoming_amount == 0 {
            return Ok(());
        }
        let entry = self.balance_entry(from_account_id);
        let mut entry = entry.lock();
        entry.clearing_balance += incoming_amount as i64;
        trace!(
            "Released {} back to account {}, clearing balance is now {}",
            incoming_amount,
            from_account_id,
            entry.clearing_balance
        );
        Ok(())
    }

    async fn refund_outgoing_settlement(
        &self,
        account_id: Uuid,
        amount: i64,
    ) -> Result<AccountBalance, BalanceStoreError> {
        if amount < 0 {
            return Err(BalanceStoreError::NegativeAmount(amount));
        }
        let entry = self.balance_entry(account_id);
        let mut entry = entry.lock();
        entry.clearing_balance += amount;
        Ok(entry.snapshot())
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    type Account = Account;

    async fn apply_rate_limits(
        &self,
        account: Account,
        prepare_amount: u64,
    ) -> Result<(), RateLimitError> {
        let packet_limit = account.packets_per_minute_limit();
        let amount_limit = account.amount_per_minute_limit();
        if packet_limit.is_none() && amount_limit.is_none() {
            return Ok(());
        }

        let mut windows = self.rate_limits.lock();
        let window = windows.entry(account.id()).or_insert_with(|| RateLimitWindow {
            window_start: Instant::now(),
            packets: 0,
            amount: 0,
        });
        if window.window_start.elapsed() >= RATE_LIMIT_WINDOW {
            window.window_start = Instant::now();
            window.packets = 0;
            window.amount = 0;
        }

        if let Some(limit) = packet_limit {
            if window.packets >= limit {
                return Err(RateLimitError::PacketLimitExceeded);
            }
        }
        if let Some(limit) = amount_limit {
            if window.amount.saturating_add(prepare_amount) > limit {
                return Err(RateLimitError::ThroughputLimitExceeded);
            }
        }

        window.packets += 1;
        window.amount = window.amount.saturating_add(prepare_amount);
        Ok(())
    }

    async fn refund_throughput_limit(
        &self,
        account: Account,
        prepare_amount: u64,
    ) -> Result<(), RateLimitError> {
        let mut windows = self.rate_limits.lock();
        if let Some(window) = windows.get_mut(&account.id()) {
            window.amount = window.amount.saturating_sub(prepare_amount);
        }
        Ok(())
    }
}

#[async_trait]
impl CcpRoutingStore for InMemoryStore {
    type Account = Account;

    async fn get_accounts_to_send_routes_to(
        &self,
        ignore_accounts: Vec<Uuid>,
    ) -> Result<Vec<Account>, CcpRoutingStoreError> {
        Ok(self
            .accounts
            .read()
            .values()
            .filter(|account| {
                account.should_send_routes() && !ignore_accounts.contains(&account.id())
            })
            .cloned()
            .collect())
    }

    async fn get_accounts_to_receive_routes_from(
        &self,
    ) -> Result<Vec<Account>, CcpRoutingStoreError> {
        Ok(self
            .accounts
            .read()
            .values()
            .filter(|account| account.should_receive_routes())
            .cloned()
            .collect())
    }

    async fn get_local_and_configured_routes(
        &self,
    ) -> Result<(HashMap<String, Account>, HashMap<String, Account>), CcpRoutingStoreError> {
        let accounts = self.accounts.read();
        let mut local = HashMap::new();
        let mut configured = HashMap::new();
        for account in accounts.values() {
            local.insert(account.ilp_address().to_string(), account.clone());
            for prefix in account.configured_routes() {
                configured.insert(prefix.to_string(), account.clone());
            }
        }
        Ok((local, configured))
    }

    async fn set_routes(
        &mut self,
        routes: Vec<(String, Account)>,
    ) -> Result<(), CcpRoutingStoreError> {
        let snapshot: HashMap<String, Uuid> = routes
            .into_iter()
            .map(|(prefix, account)| (prefix, account.id()))
            .collect();
        trace!("Installing routing snapshot with {} prefixes", snapshot.len());
        *self.routing_table.write() = Arc::new(snapshot);
        Ok(())
    }
}
