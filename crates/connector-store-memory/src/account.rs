use connector_ccp::{CcpRoutingAccount, RoutingRelation};
use connector_errors::AccountStoreError;
use connector_packet::{Address, AddressPrefix};
use connector_service::{Account as AccountTrait, Username};
use connector_service_util::{
    MaxPacketAmountAccount, MinBalanceAccount, RateLimitAccount, RoundTripTimeAccount,
    DEFAULT_ROUND_TRIP_TIME,
};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Everything configurable about an account. Passed to
/// [`Account::new`](./struct.Account.html#method.new), which validates it.
#[derive(Clone, Debug)]
pub struct AccountSettings {
    pub username: Username,
    pub ilp_address: Address,
    pub asset_code: String,
    pub asset_scale: u8,
    pub routing_relation: RoutingRelation,
    /// Extra address prefixes this account is configured to handle, besides
    /// its own address
    pub configured_routes: Vec<AddressPrefix>,
    /// How far negative we let this account's net balance go. None means
    /// the balance is not checked at all.
    pub min_balance: Option<i64>,
    pub max_packet_amount: u64,
    pub round_trip_time: u64,
    pub packets_per_minute_limit: Option<u32>,
    pub amount_per_minute_limit: Option<u64>,
    pub should_send_routes: bool,
    pub should_receive_routes: bool,
}

impl AccountSettings {
    /// Settings with sane defaults: no limits, no routing, child relation.
    pub fn new(
        username: Username,
        ilp_address: Address,
        asset_code: &str,
        asset_scale: u8,
    ) -> Self {
        AccountSettings {
            username,
            ilp_address,
            asset_code: asset_code.to_string(),
            asset_scale,
            routing_relation: RoutingRelation::Child,
            configured_routes: Vec::new(),
            min_balance: None,
            max_packet_amount: u64::MAX,
            round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            packets_per_minute_limit: None,
            amount_per_minute_limit: None,
            should_send_routes: false,
            should_receive_routes: false,
        }
    }
}

#[derive(Debug)]
struct AccountInner {
    id: Uuid,
    settings: AccountSettings,
}

/// An immutable, cheaply clonable account record.
#[derive(Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

impl Account {
    /// Validates the settings and builds the account. Settings updates
    /// produce a whole new `Account`; existing clones keep seeing the old
    /// record.
    pub fn new(id: Uuid, settings: AccountSettings) -> Result<Self, AccountStoreError> {
        if settings.asset_code.is_empty() {
            return Err(AccountStoreError::InvalidAccountSettings(format!(
                "account {} has an empty asset code",
                id
            )));
        }
        if settings.max_packet_amount == 0 {
            return Err(AccountStoreError::InvalidAccountSettings(format!(
                "account {} would not be able to send any packets",
                id
            )));
        }
        Ok(Account {
            inner: Arc::new(AccountInner { id, settings }),
        })
    }

    pub fn settings(&self) -> &AccountSettings {
        &self.inner.settings
    }

    pub fn configured_routes(&self) -> &[AddressPrefix] {
        &self.inner.settings.configured_routes
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.inner.id)
            .field("username", &self.inner.settings.username)
            .field("ilp_address", &self.inner.settings.ilp_address)
            .field("relation", &self.inner.settings.routing_relation)
            .finish()
    }
}

impl AccountTrait for Account {
    fn id(&self) -> Uuid {
        self.inner.id
    }

    fn username(&self) -> &Username {
        &self.inner.settings.username
    }

    fn ilp_address(&self) -> &Address {
        &self.inner.settings.ilp_address
    }

    fn asset_code(&self) -> &str {
        &self.inner.settings.asset_code
    }

    fn asset_scale(&self) -> u8 {
        self.inner.settings.asset_scale
    }
}

impl CcpRoutingAccount for Account {
    fn routing_relation(&self) -> RoutingRelation {
        self.inner.settings.routing_relation
    }

    fn should_send_routes(&self) -> bool {
        self.inner.settings.should_send_routes
    }

    fn should_receive_routes(&self) -> bool {
        self.inner.settings.should_receive_routes
    }
}

impl MaxPacketAmountAccount for Account {
    fn max_packet_amount(&self) -> u64 {
        self.inner.settings.max_packet_amount
    }
}

impl MinBalanceAccount for Account {
    fn min_balance(&self) -> Option<i64> {
        self.inner.settings.min_balance
    }
}

impl RateLimitAccount for Account {
    fn packets_per_minute_limit(&self) -> Option<u32> {
        self.inner.settings.packets_per_minute_limit
    }

    fn amount_per_minute_limit(&self) -> Option<u64> {
        self.inner.settings.amount_per_minute_limit
    }
}

impl RoundTripTimeAccount for Account {
    fn round_trip_time(&self) -> u64 {
        self.inner.settings.round_trip_time
    }
}
