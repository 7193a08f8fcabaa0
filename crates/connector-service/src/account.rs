use super::Username;
use async_trait::async_trait;
use connector_errors::AccountStoreError;
use connector_packet::Address;
use std::fmt::Debug;
use uuid::Uuid;

/// The base trait that every account type must implement.
///
/// Filters that need more than this define extension traits
/// (`CcpRoutingAccount`, `MaxPacketAmountAccount`, ...) so that each filter
/// only sees the account attributes it actually enforces.
pub trait Account: Clone + Send + Sized + Debug {
    fn id(&self) -> Uuid;
    fn username(&self) -> &Username;
    fn ilp_address(&self) -> &Address;
    fn asset_scale(&self) -> u8;
    fn asset_code(&self) -> &str;
}

/// Looks up accounts by id.
#[async_trait]
pub trait AccountStore: Clone {
    type Account: Account;

    /// Loads the accounts with the given ids. Errors if any of them is
    /// unknown or has been deleted.
    async fn get_accounts(
        &self,
        account_ids: Vec<Uuid>,
    ) -> Result<Vec<Self::Account>, AccountStoreError>;

    async fn get_account_id_from_username(
        &self,
        username: &Username,
    ) -> Result<Uuid, AccountStoreError>;
}

/// Account lifecycle operations.
///
/// Accounts come from static configuration or are provisioned dynamically
/// when a child link connects. Deletes are always soft: the account moves to
/// a tombstone set so its balance history stays intact.
#[async_trait]
pub trait AccountManagerStore: AccountStore {
    type AccountSettings: Send + 'static;

    async fn insert_account(
        &self,
        settings: Self::AccountSettings,
    ) -> Result<Self::Account, AccountStoreError>;

    async fn update_account(
        &self,
        id: Uuid,
        settings: Self::AccountSettings,
    ) -> Result<Self::Account, AccountStoreError>;

    /// Tombstones the account. Subsequent lookups fail, but the stored
    /// record (and its balances) are retained.
    async fn soft_delete_account(&self, id: Uuid) -> Result<(), AccountStoreError>;
}
