use crate::{CcpRouteManager, CcpRouteManagerBuilder, CcpRoutingAccount, CcpRoutingStore};
use crate::{RoutingRelation, CCP_RESPONSE};
use async_trait::async_trait;
use connector_errors::{AddressStoreError, CcpRoutingStoreError};
use connector_packet::{Address, ErrorCode, RejectBuilder};
use connector_service::{
    incoming_service_fn, outgoing_service_fn, Account, AddressStore, IncomingService,
    OutgoingRequest, OutgoingService, Username,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

pub static ROUTING_ACCOUNT: Lazy<TestAccount> = Lazy::new(|| {
    let mut account = TestAccount::new(
        Uuid::from_slice(&[10; 16]).unwrap(),
        "example.routing-peer",
    );
    account.send_routes = true;
    account.receive_routes = true;
    account
});

pub static NON_ROUTING_ACCOUNT: Lazy<TestAccount> = Lazy::new(|| {
    TestAccount::new(
        Uuid::from_slice(&[11; 16]).unwrap(),
        "example.non-routing-peer",
    )
});

pub static CHILD_ACCOUNT: Lazy<TestAccount> = Lazy::new(|| {
    let mut account = TestAccount::new(Uuid::from_slice(&[12; 16]).unwrap(), "example.child");
    account.relation = RoutingRelation::Child;
    account.send_routes = true;
    account.receive_routes = true;
    account
});

pub static LOCAL_ACCOUNT: Lazy<TestAccount> = Lazy::new(|| {
    let mut account = TestAccount::new(
        Uuid::from_slice(&[13; 16]).unwrap(),
        "example.local.one",
    );
    account.relation = RoutingRelation::Child;
    account
});

pub static CONFIGURED_ACCOUNT: Lazy<TestAccount> = Lazy::new(|| {
    let mut account = TestAccount::new(
        Uuid::from_slice(&[14; 16]).unwrap(),
        "example.configured.one",
    );
    account.relation = RoutingRelation::Child;
    account
});

static USERNAME: Lazy<Username> = Lazy::new(|| Username::from_str("test_account").unwrap());

#[derive(Clone, Debug)]
pub struct TestAccount {
    pub id: Uuid,
    pub ilp_address: Address,
    pub relation: RoutingRelation,
    pub send_routes: bool,
    pub receive_routes: bool,
}

impl TestAccount {
    pub fn new(id: Uuid, ilp_address: &str) -> TestAccount {
        TestAccount {
            id,
            ilp_address: Address::from_str(ilp_address).unwrap(),
            relation: RoutingRelation::Peer,
            send_routes: false,
            receive_routes: false,
        }
    }
}

impl Account for TestAccount {
    fn id(&self) -> Uuid {
        self.id
    }

    fn username(&self) -> &Username {
        &USERNAME
    }

    fn asset_code(&self) -> &str {
        "XYZ"
    }

    fn asset_scale(&self) -> u8 {
        9
    }

    fn ilp_address(&self) -> &Address {
        &self.ilp_address
    }
}

impl CcpRoutingAccount for TestAccount {
    fn routing_relation(&self) -> RoutingRelation {
        self.relation
    }

    fn should_send_routes(&self) -> bool {
        self.send_routes
    }

    fn should_receive_routes(&self) -> bool {
        self.receive_routes
    }
}

#[derive(Clone)]
pub struct TestStore {
    pub local: HashMap<String, TestAccount>,
    pub configured: HashMap<String, TestAccount>,
    /// Routes installed for the router, recorded by set_routes
    pub routes: Arc<Mutex<Vec<(String, TestAccount)>>>,
}

impl TestStore {
    pub fn new() -> TestStore {
        TestStore {
            local: HashMap::new(),
            configured: HashMap::new(),
            routes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_routes() -> TestStore {
        let mut local = HashMap::new();
        local.insert("example.local.one".to_string(), LOCAL_ACCOUNT.clone());
        let mut configured = HashMap::new();
        configured.insert(
            "example.configured.one".to_string(),
            CONFIGURED_ACCOUNT.clone(),
        );
        TestStore {
            local,
            configured,
            routes: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl AddressStore for TestStore {
    async fn set_ilp_address(&self, _: Address) -> Result<(), AddressStoreError> {
        unimplemented!()
    }

    async fn clear_ilp_address(&self) -> Result<(), AddressStoreError> {
        unimplemented!()
    }

    fn get_ilp_address(&self) -> Address {
        Address::from_str("example.connector").unwrap()
    }
}

#[async_trait]
impl CcpRoutingStore for TestStore {
    type Account = TestAccount;

    async fn get_accounts_to_send_routes_to(
        &self,
        ignore_accounts: Vec<Uuid>,
    ) -> Result<Vec<TestAccount>, CcpRoutingStoreError> {
        Ok(vec![ROUTING_ACCOUNT.clone()]
            .into_iter()
            .filter(|account| !ignore_accounts.contains(&account.id))
            .collect())
    }

    async fn get_accounts_to_receive_routes_from(
        &self,
    ) -> Result<Vec<TestAccount>, CcpRoutingStoreError> {
        Ok(vec![CHILD_ACCOUNT.clone()])
    }

    async fn get_local_and_configured_routes(
        &self,
    ) -> Result<(HashMap<String, TestAccount>, HashMap<String, TestAccount>), CcpRoutingStoreError>
    {
        Ok((self.local.clone(), self.configured.clone()))
    }

    async fn set_routes(
        &mut self,
        routes: Vec<(String, TestAccount)>,
    ) -> Result<(), CcpRoutingStoreError> {
        *self.routes.lock() = routes;
        Ok(())
    }
}

fn non_ccp_rejecter() -> impl IncomingService<TestAccount> + Clone + Send + Sync + 'static {
    incoming_service_fn(|_| {
        Err(RejectBuilder {
            code: ErrorCode::F02_UNREACHABLE,
            message: b"not a CCP message",
            triggered_by: None,
            data: &[],
        }
        .build())
    })
}

pub fn test_service() -> CcpRouteManager<
    impl IncomingService<TestAccount> + Clone + Send + Sync + 'static,
    impl OutgoingService<TestAccount> + Clone + Send + Sync + 'static,
    TestStore,
    TestAccount,
> {
    let addr = Address::from_str("example.connector").unwrap();
    CcpRouteManagerBuilder::new(
        addr,
        TestStore::new(),
        outgoing_service_fn(|_| Ok(CCP_RESPONSE.clone())),
        non_ccp_rejecter(),
    )
    .to_service()
}

#[allow(clippy::type_complexity)]
pub fn test_service_with_routes() -> (
    CcpRouteManager<
        impl IncomingService<TestAccount> + Clone + Send + Sync + 'static,
        impl OutgoingService<TestAccount> + Clone + Send + Sync + 'static,
        TestStore,
        TestAccount,
    >,
    Arc<Mutex<Vec<OutgoingRequest<TestAccount>>>>,
) {
    let addr = Address::from_str("example.connector").unwrap();
    let outgoing_requests: Arc<Mutex<Vec<OutgoingRequest<TestAccount>>>> =
        Arc::new(Mutex::new(Vec::new()));
    let outgoing_requests_clone = outgoing_requests.clone();
    let outgoing = outgoing_service_fn(move |request: OutgoingRequest<TestAccount>| {
        outgoing_requests_clone.lock().push(request);
        Ok(CCP_RESPONSE.clone())
    });
    let service = CcpRouteManagerBuilder::new(
        addr,
        TestStore::with_routes(),
        outgoing,
        non_ccp_rejecter(),
    )
    .to_service();
    (service, outgoing_requests)
}
