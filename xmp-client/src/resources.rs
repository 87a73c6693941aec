//! The tester, its modules and ports.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::net::ToSocketAddrs;
use xmp_protocol::{
    Address,
    commands::{
        Username,
        cdb::{CdbRequest, PX_CDB_COMMAND},
        chassis::{C_KEEPALIVE, C_LOGON, C_NAME, C_OWNER, Password},
        indexed::*,
        module::M_COMMENT,
        port::{
            P_COMMENT, P_IPADDRESS, P_IPV6ADDRESS, P_RECEIVESYNC, P_SPEED, P_TRAFFIC,
        },
    },
};

use crate::{
    command::CommandHandle,
    config::Config,
    connection::Connection,
    error::Result,
    indices::{IndexKind, IndexManager, IndexedResource},
    reservation::{ChassisScope, ModuleScope, PortScope, Reservation},
    retry::{RetryPolicy, retry_while_pending},
};

/// User name and chassis password used to log on.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Credentials {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A logged-on session with one tester chassis.
pub struct Tester {
    connection: Arc<Connection>,
    username: String,
    reservation: Reservation<ChassisScope>,
    modules: Mutex<BTreeMap<u8, Arc<Module>>>,
}

impl Tester {
    /// Connects, logs on with the chassis password and announces the user name.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        credentials: Credentials,
        config: Config,
    ) -> Result<Tester> {
        let connection = Connection::connect(addr, config).await?;
        if let Err(e) = logon(&connection, &credentials).await {
            connection.close().await;
            return Err(e);
        }
        log::info!(
            "Logged on to {} as {}",
            connection.peer_addr(),
            credentials.username
        );
        Ok(Tester::from_connection(connection, credentials.username))
    }

    /// Wraps a connection that is already logged on.
    pub fn from_connection(connection: Arc<Connection>, username: String) -> Tester {
        Tester {
            reservation: Reservation::new(Arc::clone(&connection), Address::chassis()),
            connection,
            username,
            modules: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn reservation(&self) -> &Reservation<ChassisScope> {
        &self.reservation
    }

    pub fn name(&self) -> CommandHandle<C_NAME> {
        self.connection.command(Address::chassis())
    }

    pub fn keepalive(&self) -> CommandHandle<C_KEEPALIVE> {
        self.connection.command(Address::chassis())
    }

    /// The module with id `module`. The handle is created on first use.
    pub fn module(&self, module: u8) -> Arc<Module> {
        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            modules
                .entry(module)
                .or_insert_with(|| Arc::new(Module::new(Arc::clone(&self.connection), module))),
        )
    }

    /// Shorthand for `self.module(module).port(port)`.
    pub fn port(&self, module: u8, port: u8) -> Arc<Port> {
        self.module(module).port(port)
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

impl fmt::Debug for Tester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tester")
            .field("connection", &self.connection)
            .field("username", &self.username)
            .finish()
    }
}

async fn logon(connection: &Arc<Connection>, credentials: &Credentials) -> Result<()> {
    connection
        .command::<C_LOGON>(Address::chassis())
        .set(Password {
            password: credentials.password.clone(),
        })
        .await?;
    connection
        .command::<C_OWNER>(Address::chassis())
        .set(Username {
            username: credentials.username.clone(),
        })
        .await
}

pub struct Module {
    id: u8,
    connection: Arc<Connection>,
    reservation: Reservation<ModuleScope>,
    ports: Mutex<BTreeMap<u8, Arc<Port>>>,
}

impl Module {
    fn new(connection: Arc<Connection>, id: u8) -> Module {
        Module {
            id,
            reservation: Reservation::new(Arc::clone(&connection), Address::module(id)),
            connection,
            ports: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn address(&self) -> Address {
        Address::module(self.id)
    }

    pub fn reservation(&self) -> &Reservation<ModuleScope> {
        &self.reservation
    }

    pub fn comment(&self) -> CommandHandle<M_COMMENT> {
        self.connection.command(self.address())
    }

    /// The port with id `port`. The handle is created on first use.
    pub fn port(&self, port: u8) -> Arc<Port> {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            ports
                .entry(port)
                .or_insert_with(|| Arc::new(Port::new(Arc::clone(&self.connection), self.id, port))),
        )
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module {}", self.id)
    }
}

pub struct Port {
    address: Address,
    connection: Arc<Connection>,
    reservation: Reservation<PortScope>,
    pub streams: IndexManager<Streams>,
    pub filters: IndexManager<Filters>,
    pub length_terms: IndexManager<LengthTerms>,
    pub match_terms: IndexManager<MatchTerms>,
    pub histograms: IndexManager<Histograms>,
    pub macsec_tx: IndexManager<MacsecTxChannels>,
    pub macsec_rx: IndexManager<MacsecRxChannels>,
}

impl Port {
    fn new(connection: Arc<Connection>, module: u8, port: u8) -> Port {
        let address = Address::port(module, port);
        Port {
            reservation: Reservation::new(Arc::clone(&connection), address.clone()),
            streams: IndexManager::new(Arc::clone(&connection), address.clone()),
            filters: IndexManager::new(Arc::clone(&connection), address.clone()),
            length_terms: IndexManager::new(Arc::clone(&connection), address.clone()),
            match_terms: IndexManager::new(Arc::clone(&connection), address.clone()),
            histograms: IndexManager::new(Arc::clone(&connection), address.clone()),
            macsec_tx: IndexManager::new(Arc::clone(&connection), address.clone()),
            macsec_rx: IndexManager::new(Arc::clone(&connection), address.clone()),
            connection,
            address,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn reservation(&self) -> &Reservation<PortScope> {
        &self.reservation
    }

    pub fn speed(&self) -> CommandHandle<P_SPEED> {
        self.connection.command(self.address.clone())
    }

    pub fn traffic(&self) -> CommandHandle<P_TRAFFIC> {
        self.connection.command(self.address.clone())
    }

    pub fn receive_sync(&self) -> CommandHandle<P_RECEIVESYNC> {
        self.connection.command(self.address.clone())
    }

    pub fn comment(&self) -> CommandHandle<P_COMMENT> {
        self.connection.command(self.address.clone())
    }

    pub fn ipv4(&self) -> CommandHandle<P_IPADDRESS> {
        self.connection.command(self.address.clone())
    }

    pub fn ipv6(&self) -> CommandHandle<P_IPV6ADDRESS> {
        self.connection.command(self.address.clone())
    }

    pub fn cdb(&self) -> CommandHandle<PX_CDB_COMMAND> {
        self.connection.command(self.address.clone())
    }

    /// Issues a CDB instruction and polls for its reply while the transceiver is busy.
    pub async fn run_cdb(
        &self,
        command: serde_json::Value,
        policy: &RetryPolicy,
    ) -> Result<serde_json::Value> {
        let cdb = self.cdb();
        cdb.set(CdbRequest { command }).await?;
        let reply = retry_while_pending(policy, || cdb.get()).await?;
        Ok(reply.reply)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port {}", self.address)
    }
}

macro_rules! index_kinds {
    ($( $(#[$meta:meta])* $kind:ident = $family:ident, $indices:ident, $create:ident, $delete:ident; )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy)]
            pub struct $kind;

            impl IndexKind for $kind {
                const NAME: &'static str = $family.name;
                type Indices = $indices;
                type Create = $create;
                type Delete = $delete;
            }
        )*
    };
}

index_kinds! {
    Streams = STREAMS, PS_INDICES, PS_CREATE, PS_DELETE;
    Filters = FILTERS, PF_INDICES, PF_CREATE, PF_DELETE;
    LengthTerms = LENGTH_TERMS, PL_INDICES, PL_CREATE, PL_DELETE;
    MatchTerms = MATCH_TERMS, PM_INDICES, PM_CREATE, PM_DELETE;
    Histograms = HISTOGRAMS, PD_INDICES, PD_CREATE, PD_DELETE;
    /// MACsec transmit secure channels.
    MacsecTxChannels = MACSEC_TXSC, P_MACSEC_TXSC_INDICES, P_MACSEC_TXSC_CREATE, P_MACSEC_TXSC_DELETE;
    /// MACsec receive secure channels.
    MacsecRxChannels = MACSEC_RXSC, P_MACSEC_RXSC_INDICES, P_MACSEC_RXSC_CREATE, P_MACSEC_RXSC_DELETE;
}

pub type Stream = IndexedResource<Streams>;
pub type Filter = IndexedResource<Filters>;
pub type LengthTerm = IndexedResource<LengthTerms>;
pub type MatchTerm = IndexedResource<MatchTerms>;
pub type Histogram = IndexedResource<Histograms>;
pub type MacsecTxChannel = IndexedResource<MacsecTxChannels>;
pub type MacsecRxChannel = IndexedResource<MacsecRxChannels>;

impl IndexedResource<Streams> {
    pub fn enable(&self) -> CommandHandle<PS_ENABLE> {
        self.command()
    }

    pub fn comment(&self) -> CommandHandle<PS_COMMENT> {
        self.command()
    }

    pub fn rate_fraction(&self) -> CommandHandle<PS_RATEFRACTION> {
        self.command()
    }

    pub fn packet_header(&self) -> CommandHandle<PS_PACKETHEADER> {
        self.command()
    }

    pub fn tpld_id(&self) -> CommandHandle<PS_TPLDID> {
        self.command()
    }
}

impl IndexedResource<Filters> {
    pub fn enable(&self) -> CommandHandle<PF_ENABLE> {
        self.command()
    }

    pub fn comment(&self) -> CommandHandle<PF_COMMENT> {
        self.command()
    }

    pub fn condition(&self) -> CommandHandle<PF_CONDITION> {
        self.command()
    }
}

impl IndexedResource<LengthTerms> {
    pub fn length(&self) -> CommandHandle<PL_LENGTH> {
        self.command()
    }
}

impl IndexedResource<MatchTerms> {
    pub fn match_value(&self) -> CommandHandle<PM_MATCH> {
        self.command()
    }

    pub fn position(&self) -> CommandHandle<PM_POSITION> {
        self.command()
    }
}

impl IndexedResource<Histograms> {
    pub fn enable(&self) -> CommandHandle<PD_ENABLE> {
        self.command()
    }

    pub fn range(&self) -> CommandHandle<PD_RANGE> {
        self.command()
    }
}

impl IndexedResource<MacsecTxChannels> {
    pub fn description(&self) -> CommandHandle<P_MACSEC_TXSC_DESCR> {
        self.command()
    }

    pub fn sci(&self) -> CommandHandle<P_MACSEC_TXSC_SCI> {
        self.command()
    }
}

impl IndexedResource<MacsecRxChannels> {
    pub fn description(&self) -> CommandHandle<P_MACSEC_RXSC_DESCR> {
        self.command()
    }

    pub fn sci(&self) -> CommandHandle<P_MACSEC_RXSC_SCI> {
        self.command()
    }
}
