//! An in-memory tester.
//!
//! The emulator answers the built-in command catalogue the way a chassis would:
//! sessions log on and name their owner, reservations guard every mutation,
//! indexed resources live in per-port tables with a capacity, and changes that
//! other sessions care about are pushed to them. Everything else is plain
//! attribute storage checked against the command schemas.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{Bytes, BytesMut};
use xmp_protocol::{
    Address, Command, CommandSpec, Frame, Registry, Status,
    commands::{
        ReservationOperation, ReservationReply, ReservationRequest, ReservationStatus, Username,
        cdb::{CdbReply, CdbRequest, PX_CDB_COMMAND},
        chassis::{
            C_KEEPALIVE, C_LOGON, C_OWNER, C_RESERVATION, C_RESERVEDBY, KeepaliveReply, Password,
        },
        indexed::{IndexFamily, family_of},
        module::{M_RESERVATION, M_RESERVEDBY},
        port::{P_RESERVATION, P_RESERVEDBY, P_SPEED, P_TRAFFIC, Speed},
        IndexList,
    },
    field::{Value, decode_fields, encode_fields},
    message::{Message, decode_message},
};

use crate::{Session, XmpDevice};

const LOGON: u16 = C_LOGON::CODE;
const OWNER: u16 = C_OWNER::CODE;
const KEEPALIVE: u16 = C_KEEPALIVE::CODE;
const CHASSIS_RESERVATION: u16 = C_RESERVATION::CODE;
const MODULE_RESERVATION: u16 = M_RESERVATION::CODE;
const PORT_RESERVATION: u16 = P_RESERVATION::CODE;
const CHASSIS_RESERVEDBY: u16 = C_RESERVEDBY::CODE;
const MODULE_RESERVEDBY: u16 = M_RESERVEDBY::CODE;
const PORT_RESERVEDBY: u16 = P_RESERVEDBY::CODE;
const CDB: u16 = PX_CDB_COMMAND::CODE;

/// Settings of an [`Emulator`].
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Chassis password expected by `C_LOGON`.
    pub password: String,
    pub modules: u8,
    pub ports_per_module: u8,
    /// Link speed every port starts with.
    pub speed_mbps: u32,
    /// Number of GETs a CDB instruction answers with `Pending` before its reply.
    pub cdb_pending_polls: u32,
    /// Overrides the per-port capacity of the named index families.
    pub capacities: BTreeMap<&'static str, u32>,
    pub registry: Arc<Registry>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            password: "xena".to_owned(),
            modules: 2,
            ports_per_module: 4,
            speed_mbps: 10_000,
            cdb_pending_polls: 2,
            capacities: BTreeMap::new(),
            registry: Registry::builtin(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Chassis,
    Module,
    Port,
}

impl Level {
    fn of(code: u16) -> Level {
        match code >> 8 {
            0 => Level::Chassis,
            1 => Level::Module,
            _ => Level::Port,
        }
    }

    fn reservation_code(self) -> u16 {
        match self {
            Level::Chassis => CHASSIS_RESERVATION,
            Level::Module => MODULE_RESERVATION,
            Level::Port => PORT_RESERVATION,
        }
    }
}

struct Client {
    session: Session,
    logged_on: bool,
    username: Option<String>,
}

#[derive(Debug, Clone)]
struct Holder {
    username: String,
    session: u64,
}

struct CdbJob {
    command: serde_json::Value,
    polls_left: u32,
}

#[derive(Default)]
struct State {
    clients: BTreeMap<u64, Client>,
    reservations: BTreeMap<Address, Holder>,
    attributes: HashMap<(u16, Address), Vec<Value>>,
    /// Defined indices per (family base code, port address).
    tables: BTreeMap<(u16, Address), BTreeSet<u32>>,
    cdb: BTreeMap<Address, CdbJob>,
    keepalives: u64,
    muted: bool,
}

impl State {
    fn view(&self, scope: &Address, username: Option<&str>) -> ReservationStatus {
        match self.reservations.get(scope) {
            None => ReservationStatus::Released,
            Some(holder) if Some(holder.username.as_str()) == username => {
                ReservationStatus::ReservedByYou
            }
            Some(_) => ReservationStatus::ReservedByOther,
        }
    }

    /// Sends `frame(client)` to every logged on client except `except`.
    fn push_others(&self, except: Option<u64>, frame: impl Fn(&Client) -> Option<Frame>) {
        for (id, client) in &self.clients {
            if Some(*id) == except || !client.logged_on {
                continue;
            }
            if let Some(frame) = frame(client) {
                client.session.send(frame);
            }
        }
    }

    fn push_reservation(&self, except: Option<u64>, level: Level, scope: &Address) {
        self.push_others(except, |client| {
            let status = self.view(scope, client.username.as_deref());
            let payload = encode(ReservationReply { status }).ok()?;
            Some(Frame::new(level.reservation_code(), scope.clone(), payload))
        });
    }
}

/// An in-memory tester that implements [`XmpDevice`].
pub struct Emulator {
    config: EmulatorConfig,
    state: Mutex<State>,
}

fn encode<M: Message>(message: M) -> Result<Bytes, Status> {
    let mut payload = BytesMut::new();
    encode_fields(M::FIELDS, &message.into_values(), &mut payload).map_err(|e| {
        log::error!("Cannot encode reply: {}", e);
        Status::NotValid
    })?;
    Ok(payload.freeze())
}

fn decode<M: Message>(payload: &Bytes) -> Result<M, Status> {
    decode_message(payload.clone()).map_err(|e| {
        log::debug!("Rejecting malformed request: {}", e);
        Status::NotValid
    })
}

/// The reservable resource that guards changes to `address`.
fn scope_of(address: &Address) -> Address {
    Address {
        indices: Vec::new(),
        ..address.clone()
    }
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Emulator {
        let mut state = State::default();
        let speed = Speed {
            mbps: config.speed_mbps,
        }
        .into_values();
        for module in 0..config.modules {
            for port in 0..config.ports_per_module {
                state
                    .attributes
                    .insert((P_SPEED::CODE, Address::port(module, port)), speed.clone());
            }
        }
        Emulator {
            config,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    fn capacity(&self, family: &IndexFamily) -> u32 {
        self.config
            .capacities
            .get(family.name)
            .copied()
            .unwrap_or(family.capacity)
    }

    /// Number of keepalives answered so far.
    pub fn keepalives(&self) -> u64 {
        self.lock().keepalives
    }

    /// Number of connected sessions.
    pub fn sessions(&self) -> usize {
        self.lock().clients.len()
    }

    /// While muted, requests are swallowed without a reply.
    pub fn mute(&self, muted: bool) {
        self.lock().muted = muted;
    }

    /// Drops every client connection.
    pub fn disconnect_all(&self) {
        for client in self.lock().clients.values() {
            client.session.disconnect();
        }
    }

    /// User holding the reservation of `address`, if any.
    pub fn reserved_by(&self, address: &Address) -> Option<String> {
        self.lock()
            .reservations
            .get(address)
            .map(|holder| holder.username.clone())
    }

    /// Indices of `family` defined on a port.
    pub fn indices(&self, family: &IndexFamily, module: u8, port: u8) -> Vec<u32> {
        self.lock()
            .tables
            .get(&(family.base, Address::port(module, port)))
            .map(|table| table.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Defines an index as if another client had created it.
    pub fn insert_index(&self, family: &IndexFamily, module: u8, port: u8, index: u32) {
        self.lock()
            .tables
            .entry((family.base, Address::port(module, port)))
            .or_default()
            .insert(index);
    }

    /// Deletes an index as if another client had deleted it.
    pub fn remove_index(&self, family: &IndexFamily, module: u8, port: u8, index: u32) {
        if let Some(table) = self
            .lock()
            .tables
            .get_mut(&(family.base, Address::port(module, port)))
        {
            table.remove(&index);
        }
    }

    /// Changes the link speed of a port and notifies every session.
    pub fn set_speed(&self, module: u8, port: u8, mbps: u32) {
        let address = Address::port(module, port);
        let Ok(payload) = encode(Speed { mbps }) else {
            return;
        };
        let mut state = self.lock();
        state
            .attributes
            .insert((P_SPEED::CODE, address.clone()), Speed { mbps }.into_values());
        log::debug!("Speed of {} is now {} Mbit/s", address, mbps);
        state.push_others(None, |_| {
            Some(Frame::new(P_SPEED::CODE, address.clone(), payload.clone()))
        });
    }

    fn check_address(&self, level: Level, address: &Address) -> Result<(), Status> {
        match (level, address.module, address.port) {
            (Level::Chassis, None, None) => return Ok(()),
            (Level::Chassis, _, _)
            | (Level::Module, None, _)
            | (Level::Module, Some(_), Some(_))
            | (Level::Port, _, None)
            | (Level::Port, None, _) => return Err(Status::NotValid),
            _ => {}
        }
        if address.module.is_some_and(|m| m >= self.config.modules) {
            return Err(Status::BadModule);
        }
        if address
            .port
            .is_some_and(|p| p >= self.config.ports_per_module)
        {
            return Err(Status::BadPort);
        }
        Ok(())
    }

    fn process(&self, state: &mut State, session: &Session, request: &Frame) -> Result<Bytes, Status> {
        let spec = self
            .config
            .registry
            .get(request.code)
            .copied()
            .ok_or(Status::NotValid)?;
        let logged_on = state
            .clients
            .get(&session.id())
            .is_some_and(|client| client.logged_on);
        if request.code != LOGON && !logged_on {
            return Err(Status::NotLoggedOn);
        }
        let level = Level::of(request.code);
        self.check_address(level, &request.address)?;

        let family = family_of(request.code);
        let expected_indices = match family {
            Some(family) if request.code != family.indices_code() => 1,
            _ => 0,
        };
        if request.address.indices.len() != expected_indices {
            return Err(Status::NotValid);
        }

        // A GET carries no payload.
        let is_get = request.payload.is_empty() && spec.is_gettable();
        match request.code {
            LOGON => self.logon(state, session, request),
            OWNER if is_get => {
                let username = state
                    .clients
                    .get(&session.id())
                    .and_then(|client| client.username.clone())
                    .unwrap_or_default();
                encode(Username { username })
            }
            OWNER => {
                let Username { username } = decode(&request.payload)?;
                if let Some(client) = state.clients.get_mut(&session.id()) {
                    client.username = Some(username);
                }
                Ok(Bytes::new())
            }
            KEEPALIVE => {
                state.keepalives += 1;
                encode(KeepaliveReply {
                    ticks: state.keepalives as u32,
                })
            }
            CHASSIS_RESERVATION | MODULE_RESERVATION | PORT_RESERVATION if is_get => {
                let username = username_of(state, session);
                let status = state.view(&request.address, username.as_deref());
                encode(ReservationReply { status })
            }
            CHASSIS_RESERVATION | MODULE_RESERVATION | PORT_RESERVATION => {
                self.reservation(state, session, level, request)
            }
            CHASSIS_RESERVEDBY | MODULE_RESERVEDBY | PORT_RESERVEDBY => {
                let username = state
                    .reservations
                    .get(&request.address)
                    .map(|holder| holder.username.clone())
                    .unwrap_or_default();
                encode(Username { username })
            }
            CDB if is_get => self.cdb_poll(state, request),
            CDB => {
                require_reservation(state, session, &request.address)?;
                let CdbRequest { command } = decode(&request.payload)?;
                state.cdb.insert(
                    request.address.clone(),
                    CdbJob {
                        command,
                        polls_left: self.config.cdb_pending_polls,
                    },
                );
                Ok(Bytes::new())
            }
            code => match family {
                Some(family) => self.indexed(state, session, family, &spec, is_get, request),
                None if is_get => get_attribute(state, &spec, request),
                None => {
                    require_reservation(state, session, &scope_of(&request.address))?;
                    set_attribute(state, &spec, request)?;
                    if code == P_TRAFFIC::CODE {
                        let payload = request.payload.clone();
                        state.push_others(Some(session.id()), |_| {
                            Some(Frame::new(code, request.address.clone(), payload.clone()))
                        });
                    }
                    Ok(Bytes::new())
                }
            },
        }
    }

    fn logon(&self, state: &mut State, session: &Session, request: &Frame) -> Result<Bytes, Status> {
        let Password { password } = decode(&request.payload)?;
        if password != self.config.password {
            log::info!("Session {}: wrong password", session.id());
            return Err(Status::NotValid);
        }
        let client = state.clients.get_mut(&session.id()).ok_or(Status::NotValid)?;
        client.logged_on = true;
        Ok(Bytes::new())
    }

    fn reservation(
        &self,
        state: &mut State,
        session: &Session,
        level: Level,
        request: &Frame,
    ) -> Result<Bytes, Status> {
        let ReservationRequest { operation } = decode(&request.payload)?;
        let username = username_of(state, session).ok_or(Status::NotValid)?;
        let scope = request.address.clone();
        let current = state.view(&scope, Some(username.as_str()));
        match (operation, current) {
            (ReservationOperation::Reserve, ReservationStatus::Released) => {
                state.reservations.insert(
                    scope.clone(),
                    Holder {
                        username,
                        session: session.id(),
                    },
                );
            }
            (ReservationOperation::Reserve, ReservationStatus::ReservedByOther) => {
                return Err(Status::ReservedByOther);
            }
            (ReservationOperation::Reserve, ReservationStatus::ReservedByYou) => {
                return Err(Status::NotValid);
            }
            (ReservationOperation::Release, ReservationStatus::ReservedByYou)
            | (ReservationOperation::Relinquish, ReservationStatus::ReservedByOther) => {
                state.reservations.remove(&scope);
            }
            (ReservationOperation::Release, _) => return Err(Status::NotReserved),
            (ReservationOperation::Relinquish, _) => return Err(Status::NotValid),
        }
        log::debug!("{} {:?}: {:?}", scope, operation, state.reservations.get(&scope));
        state.push_reservation(Some(session.id()), level, &scope);
        Ok(Bytes::new())
    }

    fn cdb_poll(&self, state: &mut State, request: &Frame) -> Result<Bytes, Status> {
        let job = state.cdb.get_mut(&request.address).ok_or(Status::NotValid)?;
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Err(Status::Pending);
        }
        encode(CdbReply {
            reply: serde_json::json!({
                "status": "done",
                "command": job.command.clone(),
            }),
        })
    }

    fn indexed(
        &self,
        state: &mut State,
        session: &Session,
        family: &IndexFamily,
        spec: &CommandSpec,
        is_get: bool,
        request: &Frame,
    ) -> Result<Bytes, Status> {
        let port = scope_of(&request.address);
        let key = (family.base, port.clone());
        if request.code == family.indices_code() {
            let indices = state.tables.get(&key).cloned().unwrap_or_default();
            return encode(IndexList::from_indices(indices));
        }
        let index = request.address.indices[0];
        let exists = state.tables.get(&key).is_some_and(|t| t.contains(&index));
        if !is_get {
            require_reservation(state, session, &port)?;
        }

        if request.code == family.create_code() {
            if exists {
                return Err(Status::NotValid);
            }
            let table = state.tables.entry(key).or_default();
            if table.len() as u32 >= self.capacity(family) {
                return Err(Status::CapacityExceeded);
            }
            table.insert(index);
            log::debug!("Created {} {} on {}", family.name, index, port);
            return Ok(Bytes::new());
        }
        if !exists {
            return Err(Status::BadIndex);
        }
        if request.code == family.delete_code() {
            if let Some(table) = state.tables.get_mut(&key) {
                table.remove(&index);
            }
            state
                .attributes
                .retain(|(code, address), _| !(family.contains(*code) && *address == request.address));
            log::debug!("Deleted {} {} on {}", family.name, index, port);
            return Ok(Bytes::new());
        }
        if is_get {
            get_attribute(state, spec, request)
        } else {
            set_attribute(state, spec, request).map(|()| Bytes::new())
        }
    }
}

fn username_of(state: &State, session: &Session) -> Option<String> {
    state
        .clients
        .get(&session.id())
        .and_then(|client| client.username.clone())
}

fn require_reservation(state: &State, session: &Session, scope: &Address) -> Result<(), Status> {
    let username = username_of(state, session);
    match state.view(scope, username.as_deref()) {
        ReservationStatus::ReservedByYou => Ok(()),
        _ => Err(Status::NotReserved),
    }
}

fn get_attribute(state: &State, spec: &CommandSpec, request: &Frame) -> Result<Bytes, Status> {
    let fields = spec.reply_fields.ok_or(Status::NotValid)?;
    let values = match state.attributes.get(&(request.code, request.address.clone())) {
        Some(values) => values.clone(),
        None => fields.iter().map(|field| field.kind.default_value()).collect(),
    };
    let mut payload = BytesMut::new();
    encode_fields(fields, &values, &mut payload).map_err(|e| {
        log::error!("Stored value of {} does not fit its reply: {}", spec.name, e);
        Status::NotValid
    })?;
    Ok(payload.freeze())
}

fn set_attribute(state: &mut State, spec: &CommandSpec, request: &Frame) -> Result<(), Status> {
    let fields = spec.request_fields.ok_or(Status::NotValid)?;
    let values = decode_fields(fields, request.payload.clone()).map_err(|e| {
        log::debug!("Rejecting {}: {}", spec.name, e);
        Status::NotValid
    })?;
    state
        .attributes
        .insert((request.code, request.address.clone()), values);
    Ok(())
}

impl XmpDevice for Emulator {
    fn open(&self, session: &Session) {
        self.lock().clients.insert(
            session.id(),
            Client {
                session: session.clone(),
                logged_on: false,
                username: None,
            },
        );
    }

    fn handle(&self, session: &Session, request: Frame) -> Option<Frame> {
        let mut state = self.lock();
        if state.muted {
            log::debug!("Muted, ignoring {:#06x}", request.code);
            return None;
        }
        let reply = match self.process(&mut state, session, &request) {
            Ok(payload) => Frame::new(request.code, request.address.clone(), payload),
            Err(status) => Frame::status_reply(&request, status),
        };
        Some(reply)
    }

    fn close(&self, session: &Session) {
        let mut state = self.lock();
        state.clients.remove(&session.id());
        let released: Vec<Address> = state
            .reservations
            .iter()
            .filter(|(_, holder)| holder.session == session.id())
            .map(|(scope, _)| scope.clone())
            .collect();
        for scope in released {
            state.reservations.remove(&scope);
            let level = match (scope.module, scope.port) {
                (None, _) => Level::Chassis,
                (Some(_), None) => Level::Module,
                (Some(_), Some(_)) => Level::Port,
            };
            state.push_reservation(None, level, &scope);
        }
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use xmp_protocol::{
        Set,
        commands::{
            OnOff, Toggle,
            indexed::{HISTOGRAMS, PD_CREATE, PS_COMMENT, PS_CREATE, PS_INDICES, STREAMS},
        },
        message::Empty,
    };

    struct Peer {
        session: Session,
        pushed: mpsc::UnboundedReceiver<Frame>,
    }

    impl Peer {
        fn open(emulator: &Emulator, id: u64) -> Peer {
            let (tx, pushed) = mpsc::unbounded_channel();
            let session = Session::new(id, None, tx, CancellationToken::new());
            emulator.open(&session);
            Peer { session, pushed }
        }

        fn logged_on(emulator: &Emulator, id: u64, username: &str) -> Peer {
            let peer = Peer::open(emulator, id);
            let logon = Frame::set::<C_LOGON>(
                Address::chassis(),
                Password {
                    password: "xena".into(),
                },
            )
            .unwrap();
            assert_eq!(peer.call(emulator, logon).status, Status::Ok);
            let owner = Frame::set::<C_OWNER>(
                Address::chassis(),
                Username {
                    username: username.into(),
                },
            )
            .unwrap();
            assert_eq!(peer.call(emulator, owner).status, Status::Ok);
            peer
        }

        fn call(&self, emulator: &Emulator, request: Frame) -> Frame {
            emulator.handle(&self.session, request).unwrap()
        }

        fn status(&self, emulator: &Emulator, request: Frame) -> Status {
            self.call(emulator, request).status
        }
    }

    fn reserve<C: Set<Request = ReservationRequest>>(address: Address) -> Frame {
        Frame::set::<C>(
            address,
            ReservationRequest {
                operation: ReservationOperation::Reserve,
            },
        )
        .unwrap()
    }

    fn create_stream(index: u32) -> Frame {
        Frame::set::<PS_CREATE>(Address::port(0, 0).with_index(index), Empty {}).unwrap()
    }

    #[test]
    fn requires_logon() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let peer = Peer::open(&emulator, 1);
        assert_eq!(
            peer.status(&emulator, Frame::get::<C_KEEPALIVE>(Address::chassis())),
            Status::NotLoggedOn
        );
        let wrong = Frame::set::<C_LOGON>(
            Address::chassis(),
            Password {
                password: "nope".into(),
            },
        )
        .unwrap();
        assert_eq!(peer.status(&emulator, wrong), Status::NotValid);
    }

    #[test]
    fn keepalive_counts() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let peer = Peer::logged_on(&emulator, 1, "alice");
        let reply = peer.call(&emulator, Frame::get::<C_KEEPALIVE>(Address::chassis()));
        let reply: KeepaliveReply = decode_message(reply.payload).unwrap();
        assert_eq!(reply.ticks, 1);
        assert_eq!(emulator.keepalives(), 1);
    }

    #[test]
    fn validates_addresses() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let peer = Peer::logged_on(&emulator, 1, "alice");
        assert_eq!(
            peer.status(&emulator, Frame::get::<P_SPEED>(Address::port(7, 0))),
            Status::BadModule
        );
        assert_eq!(
            peer.status(&emulator, Frame::get::<P_SPEED>(Address::port(0, 9))),
            Status::BadPort
        );
        assert_eq!(
            peer.status(&emulator, Frame::get::<P_SPEED>(Address::module(0))),
            Status::NotValid
        );
    }

    #[test]
    fn mutations_need_reservation() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let peer = Peer::logged_on(&emulator, 1, "alice");
        let traffic =
            Frame::set::<P_TRAFFIC>(Address::port(0, 0), Toggle { state: OnOff::On }).unwrap();
        assert_eq!(peer.status(&emulator, traffic.clone()), Status::NotReserved);
        assert_eq!(
            peer.status(&emulator, reserve::<P_RESERVATION>(Address::port(0, 0))),
            Status::Ok
        );
        assert_eq!(peer.status(&emulator, traffic), Status::Ok);
        let reply = peer.call(&emulator, Frame::get::<P_TRAFFIC>(Address::port(0, 0)));
        assert_eq!(
            decode_message::<Toggle>(reply.payload).unwrap().state,
            OnOff::On
        );
    }

    #[test]
    fn reservation_conflicts_and_pushes() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let alice = Peer::logged_on(&emulator, 1, "alice");
        let mut bob = Peer::logged_on(&emulator, 2, "bob");
        let port = Address::port(1, 2);

        assert_eq!(alice.status(&emulator, reserve::<P_RESERVATION>(port.clone())), Status::Ok);
        let pushed = bob.pushed.try_recv().unwrap();
        assert_eq!(pushed.code, P_RESERVATION::CODE);
        assert_eq!(
            decode_message::<ReservationReply>(pushed.payload).unwrap().status,
            ReservationStatus::ReservedByOther
        );

        assert_eq!(
            bob.status(&emulator, reserve::<P_RESERVATION>(port.clone())),
            Status::ReservedByOther
        );
        let relinquish = Frame::set::<P_RESERVATION>(
            port.clone(),
            ReservationRequest {
                operation: ReservationOperation::Relinquish,
            },
        )
        .unwrap();
        assert_eq!(bob.status(&emulator, relinquish), Status::Ok);
        assert_eq!(emulator.reserved_by(&port), None);
        assert_eq!(bob.status(&emulator, reserve::<P_RESERVATION>(port.clone())), Status::Ok);
        assert_eq!(emulator.reserved_by(&port).as_deref(), Some("bob"));
    }

    #[test]
    fn reservations_end_with_session() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let alice = Peer::logged_on(&emulator, 1, "alice");
        assert_eq!(
            alice.status(&emulator, reserve::<M_RESERVATION>(Address::module(1))),
            Status::Ok
        );
        emulator.close(&alice.session);
        assert_eq!(emulator.reserved_by(&Address::module(1)), None);
        assert_eq!(emulator.sessions(), 0);
    }

    #[test]
    fn index_tables() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let peer = Peer::logged_on(&emulator, 1, "alice");
        peer.call(&emulator, reserve::<P_RESERVATION>(Address::port(0, 0)));

        assert_eq!(peer.status(&emulator, create_stream(3)), Status::Ok);
        assert_eq!(peer.status(&emulator, create_stream(3)), Status::NotValid);
        assert_eq!(emulator.indices(&STREAMS, 0, 0), [3]);

        let comment = Frame::get::<PS_COMMENT>(Address::port(0, 0).with_index(4));
        assert_eq!(peer.status(&emulator, comment), Status::BadIndex);

        let reply = peer.call(&emulator, Frame::get::<PS_INDICES>(Address::port(0, 0)));
        let list: IndexList = decode_message(reply.payload).unwrap();
        assert_eq!(list.indices().collect::<Vec<_>>(), [3]);
    }

    #[test]
    fn index_capacity() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let peer = Peer::logged_on(&emulator, 1, "alice");
        peer.call(&emulator, reserve::<P_RESERVATION>(Address::port(0, 1)));
        let create = |index| {
            Frame::set::<PD_CREATE>(Address::port(0, 1).with_index(index), Empty {}).unwrap()
        };
        for index in 0..HISTOGRAMS.capacity {
            assert_eq!(peer.status(&emulator, create(index)), Status::Ok);
        }
        assert_eq!(
            peer.status(&emulator, create(HISTOGRAMS.capacity)),
            Status::CapacityExceeded
        );
    }

    #[test]
    fn cdb_answers_pending_first() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let peer = Peer::logged_on(&emulator, 1, "alice");
        let port = Address::port(0, 0);
        peer.call(&emulator, reserve::<P_RESERVATION>(port.clone()));
        let request = Frame::set::<PX_CDB_COMMAND>(
            port.clone(),
            CdbRequest {
                command: serde_json::json!({"cmd": "firmware"}),
            },
        )
        .unwrap();
        assert_eq!(peer.status(&emulator, request), Status::Ok);
        let poll = || Frame::get::<PX_CDB_COMMAND>(port.clone());
        assert_eq!(peer.status(&emulator, poll()), Status::Pending);
        assert_eq!(peer.status(&emulator, poll()), Status::Pending);
        let reply = peer.call(&emulator, poll());
        let reply: CdbReply = decode_message(reply.payload).unwrap();
        assert_eq!(reply.reply["command"]["cmd"], "firmware");
    }

    #[test]
    fn muted_emulator_does_not_answer() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let peer = Peer::logged_on(&emulator, 1, "alice");
        emulator.mute(true);
        assert!(
            emulator
                .handle(&peer.session, Frame::get::<C_KEEPALIVE>(Address::chassis()))
                .is_none()
        );
    }

    #[test]
    fn speed_is_pushed_to_everyone() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let mut peer = Peer::logged_on(&emulator, 1, "alice");
        emulator.set_speed(0, 2, 25_000);
        let pushed = peer.pushed.try_recv().unwrap();
        assert_eq!(pushed.code, P_SPEED::CODE);
        assert_eq!(decode_message::<Speed>(pushed.payload).unwrap().mbps, 25_000);
        let reply = peer.call(&emulator, Frame::get::<P_SPEED>(Address::port(0, 2)));
        assert_eq!(decode_message::<Speed>(reply.payload).unwrap().mbps, 25_000);
    }

    #[test]
    fn get_reply_code_and_address_match_request() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let peer = Peer::logged_on(&emulator, 1, "alice");
        let request = Frame::get::<P_SPEED>(Address::port(1, 3));
        let reply = peer.call(&emulator, request.clone());
        assert_eq!(reply.key(), request.key());
        assert_eq!(reply.status, Status::Ok);
    }
}
