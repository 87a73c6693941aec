//! Reservation of chassis, modules and ports.
//!
//! A session must hold the reservation of a resource before changing it. The
//! tester enforces this; the client only remembers the last state it saw.
use std::{
    fmt,
    marker::PhantomData,
    sync::{Arc, Mutex, PoisonError},
};

use xmp_protocol::{
    Address, Get, Set,
    commands::{
        ReservationOperation, ReservationReply, ReservationRequest, ReservationStatus, Username,
        chassis::{C_RESERVATION, C_RESERVEDBY},
        module::{M_RESERVATION, M_RESERVEDBY},
        port::{P_RESERVATION, P_RESERVEDBY},
    },
};

use crate::{
    command::CommandHandle,
    connection::Connection,
    error::Result,
    events::Subscription,
};

/// A level of the resource tree that can be reserved.
pub trait Scope: Send + Sync + 'static {
    const NAME: &'static str;
    type Reservation: Get<Reply = ReservationReply> + Set<Request = ReservationRequest>;
    type ReservedBy: Get<Reply = Username>;
}

pub struct ChassisScope;

impl Scope for ChassisScope {
    const NAME: &'static str = "chassis";
    type Reservation = C_RESERVATION;
    type ReservedBy = C_RESERVEDBY;
}

pub struct ModuleScope;

impl Scope for ModuleScope {
    const NAME: &'static str = "module";
    type Reservation = M_RESERVATION;
    type ReservedBy = M_RESERVEDBY;
}

pub struct PortScope;

impl Scope for PortScope {
    const NAME: &'static str = "port";
    type Reservation = P_RESERVATION;
    type ReservedBy = P_RESERVEDBY;
}

/// Reservation of one resource as seen by this session.
///
/// The cached state starts out as [`ReservationStatus::Released`] and follows
/// replies to this session's own requests as well as reservation changes the
/// tester pushes for the resource.
pub struct Reservation<S: Scope> {
    connection: Arc<Connection>,
    address: Address,
    state: Arc<Mutex<ReservationStatus>>,
    _updates: Subscription,
    _scope: PhantomData<fn() -> S>,
}

impl<S: Scope> Reservation<S> {
    pub fn new(connection: Arc<Connection>, address: Address) -> Reservation<S> {
        let state = Arc::new(Mutex::new(ReservationStatus::Released));
        let updates = {
            let state = Arc::clone(&state);
            let address = address.clone();
            connection.on::<S::Reservation>(move |pushed, reply| {
                if *pushed == address {
                    log::debug!("{} {} is now {:?}", S::NAME, address, reply.status);
                    *state.lock().unwrap_or_else(PoisonError::into_inner) = reply.status;
                }
                Ok(())
            })
        };
        Reservation {
            connection,
            address,
            state,
            _updates: updates,
            _scope: PhantomData,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The last known state, without asking the tester.
    pub fn state(&self) -> ReservationStatus {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, status: ReservationStatus) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn handle(&self) -> CommandHandle<S::Reservation> {
        CommandHandle::new(Arc::clone(&self.connection), self.address.clone())
    }

    /// Asks the tester for the current state and caches it.
    pub async fn refresh(&self) -> Result<ReservationStatus> {
        let status = self.handle().get().await?.status;
        self.remember(status);
        Ok(status)
    }

    async fn apply(&self, operation: ReservationOperation, outcome: ReservationStatus) -> Result<()> {
        log::debug!("{:?} {} {}", operation, S::NAME, self.address);
        self.handle().set(ReservationRequest { operation }).await?;
        self.remember(outcome);
        Ok(())
    }

    pub async fn reserve(&self) -> Result<()> {
        self.apply(ReservationOperation::Reserve, ReservationStatus::ReservedByYou)
            .await
    }

    pub async fn release(&self) -> Result<()> {
        self.apply(ReservationOperation::Release, ReservationStatus::Released)
            .await
    }

    /// Takes the reservation away from whoever holds it.
    pub async fn relinquish(&self) -> Result<()> {
        self.apply(ReservationOperation::Relinquish, ReservationStatus::Released)
            .await
    }

    /// Makes this session the owner, whatever the cached state is.
    ///
    /// Works from the cached state: call [`Reservation::refresh`] first if it may
    /// be outdated.
    pub async fn reserve_regardless(&self) -> Result<()> {
        match self.state() {
            ReservationStatus::ReservedByYou => Ok(()),
            ReservationStatus::Released => self.reserve().await,
            ReservationStatus::ReservedByOther => {
                self.relinquish().await?;
                self.reserve().await
            }
        }
    }

    /// Name of the user holding the reservation. Empty when released.
    pub async fn reserved_by(&self) -> Result<String> {
        let handle = CommandHandle::<S::ReservedBy>::new(
            Arc::clone(&self.connection),
            self.address.clone(),
        );
        Ok(handle.get().await?.username)
    }
}

impl<S: Scope> fmt::Debug for Reservation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("scope", &S::NAME)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}
