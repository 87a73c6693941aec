//! Typed access to single commands.
use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use xmp_protocol::{
    Address, Command, Frame, Get, Set,
    commands::{OnOff, Toggle},
};

use crate::{
    connection::{Connection, decode_reply},
    correlator::Token,
    error::Result,
};

/// Command `C` bound to one address.
///
/// ```ignore
/// let traffic = port.traffic();
/// traffic.set_on().await?;
/// assert_eq!(traffic.get().await?.state, OnOff::On);
/// ```
pub struct CommandHandle<C> {
    connection: Arc<Connection>,
    address: Address,
    _command: PhantomData<fn() -> C>,
}

impl<C: Command> CommandHandle<C> {
    pub fn new(connection: Arc<Connection>, address: Address) -> CommandHandle<C> {
        CommandHandle {
            connection,
            address,
            _command: PhantomData,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn name(&self) -> &'static str {
        C::NAME
    }
}

impl<C: Get> CommandHandle<C> {
    /// Reads the current value.
    pub async fn get(&self) -> Result<C::Reply> {
        self.send_get().await?.await
    }

    /// Writes the GET and returns without waiting for the reply.
    pub async fn send_get(&self) -> Result<Pending<C::Reply>> {
        let token = self
            .connection
            .send(Frame::get::<C>(self.address.clone()))
            .await?;
        Ok(Pending::new(token, decode_reply::<C::Reply>))
    }
}

impl<C: Set> CommandHandle<C> {
    /// Writes a new value and waits for the acknowledgement.
    pub async fn set(&self, request: C::Request) -> Result<()> {
        self.send_set(request).await?.await
    }

    /// Writes the SET and returns without waiting for the acknowledgement.
    pub async fn send_set(&self, request: C::Request) -> Result<Pending<()>> {
        let frame = Frame::set::<C>(self.address.clone(), request)?;
        let token = self.connection.send(frame).await?;
        Ok(Pending::new(token, |_| Ok(())))
    }
}

impl<C: Set<Request = Toggle>> CommandHandle<C> {
    pub async fn set_on(&self) -> Result<()> {
        self.set(Toggle { state: OnOff::On }).await
    }

    pub async fn set_off(&self) -> Result<()> {
        self.set(Toggle { state: OnOff::Off }).await
    }
}

impl<C> Clone for CommandHandle<C> {
    fn clone(&self) -> Self {
        CommandHandle {
            connection: Arc::clone(&self.connection),
            address: self.address.clone(),
            _command: PhantomData,
        }
    }
}

impl<C: Command> fmt::Debug for CommandHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", C::NAME, self.address)
    }
}

/// A typed reply that is already on its way.
///
/// Dropping it is safe, the reply is discarded when it arrives.
#[must_use = "the reply is only observed by awaiting it"]
pub struct Pending<T> {
    token: Token,
    decode: fn(Frame) -> Result<T>,
}

impl<T> Pending<T> {
    fn new(token: Token, decode: fn(Frame) -> Result<T>) -> Pending<T> {
        Pending { token, decode }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.token)
            .poll(cx)
            .map(|reply| reply.and_then(this.decode))
    }
}
