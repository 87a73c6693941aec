use std::{
    fmt::{self, Display},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::codec::{Decoder, Encoder};
use xmp_protocol::{
    Address, Command, Frame, Get, Registry,
    codec::FrameCodec,
    commands::chassis::{C_KEEPALIVE, KeepaliveReply},
    message::{Message, decode_message},
};

use crate::{
    command::CommandHandle,
    config::Config,
    correlator::{Correlator, Delivery, Token},
    error::{Error, Result},
    events::{Events, PushEvent, Subscription, Subscriptions},
};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(text)
    }
}

struct Shared {
    peer: SocketAddr,
    config: Config,
    /// Encoded frames for the writer task. Locked while a waiter is queued so
    /// that waiters queue in wire order. `None` once the connection is shut down.
    outbox: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    correlator: Arc<Correlator>,
    subscriptions: Arc<Subscriptions>,
    state: Mutex<ConnectionState>,
    last_write: Mutex<Instant>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state();
        if *state != next {
            log::debug!("Connection to {}: {} -> {}", self.peer, *state, next);
            *state = next;
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn outbox(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Bytes>>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `frame` for the writer task. A queued frame is written in full
    /// whatever happens to the caller afterwards.
    fn send(&self, frame: Frame) -> Result<Token> {
        let command = self
            .config
            .registry
            .get(frame.code)
            .map(|spec| spec.name)
            .ok_or(Error::Unsupported(frame.code))?;
        let mut buffer = BytesMut::new();
        FrameCodec::new(self.config.max_payload).encode(&frame, &mut buffer)?;

        let outbox = self.outbox();
        let Some(queue) = outbox.as_ref() else {
            return Err(Error::NotConnected);
        };
        if *self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let token = self.correlator.register(frame.key(), command)?;
        if queue.send(buffer.freeze()).is_err() {
            // The writer task is gone, nothing of this frame was written.
            token.withdraw();
            return Err(Error::NotConnected);
        }
        log::debug!("Sending {} to {}", command, frame.address);
        log::trace!("{} payload: {:02x?}", command, &frame.payload[..]);
        Ok(token)
    }

    fn touch(&self) {
        *self.last_write.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn dispatch(&self, frame: Frame) {
        log::debug!(
            "Received {:#06x} ({}) from {}",
            frame.code,
            frame.status,
            frame.address
        );
        log::trace!("Payload: {:02x?}", &frame.payload[..]);
        match self.correlator.deliver(frame) {
            Delivery::Completed | Delivery::Discarded => {}
            Delivery::Unmatched(frame) => {
                if frame.status.is_ok() && self.config.registry.supports_push(frame.code) {
                    self.subscriptions.dispatch(&PushEvent::from(frame));
                } else {
                    log::warn!(
                        "Unmatched frame {:#06x} for {} with status {}",
                        frame.code,
                        frame.address,
                        frame.status
                    );
                }
            }
        }
    }

    /// Fails everything in flight. Safe to call more than once.
    fn shutdown(&self, reason: &str) {
        {
            let mut state = self.state();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        // Lets the writer task drain what is already queued and stop.
        self.outbox().take();
        let failed = self.correlator.close();
        self.subscriptions.clear();
        log::info!(
            "Connection to {} closed ({}), {} pending request(s) failed",
            self.peer,
            reason,
            failed
        );
    }
}

/// One TCP connection to a tester.
///
/// Many tasks may issue commands concurrently. Each request is answered through
/// the [`Token`] returned by [`Connection::send`]; replies are matched by command
/// code and address. Dropping the connection stops its background tasks and
/// fails every pending request.
pub struct Connection {
    shared: Arc<Shared>,
    /// Reader and keepalive tasks.
    tasks: Vec<JoinHandle<()>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connects to the tester at `addr` and starts the reader, writer and
    /// keepalive tasks.
    pub async fn connect(addr: impl ToSocketAddrs, config: Config) -> Result<Arc<Connection>> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;
        Connection::from_stream(stream, config)
    }

    /// Runs the protocol on an already connected stream. Must be called within
    /// a tokio runtime.
    pub fn from_stream(stream: TcpStream, config: Config) -> Result<Arc<Connection>> {
        let peer = stream.peer_addr()?;
        let keepalive = config.keepalive_interval;
        let (reader, writer) = stream.into_split();
        let (outbox, queued) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            peer,
            config,
            outbox: Mutex::new(Some(outbox)),
            correlator: Arc::new(Correlator::new()),
            subscriptions: Arc::new(Subscriptions::default()),
            state: Mutex::new(ConnectionState::Connecting),
            last_write: Mutex::new(Instant::now()),
        });
        shared.set_state(ConnectionState::Connected);

        let writer = tokio::spawn(write_loop(Arc::clone(&shared), writer, queued));
        let mut tasks = vec![tokio::spawn(read_loop(Arc::clone(&shared), reader))];
        match keepalive {
            Some(interval) if !interval.is_zero() => {
                tasks.push(tokio::spawn(keepalive_loop(Arc::downgrade(&shared), interval)));
            }
            _ => log::debug!("Keepalive disabled for {}", peer),
        }
        log::info!("Connected to {}", peer);
        Ok(Arc::new(Connection {
            shared,
            tasks,
            writer: Mutex::new(Some(writer)),
        }))
    }

    /// Queues `frame` for writing and returns the token its reply resolves.
    ///
    /// Once this returns `Ok` the frame goes out in full, even if the token is
    /// dropped right away. Awaiting the token is optional, so several requests
    /// can be pipelined before the first reply arrives.
    pub async fn send(&self, frame: Frame) -> Result<Token> {
        self.shared.send(frame)
    }

    /// Sends `frame` and waits for its reply.
    pub async fn request(&self, frame: Frame) -> Result<Frame> {
        self.send(frame).await?.await
    }

    /// A typed handle for command `C` on `address`.
    pub fn command<C: Command>(self: &Arc<Self>, address: Address) -> CommandHandle<C> {
        CommandHandle::new(Arc::clone(self), address)
    }

    /// Calls `listener` for every pushed frame with command code `code`.
    pub fn subscribe(
        &self,
        code: u16,
        listener: impl Fn(&PushEvent) -> Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.subscriptions.add(code, Arc::new(listener))
    }

    /// Calls `listener` with the decoded body of every push of command `C`.
    pub fn on<C: Get>(
        &self,
        listener: impl Fn(&Address, C::Reply) -> Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(C::CODE, move |event| {
            let reply = decode_message::<C::Reply>(event.payload.clone())?;
            listener(&event.address, reply)
        })
    }

    /// Pushed frames with command code `code` as a stream of events.
    pub fn events(&self, code: u16) -> Events {
        Events::new(&self.shared.subscriptions, code)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.config.registry
    }

    /// Number of requests still waiting for a reply, abandoned ones included.
    pub fn pending(&self) -> usize {
        self.shared.correlator.pending()
    }

    /// Number of listeners registered for `code`.
    pub fn listeners(&self, code: u16) -> usize {
        self.shared.subscriptions.count(code)
    }

    /// Closes the connection. Frames already queued are flushed first, pending
    /// requests fail with [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        {
            let mut state = self.shared.state();
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Closing;
            }
        }
        self.shared.outbox().take();
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            let abort = writer.abort_handle();
            if tokio::time::timeout(self.shared.config.connect_timeout, writer)
                .await
                .is_err()
            {
                log::debug!("Flushing to {} timed out", self.shared.peer);
                abort.abort();
            }
        }
        for task in &self.tasks {
            task.abort();
        }
        self.shared.shutdown("closed by client");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(writer) = self
            .writer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            writer.abort();
        }
        self.shared.shutdown("dropped");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    let mut codec = FrameCodec::new(shared.config.max_payload);
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let reason = loop {
        match codec.decode(&mut buffer) {
            Ok(Some(frame)) => {
                shared.dispatch(frame);
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("Corrupt stream from {}: {}", shared.peer, e);
                break format!("framing error: {}", e);
            }
        }
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break "closed by peer".to_owned(),
            Ok(_) => {}
            Err(e) => break format!("read failed: {}", e),
        }
    };
    shared.shutdown(&reason);
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(buffer) = queued.recv().await {
        if let Err(e) = writer.write_all(&buffer).await {
            shared.shutdown(&format!("write failed: {}", e));
            return;
        }
        shared.touch();
    }
    if let Err(e) = writer.shutdown().await {
        log::debug!("Shutting down the socket to {} failed: {}", shared.peer, e);
    }
}

async fn keepalive_loop(shared: Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if *shared.state() != ConnectionState::Connected {
            break;
        }
        if shared.idle_for() < interval {
            continue;
        }
        log::trace!("Sending keepalive to {}", shared.peer);
        let result = match shared.send(Frame::get::<C_KEEPALIVE>(Address::chassis())) {
            Ok(token) => token
                .await
                .and_then(decode_reply::<KeepaliveReply>)
                .map(|reply| log::trace!("Keepalive tick {}", reply.ticks)),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("Keepalive to {} failed: {}", shared.peer, e);
        }
    }
}

/// Decodes the body of a reply frame.
pub(crate) fn decode_reply<M: Message>(frame: Frame) -> Result<M> {
    Ok(decode_message::<M>(frame.payload)?)
}
