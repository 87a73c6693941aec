use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, ToSocketAddrs, tcp::OwnedWriteHalf},
    sync::mpsc,
};
use tokio_util::{
    codec::{Decoder, Encoder},
    sync::CancellationToken,
};
use xmp_protocol::{Frame, codec::FrameCodec, error::FrameError, frame::DEFAULT_MAX_PAYLOAD};

use crate::{Session, XmpDevice};

#[derive(Debug, Clone)]
pub struct Config {
    pub max_payload: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[derive(Debug)]
pub struct Server<T: XmpDevice> {
    device: Arc<T>,
    config: Config,
    next_session: Arc<AtomicU64>,
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```
/// use xmp_server::{Emulator, EmulatorConfig, server::Builder};
///
/// let server = Builder::new()
///     .max_payload(64 * 1024)
///     .build(Emulator::new(EmulatorConfig::default()));
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the highest payload size that this server is expected to receive.
    pub fn max_payload(mut self, size: usize) -> Self {
        self.config.max_payload = size;
        self
    }

    /// Build and return the server
    pub fn build<T: XmpDevice>(self, device: T) -> Server<T> {
        Server::new(device, self.config)
    }
}

impl<T: XmpDevice> Server<T> {
    pub fn new(device: T, config: Config) -> Server<T> {
        Server {
            device: Arc::new(device),
            config,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn device(&self) -> &Arc<T> {
        &self.device
    }

    pub async fn listen(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts clients on `listener` until accepting fails. Each client is
    /// served on its own task.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        log::info!("Server listening on {}", listener.local_addr()?);
        loop {
            let (tcp, peer) = listener.accept().await?;
            log::info!("New client connection from {}", peer);
            let id = self.next_session.fetch_add(1, Ordering::Relaxed);
            let device = Arc::clone(&self.device);
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(device, config, tcp, id, peer).await {
                    log::error!("Client error: {}", e);
                }
                log::info!("Client {} disconnected", peer);
            });
        }
    }
}

async fn handle_client<T: XmpDevice>(
    device: Arc<T>,
    config: Config,
    tcp: TcpStream,
    id: u64,
    peer: SocketAddr,
) -> Result<(), FrameError> {
    tcp.set_nodelay(true)?;
    let (mut reader, writer) = tcp.into_split();
    let (outbox, queued) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let session = Session::new(id, Some(peer), outbox, shutdown.clone());
    let writer_task = tokio::spawn(write_loop(writer, queued, shutdown.clone(), config.clone()));

    device.open(&session);
    let mut codec = FrameCodec::new(config.max_payload);
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let result = loop {
        if let Err(e) = process_buffered(device.as_ref(), &session, &mut codec, &mut buffer) {
            break Err(e);
        }
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                log::info!("Session {} closed by the device", id);
                break Ok(());
            }
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(err)
                    if err.kind() == ErrorKind::ConnectionAborted
                        || err.kind() == ErrorKind::ConnectionReset =>
                {
                    break Ok(());
                } // Client disconnected
                Err(err) => break Err(err.into()),
            },
        }
    };
    device.close(&session);
    shutdown.cancel();
    drop(session);
    if let Err(e) = writer_task.await {
        log::error!("Writer of session {} failed: {}", id, e);
    }
    result
}

/// Answers every complete request in `buffer`.
fn process_buffered<T: XmpDevice>(
    device: &T,
    session: &Session,
    codec: &mut FrameCodec,
    buffer: &mut BytesMut,
) -> Result<(), FrameError> {
    while let Some(request) = codec.decode(buffer)? {
        log::debug!(
            "Session {}: request {:#06x} for {}",
            session.id(),
            request.code,
            request.address
        );
        log::trace!("Request payload: {:02x?}", &request.payload[..]);
        if let Some(reply) = device.handle(session, request) {
            log::debug!(
                "Session {}: reply {:#06x} ({})",
                session.id(),
                reply.code,
                reply.status
            );
            session.send(reply);
        }
    }
    Ok(())
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
    config: Config,
) {
    let mut codec = FrameCodec::new(config.max_payload);
    let mut buffer = BytesMut::new();
    loop {
        let frame = tokio::select! {
            biased;

            frame = queued.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        buffer.clear();
        if let Err(e) = codec.encode(frame, &mut buffer) {
            log::error!("Dropping frame that cannot be encoded: {}", e);
            continue;
        }
        if let Err(e) = writer.write_all(&buffer).await {
            log::debug!("Write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
