//! Helpers shared by the integration tests: a scripted tester that answers by
//! hand, and an emulator served on a loopback port.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::codec::{Decoder, Encoder};
use xmp_client::{Builder, Config, Connection, Credentials, Tester};
use xmp_protocol::{Frame, Message, codec::FrameCodec, field::encode_fields};
use xmp_server::{Emulator, EmulatorConfig, server::Server};

pub const PASSWORD: &str = "xena";

/// Upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Client settings without keepalives, so scripts see only what tests send.
pub fn quiet_config() -> Config {
    Builder::new().keepalive(None).build()
}

/// Encodes a typed body.
pub fn body<M: Message>(message: M) -> Bytes {
    let mut payload = BytesMut::new();
    encode_fields(M::FIELDS, &message.into_values(), &mut payload).expect("body encodes");
    payload.freeze()
}

/// The far end of a client connection, driven frame by frame by the test.
pub struct ScriptedPeer {
    stream: TcpStream,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl ScriptedPeer {
    /// Connects a client to a fresh scripted peer.
    pub async fn pair(config: Config) -> (Arc<Connection>, ScriptedPeer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local address");
        let (connection, accepted) =
            tokio::join!(Connection::connect(addr, config), listener.accept());
        let (stream, _) = accepted.expect("accept");
        let peer = ScriptedPeer {
            stream,
            codec: FrameCodec::default(),
            buffer: BytesMut::new(),
        };
        (connection.expect("connect"), peer)
    }

    /// Waits for the next request of the client.
    pub async fn recv(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer).expect("valid frame") {
                return frame;
            }
            let read = tokio::time::timeout(PATIENCE, self.stream.read_buf(&mut self.buffer))
                .await
                .expect("client sent nothing")
                .expect("read");
            assert!(read > 0, "client closed the connection");
        }
    }

    /// Waits for `n` requests.
    pub async fn recv_many(&mut self, n: usize) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(self.recv().await);
        }
        frames
    }

    /// Asserts that the client sends nothing for `duration`.
    pub async fn expect_silence(&mut self, duration: Duration) {
        if let Some(frame) = self.codec.decode(&mut self.buffer).expect("valid frame") {
            panic!("unexpected request {frame:?}");
        }
        if let Ok(read) = tokio::time::timeout(duration, self.stream.read_buf(&mut self.buffer)).await {
            panic!("client sent {} more byte(s)", read.expect("read"));
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        let mut buffer = BytesMut::new();
        self.codec.encode(frame, &mut buffer).expect("encode");
        self.send_raw(&buffer).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write");
    }

    /// Answers `request` with status ok and `payload`.
    pub async fn reply(&mut self, request: &Frame, payload: Bytes) {
        self.send(Frame::new(request.code, request.address.clone(), payload))
            .await;
    }

    /// Closes the connection from the tester side.
    pub async fn hang_up(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// An emulator served on a loopback port.
pub struct Lab {
    pub addr: SocketAddr,
    pub emulator: Arc<Emulator>,
}

impl Lab {
    pub async fn start(config: EmulatorConfig) -> Lab {
        init_logging();
        let server = Server::new(Emulator::new(config), Default::default());
        let emulator = Arc::clone(server.device());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local address");
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                log::error!("Emulator stopped: {}", e);
            }
        });
        Lab { addr, emulator }
    }

    pub async fn tester(&self, username: &str) -> Tester {
        self.tester_with(username, quiet_config()).await
    }

    pub async fn tester_with(&self, username: &str, config: Config) -> Tester {
        Tester::connect(self.addr, Credentials::new(username, PASSWORD), config)
            .await
            .expect("log on")
    }
}
