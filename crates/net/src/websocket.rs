use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::address::{AddressFamily, NetAddress, Protocol};
use crate::connection::{AddressFlags, Connection, ConnectionInfo, LocalAddress, PacketBuffer};
use crate::context::NetContext;
use crate::error::{NetError, SendStatus};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Frames waiting for the writer task before sends start failing.
const WRITE_QUEUE_FRAMES: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Point-to-point websocket client. Binary frames are treated as packets;
/// anything else the peer sends is ignored. Reads and writes both happen on
/// runtime tasks, so the polling thread never waits on the peer.
pub struct WebSocketConnection {
    info: ConnectionInfo,
    ctx: Arc<NetContext>,
    remote: NetAddress,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    failed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WebSocketConnection {
    /// Connects to `address`, a URL or bare `host[:port][/path]` that gets
    /// the scheme matching `protocol`. Blocks for at most the configured
    /// connect timeout.
    pub fn establish(
        ctx: &Arc<NetContext>,
        name: &str,
        address: &str,
        protocol: Protocol,
        listening: bool,
    ) -> Result<Self, NetError> {
        if listening {
            return Err(NetError::Unsupported {
                family: AddressFamily::WebSocket,
                protocol,
            });
        }

        let remote = NetAddress::websocket(address, protocol)?;
        let url = remote.base_string();
        if remote.is_encrypted() {
            crate::stream::install_crypto_provider();
        }

        let connect_timeout = ctx.config().connect_timeout;
        let (stream, _response) = ctx
            .handle()
            .block_on(async { tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await })
            .map_err(|_| NetError::connect(&url, io::Error::from(io::ErrorKind::TimedOut)))??;

        let (sink, stream) = stream.split();
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let failed = Arc::new(AtomicBool::new(false));
        let reader = ctx.handle().spawn(read_frames(
            stream,
            Arc::clone(&queue),
            Arc::clone(&failed),
            name.to_string(),
        ));
        let (outgoing, pending) = mpsc::channel(WRITE_QUEUE_FRAMES);
        let writer = ctx.handle().spawn(write_frames(
            sink,
            pending,
            Arc::clone(&failed),
            name.to_string(),
            connect_timeout,
        ));

        log::info!("{} connected to {}", name, url);

        Ok(Self {
            info: ConnectionInfo::new(name, listening, remote.protocol, AddressFamily::WebSocket),
            ctx: Arc::clone(ctx),
            remote,
            outgoing: Some(outgoing),
            queue,
            failed,
            reader,
            writer,
        })
    }

    pub fn remote(&self) -> &NetAddress {
        &self.remote
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

async fn read_frames(
    mut stream: SplitStream<WsStream>,
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    failed: Arc<AtomicBool>,
    name: String,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(data)) => queue.lock().push_back(data),
            Ok(Message::Close(_)) => {
                log::debug!("{} closed by peer", name);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("{} read failed: {}", name, e);
                break;
            }
        }
    }
    failed.store(true, Ordering::SeqCst);
}

/// Sends queued frames in order. A frame the peer does not take within
/// `send_timeout` fails the connection. Once the sender is dropped the
/// remaining frames are flushed and a close frame follows.
async fn write_frames(
    mut sink: SplitSink<WsStream, Message>,
    mut pending: mpsc::Receiver<Vec<u8>>,
    failed: Arc<AtomicBool>,
    name: String,
    send_timeout: Duration,
) {
    while let Some(data) = pending.recv().await {
        match tokio::time::timeout(send_timeout, sink.send(Message::Binary(data))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("{} send failed: {}", name, e);
                failed.store(true, Ordering::SeqCst);
                return;
            }
            Err(_) => {
                log::debug!("{} peer stopped reading", name);
                failed.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
    if !failed.load(Ordering::SeqCst) {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    }
}

impl Connection for WebSocketConnection {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ConnectionInfo {
        &mut self.info
    }

    fn get_packet(&mut self, buffer: &mut PacketBuffer) -> bool {
        let mut queue = self.queue.lock();
        while let Some(payload) = queue.pop_front() {
            if buffer.load(&payload, self.remote.clone()) {
                return true;
            }
            log::debug!("{} dropped oversized frame ({} bytes)", self.info.name, payload.len());
        }
        false
    }

    fn send_packet(&mut self, data: &[u8], to: &NetAddress) -> SendStatus {
        if *to != self.remote {
            return SendStatus::NoRoute;
        }
        if let Some(verdict) = self.ctx.mtu_verdict(data.len()) {
            return verdict;
        }
        if self.is_failed() {
            return SendStatus::Disconnected;
        }
        let Some(outgoing) = &self.outgoing else {
            return SendStatus::Disconnected;
        };

        match outgoing.try_send(data.to_vec()) {
            Ok(()) => SendStatus::Sent,
            Err(TrySendError::Full(_)) => {
                log::debug!("{} write queue full, dropping {} bytes", self.info.name, data.len());
                SendStatus::Disconnected
            }
            Err(TrySendError::Closed(_)) => {
                self.failed.store(true, Ordering::SeqCst);
                SendStatus::Disconnected
            }
        }
    }

    fn local_addresses(&self, max: usize) -> Vec<LocalAddress> {
        if max == 0 {
            return Vec::new();
        }
        let mut flags = AddressFlags::RELIABLE;
        if self.remote.is_encrypted() {
            flags |= AddressFlags::ENCRYPTED;
        }
        vec![LocalAddress {
            flags,
            address: self.remote.clone(),
            params: Some(self.remote.base_string()),
        }]
    }

    fn close(mut self: Box<Self>) {
        log::debug!("{} closing", self.info.name);
        self.outgoing = None;
        let ctx = Arc::clone(&self.ctx);
        ctx.join_task(&mut self.writer, CLOSE_TIMEOUT);
        ctx.join_task(&mut self.reader, Duration::ZERO);
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
        self.queue.lock().clear();
    }
}
