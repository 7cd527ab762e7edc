use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::address::{self, NetAddress, Protocol};
use crate::context::NetContext;
use crate::error::{NetError, VfsError};

const DEFAULT_PLAIN_PORT: u16 = 80;
const DEFAULT_TLS_PORT: u16 = 443;

/// Installs the ring provider as the process default for rustls. Later calls
/// are no-ops.
pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Handle of an open stream. Never zero, so it cannot be mistaken for an
/// unset descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(NonZeroU32);

impl StreamId {
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

struct StreamEntry {
    stream: Box<dyn ByteStream>,
    peer: NetAddress,
}

/// Streams that are connected but not yet wrapped as files.
pub struct StreamTable {
    entries: Mutex<HashMap<StreamId, StreamEntry>>,
    next: AtomicU32,
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next: AtomicU32::new(1),
        }
    }

    fn insert(&self, entry: StreamEntry) -> StreamId {
        let id = loop {
            if let Some(raw) = NonZeroU32::new(self.next.fetch_add(1, Ordering::Relaxed)) {
                break StreamId(raw);
            }
        };
        self.entries.lock().insert(id, entry);
        id
    }

    fn take(&self, id: StreamId) -> Option<StreamEntry> {
        self.entries.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamTarget {
    host: String,
    port: u16,
    tls: bool,
}

/// Splits `scheme://host:port/path`. `https`, `wss` and `tls` ask for TLS;
/// without a scheme the connection is plain TCP.
fn parse_stream_target(name: &str) -> Result<StreamTarget, NetError> {
    let name = name.trim();
    let (scheme, rest) = match name.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, name),
    };
    let tls = matches!(scheme.as_deref(), Some("https" | "wss" | "tls"));
    let default_port = match scheme.as_deref() {
        Some("https" | "wss" | "tls") => Some(DEFAULT_TLS_PORT),
        Some("http" | "ws") => Some(DEFAULT_PLAIN_PORT),
        _ => None,
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() {
        return Err(NetError::MissingHost(name.to_string()));
    }

    let (host, port) = address::split_host_port(authority, default_port.unwrap_or(0))?;
    if port == 0 {
        return Err(NetError::MissingPort(name.to_string()));
    }
    Ok(StreamTarget {
        host: host.to_string(),
        port,
        tls,
    })
}

fn tls_connector() -> Result<TlsConnector, NetError> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn connect_stream(
    addr: SocketAddr,
    tls: bool,
    server_name: String,
    connect_timeout: Duration,
) -> Result<Box<dyn ByteStream>, NetError> {
    let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
    tcp.set_nodelay(true)?;
    if !tls {
        return Ok(Box::new(tcp));
    }

    let name = ServerName::try_from(server_name).map_err(|e| NetError::Tls(e.to_string()))?;
    let connector = tls_connector()?;
    let stream = tokio::time::timeout(connect_timeout, connector.connect(name, tcp))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
        .map_err(|e| NetError::Tls(e.to_string()))?;
    Ok(Box::new(stream))
}

/// Connects a TCP stream, optionally wrapped in TLS, and parks it in the
/// context's stream table. This blocks the calling thread for up to the
/// connect timeout; keep it off the polling thread.
///
/// A valid `remote` address is preferred over `remote_name`; on success it
/// is overwritten with the address actually connected to.
pub fn open_stream(
    ctx: &Arc<NetContext>,
    remote: Option<&mut NetAddress>,
    remote_name: Option<&str>,
) -> Result<StreamId, NetError> {
    let named = remote_name.map(parse_stream_target).transpose()?;
    let structured = remote
        .as_deref()
        .filter(|a| a.to_socket_addr().is_some())
        .cloned();

    let (peer, tls, server_name) = match (structured, named) {
        (Some(addr), named) => {
            let tls = addr.protocol.is_encrypted() || named.as_ref().is_some_and(|n| n.tls);
            let server = named.map(|n| n.host).unwrap_or_else(|| addr.base_string());
            (addr, tls, server)
        }
        (None, Some(target)) => {
            let addr = ctx.string_to_address(&target.host, target.port)?;
            (addr, target.tls, target.host)
        }
        (None, None) => return Err(NetError::MissingHost(String::new())),
    };

    let socket_addr = peer
        .to_socket_addr()
        .ok_or_else(|| NetError::invalid_address(peer.to_string()))?;
    let connect_timeout = ctx.config().connect_timeout;
    let target = peer.to_string();

    let stream = ctx
        .handle()
        .block_on(connect_stream(socket_addr, tls, server_name, connect_timeout))
        .map_err(|e| match e {
            NetError::Io(source) => NetError::connect(&target, source),
            other => other,
        })?;

    let protocol = if tls { Protocol::Tls } else { Protocol::Stream };
    let peer = peer.with_protocol(protocol);
    if let Some(remote) = remote {
        *remote = peer.clone();
    }

    let id = ctx.streams().insert(StreamEntry { stream, peer });
    log::debug!("Opened {} to {} (tls: {})", id, target, tls);
    Ok(id)
}

/// Hands the stream over to a file wrapper. The table forgets the id.
pub fn wrap_stream(ctx: &Arc<NetContext>, id: StreamId) -> Option<StreamFile> {
    let entry = ctx.streams().take(id)?;
    Some(StreamFile {
        ctx: Arc::clone(ctx),
        id,
        peer: entry.peer,
        stream: Some(entry.stream),
    })
}

/// Shuts down a stream that was never wrapped. Returns false for unknown ids.
pub fn close_stream(ctx: &Arc<NetContext>, id: StreamId) -> bool {
    match ctx.streams().take(id) {
        Some(mut entry) => {
            let _ = ctx.handle().block_on(entry.stream.shutdown());
            true
        }
        None => false,
    }
}

/// File-like view of a byte stream, the way higher layers consume HTTP style
/// exchanges. Forward only: seeking is not available.
pub trait VfsFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, VfsError>;

    fn write(&mut self, data: &[u8]) -> Result<usize, VfsError>;

    fn seek(&mut self, pos: u64) -> bool;

    fn tell(&self) -> u64;

    fn len(&self) -> u64;

    fn flush(&mut self) -> Result<(), VfsError>;

    fn close(&mut self);
}

fn vfs_error(e: &io::Error) -> VfsError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => VfsError::NoResponse,
        io::ErrorKind::UnexpectedEof => VfsError::Eof,
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            VfsError::Closed
        }
        _ => VfsError::Unspecified,
    }
}

/// Blocking file over a stream. Every read and write waits on the async
/// runtime, so it must not be used from inside a runtime task.
pub struct StreamFile {
    ctx: Arc<NetContext>,
    id: StreamId,
    peer: NetAddress,
    stream: Option<Box<dyn ByteStream>>,
}

impl StreamFile {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn peer(&self) -> &NetAddress {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl VfsFile for StreamFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, VfsError> {
        let stream = self.stream.as_mut().ok_or(VfsError::Closed)?;
        if buf.is_empty() {
            return Ok(0);
        }
        match self.ctx.handle().block_on(stream.read(buf)) {
            Ok(0) => Err(VfsError::Eof),
            Ok(n) => Ok(n),
            Err(e) => Err(vfs_error(&e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, VfsError> {
        let stream = self.stream.as_mut().ok_or(VfsError::Closed)?;
        self.ctx
            .handle()
            .block_on(stream.write_all(data))
            .map_err(|e| vfs_error(&e))?;
        Ok(data.len())
    }

    fn seek(&mut self, _pos: u64) -> bool {
        false
    }

    fn tell(&self) -> u64 {
        0
    }

    fn len(&self) -> u64 {
        0
    }

    fn flush(&mut self) -> Result<(), VfsError> {
        let stream = self.stream.as_mut().ok_or(VfsError::Closed)?;
        self.ctx
            .handle()
            .block_on(stream.flush())
            .map_err(|e| vfs_error(&e))
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.ctx.handle().block_on(stream.shutdown());
            log::debug!("Closed {} ({})", self.id, self.peer);
        }
    }
}

impl io::Read for StreamFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match VfsFile::read(self, buf) {
            Ok(n) => Ok(n),
            Err(VfsError::Eof) => Ok(0),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

impl io::Write for StreamFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        VfsFile::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        VfsFile::flush(self).map_err(io::Error::other)
    }
}

impl Drop for StreamFile {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn echo_server() -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            loop {
                match socket.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if socket.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        (port, handle)
    }

    #[test]
    fn test_parse_stream_target() {
        let target = parse_stream_target("https://example.com/index.html").unwrap();
        assert_eq!(
            target,
            StreamTarget {
                host: "example.com".into(),
                port: 443,
                tls: true
            }
        );

        let target = parse_stream_target("tcp://10.0.0.1:8080").unwrap();
        assert_eq!(target.port, 8080);
        assert!(!target.tls);

        let target = parse_stream_target("[::1]:27500").unwrap();
        assert_eq!(target.host, "::1");

        assert!(matches!(parse_stream_target("example.com"), Err(NetError::MissingPort(_))));
        assert!(matches!(parse_stream_target("http:///path"), Err(NetError::MissingHost(_))));
    }

    #[test]
    fn test_stream_echo_by_name() {
        let (port, server) = echo_server();
        let ctx = NetContext::new(NetConfig::default()).unwrap();

        let name = format!("tcp://127.0.0.1:{}", port);
        let id = open_stream(&ctx, None, Some(&name)).unwrap();
        assert_eq!(ctx.streams().len(), 1);

        let mut file = wrap_stream(&ctx, id).unwrap();
        assert!(ctx.streams().is_empty());
        assert!(wrap_stream(&ctx, id).is_none());

        assert_eq!(VfsFile::write(&mut file, b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        assert!(!file.seek(10));
        assert_eq!(file.tell(), 0);
        assert_eq!(VfsFile::len(&file), 0);

        file.close();
        assert!(!file.is_open());
        assert_eq!(VfsFile::read(&mut file, &mut buf), Err(VfsError::Closed));
        server.join().unwrap();
    }

    #[test]
    fn test_structured_address_is_updated() {
        let (port, server) = echo_server();
        let ctx = NetContext::new(NetConfig::default()).unwrap();

        let mut remote = NetAddress::ipv4([127, 0, 0, 1], port);
        let id = open_stream(&ctx, Some(&mut remote), None).unwrap();
        assert_eq!(remote.protocol, Protocol::Stream);
        assert!(close_stream(&ctx, id));
        assert!(!close_stream(&ctx, id));
        server.join().unwrap();
    }

    #[test]
    fn test_eof_after_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });

        let ctx = NetContext::new(NetConfig::default()).unwrap();
        let mut remote = NetAddress::ipv4([127, 0, 0, 1], port);
        let id = open_stream(&ctx, Some(&mut remote), None).unwrap();
        let mut file = wrap_stream(&ctx, id).unwrap();
        server.join().unwrap();

        let mut buf = [0u8; 8];
        let result = VfsFile::read(&mut file, &mut buf);
        assert!(matches!(result, Err(VfsError::Eof) | Err(VfsError::Closed)));
    }
}
