use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::address::{self, AddressFamily, NetAddress, Protocol};
use crate::connection::{AddressFlags, Connection, ConnectionInfo, LocalAddress, MAX_OVERALL_MSGLEN, PacketBuffer};
use crate::context::NetContext;
use crate::error::{NetError, SendStatus};

const RECV_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct PendingDatagram {
    from: NetAddress,
    payload: Vec<u8>,
}

type PendingQueue = Arc<Mutex<VecDeque<PendingDatagram>>>;

/// Unconnected UDP socket. Datagrams are read on the runtime by a receive
/// task and wait in a private queue until the polling thread asks for them.
pub struct DatagramConnection {
    info: ConnectionInfo,
    ctx: Arc<NetContext>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    queue: PendingQueue,
    recv_task: JoinHandle<()>,
}

impl DatagramConnection {
    /// Binds `address`, which is either a bare port (`"27500"`, `":27500"`,
    /// empty for any port) or a host with optional port. `family` picks the
    /// wildcard address when no host is named.
    pub fn establish(
        ctx: &Arc<NetContext>,
        name: &str,
        address: &str,
        family: AddressFamily,
        listening: bool,
    ) -> Result<Self, NetError> {
        let bind_addr = bind_target(ctx, address, family)?;
        let std_socket = bind_socket(bind_addr).map_err(NetError::Bind)?;
        let local_addr = std_socket.local_addr()?;

        let socket = {
            let _guard = ctx.handle().enter();
            Arc::new(UdpSocket::from_std(std_socket)?)
        };

        let socket_family = match local_addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        };

        let queue: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
        let recv_task = ctx.handle().spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&queue),
            name.to_string(),
        ));

        log::info!("{} bound to {}", name, local_addr);

        Ok(Self {
            info: ConnectionInfo::new(name, listening, Protocol::Datagram, socket_family),
            ctx: Arc::clone(ctx),
            socket,
            local_addr,
            queue,
            recv_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

fn bind_target(ctx: &NetContext, address: &str, family: AddressFamily) -> Result<SocketAddr, NetError> {
    let address = address.trim();
    let wildcard = |port: u16| -> SocketAddr {
        match family {
            AddressFamily::Ipv6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        }
    };

    if address.is_empty() {
        return Ok(wildcard(0));
    }
    let port_only = address.strip_prefix(':').unwrap_or(address);
    if port_only.bytes().all(|b| b.is_ascii_digit()) {
        let port = address::parse_port(port_only).ok_or_else(|| NetError::invalid_address(address))?;
        return Ok(wildcard(port));
    }

    let resolved = ctx.string_to_address(address, 0)?;
    resolved
        .to_socket_addr()
        .ok_or_else(|| NetError::invalid_address(address))
}

/// IPv6 sockets are v6-only so they can share a port with the IPv4 socket.
fn bind_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(socket2::Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn receive_loop(socket: Arc<UdpSocket>, queue: PendingQueue, name: String) {
    let mut buf = vec![0u8; MAX_OVERALL_MSGLEN];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                queue.lock().push_back(PendingDatagram {
                    from: NetAddress::from(from),
                    payload: buf[..len].to_vec(),
                });
            }
            Err(e) => {
                // ICMP unreachable and similar show up here; the socket stays usable.
                log::trace!("{} receive error: {}", name, e);
                tokio::time::sleep(RECV_RETRY_DELAY).await;
            }
        }
    }
}

impl Connection for DatagramConnection {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ConnectionInfo {
        &mut self.info
    }

    fn get_packet(&mut self, buffer: &mut PacketBuffer) -> bool {
        let mut queue = self.queue.lock();
        while let Some(datagram) = queue.pop_front() {
            if buffer.load(&datagram.payload, datagram.from.clone()) {
                return true;
            }
            log::debug!(
                "{} dropped oversized packet ({} bytes) from {}",
                self.info.name,
                datagram.payload.len(),
                datagram.from
            );
        }
        false
    }

    fn send_packet(&mut self, data: &[u8], to: &NetAddress) -> SendStatus {
        if !self.info.accepts(to.family()) {
            return SendStatus::NoRoute;
        }
        let Some(target) = to.to_socket_addr() else {
            return SendStatus::NoRoute;
        };
        if let Some(verdict) = self.ctx.mtu_verdict(data.len()) {
            return verdict;
        }

        let result = match self.socket.try_send_to(data, target) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.ctx.handle().block_on(self.socket.send_to(data, target))
            }
            other => other,
        };

        match result {
            Ok(_) => SendStatus::Sent,
            Err(e) => {
                log::debug!("{} send to {} failed: {}", self.info.name, to, e);
                SendStatus::Disconnected
            }
        }
    }

    fn local_addresses(&self, max: usize) -> Vec<LocalAddress> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }
        let bound = NetAddress::from(self.local_addr);
        if !self.local_addr.ip().is_unspecified() {
            out.push(LocalAddress {
                flags: AddressFlags::empty(),
                address: bound,
                params: None,
            });
            return out;
        }

        out.push(LocalAddress {
            flags: AddressFlags::WILDCARD,
            address: bound,
            params: None,
        });
        if out.len() < max {
            let mut preferred = self.ctx.local_address();
            if preferred.family() != self.info.families[0] {
                // No outward route for this family; the host is still reachable locally.
                let ip = match self.local_addr {
                    SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                };
                preferred = NetAddress::from(SocketAddr::new(ip, 0));
            }
            preferred.port = self.local_addr.port();
            out.push(LocalAddress {
                flags: AddressFlags::empty(),
                address: preferred,
                params: None,
            });
        }
        out
    }

    fn close(mut self: Box<Self>) {
        log::debug!("{} closing ({})", self.info.name, self.local_addr);
        let ctx = Arc::clone(&self.ctx);
        ctx.join_task(&mut self.recv_task, Duration::ZERO);
    }
}

impl Drop for DatagramConnection {
    fn drop(&mut self) {
        // The receive task must be gone before the queue is discarded.
        self.recv_task.abort();
        self.queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;

    fn wait_for_packet(conn: &mut DatagramConnection, buffer: &mut PacketBuffer) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if conn.get_packet(buffer) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_bind_target_forms() {
        let ctx = NetContext::new(NetConfig::default()).unwrap();
        assert_eq!(
            bind_target(&ctx, "27500", AddressFamily::Ipv4).unwrap(),
            "0.0.0.0:27500".parse().unwrap()
        );
        assert_eq!(
            bind_target(&ctx, ":27500", AddressFamily::Ipv6).unwrap(),
            "[::]:27500".parse().unwrap()
        );
        assert_eq!(
            bind_target(&ctx, "", AddressFamily::Ipv4).unwrap(),
            "0.0.0.0:0".parse().unwrap()
        );
        assert_eq!(
            bind_target(&ctx, "127.0.0.1:9000", AddressFamily::Invalid).unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
        assert!(bind_target(&ctx, "99999", AddressFamily::Ipv4).is_err());
    }

    #[test]
    fn test_send_and_receive_on_localhost() {
        let ctx = NetContext::new(NetConfig::default()).unwrap();
        let mut a = DatagramConnection::establish(&ctx, "A", "127.0.0.1:0", AddressFamily::Ipv4, true).unwrap();
        let mut b = DatagramConnection::establish(&ctx, "B", "127.0.0.1:0", AddressFamily::Ipv4, false).unwrap();

        let to_a = NetAddress::from(a.local_addr());
        assert_eq!(b.send_packet(b"hello", &to_a), SendStatus::Sent);

        let mut buffer = PacketBuffer::new();
        assert!(wait_for_packet(&mut a, &mut buffer));
        assert_eq!(buffer.data(), b"hello");
        assert_eq!(buffer.from(), &NetAddress::from(b.local_addr()));
    }

    #[test]
    fn test_family_mismatch_is_no_route() {
        let ctx = NetContext::new(NetConfig::default()).unwrap();
        let mut conn = DatagramConnection::establish(&ctx, "UDP", "127.0.0.1:0", AddressFamily::Ipv4, false).unwrap();
        let v6 = NetAddress::ipv6(Ipv6Addr::LOCALHOST.octets(), 0, 27500);
        assert_eq!(conn.send_packet(&[1], &v6), SendStatus::NoRoute);
        assert_eq!(conn.send_packet(&[1], &NetAddress::loopback(0)), SendStatus::NoRoute);
    }

    #[test]
    fn test_oversized_packet_is_dropped() {
        let ctx = NetContext::new(NetConfig::default()).unwrap();
        let mut a = DatagramConnection::establish(&ctx, "A", "127.0.0.1:0", AddressFamily::Ipv4, true).unwrap();
        let mut b = DatagramConnection::establish(&ctx, "B", "127.0.0.1:0", AddressFamily::Ipv4, false).unwrap();
        let to_a = NetAddress::from(a.local_addr());

        b.send_packet(&[9; 64], &to_a);
        b.send_packet(&[1; 4], &to_a);

        let mut small = PacketBuffer::with_capacity(16);
        assert!(wait_for_packet(&mut a, &mut small));
        assert_eq!(small.data(), &[1; 4]);
    }

    #[test]
    fn test_local_addresses_report_bound_port() {
        let ctx = NetContext::new(NetConfig::default()).unwrap();
        let conn = DatagramConnection::establish(&ctx, "UDP", "127.0.0.1:0", AddressFamily::Ipv4, true).unwrap();
        let addrs = conn.local_addresses(4);
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].address.port, conn.local_addr().port());
        assert!(conn.local_addresses(0).is_empty());
    }

    #[test]
    fn test_wildcard_lists_a_reachable_address() {
        let ctx = NetContext::new(NetConfig::default()).unwrap();
        let conn = DatagramConnection::establish(&ctx, "UDP", "", AddressFamily::Ipv4, true).unwrap();
        let addrs = conn.local_addresses(4);
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].flags.contains(AddressFlags::WILDCARD));
        assert!(!addrs[1].flags.contains(AddressFlags::WILDCARD));
        let reachable = addrs[1].address.to_socket_addr().unwrap();
        assert!(!reachable.ip().is_unspecified());
        assert_eq!(reachable.port(), conn.local_addr().port());
    }

    #[test]
    fn test_close_releases_the_port() {
        let ctx = NetContext::new(NetConfig::default()).unwrap();
        for _ in 0..50 {
            let conn = DatagramConnection::establish(&ctx, "UDP", "127.0.0.1:0", AddressFamily::Ipv4, true).unwrap();
            let bound = conn.local_addr();
            Box::new(conn).close();
            assert!(std::net::UdpSocket::bind(bound).is_ok(), "{} still bound after close", bound);
        }
    }

    #[test]
    fn test_ipv6_wildcard_shares_port_with_ipv4() {
        if std::net::UdpSocket::bind("[::1]:0").is_err() {
            return;
        }
        let ctx = NetContext::new(NetConfig::default()).unwrap();
        let v4 = DatagramConnection::establish(&ctx, "UDP", "", AddressFamily::Ipv4, true).unwrap();
        let port = v4.local_addr().port();
        let v6 = DatagramConnection::establish(&ctx, "UDP6", &port.to_string(), AddressFamily::Ipv6, true).unwrap();
        assert_eq!(v6.local_addr().port(), port);
        assert!(v6.local_addr().is_ipv6());
    }
}
