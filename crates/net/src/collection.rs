use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address::{AddressFamily, NetAddress, Protocol};
use crate::connection::{AddressFlags, Connection, LocalAddress, PacketBuffer};
use crate::context::NetContext;
use crate::datagram::DatagramConnection;
use crate::error::{NetError, SendStatus};
use crate::loopback::LoopbackConnection;
use crate::websocket::WebSocketConnection;

pub const MAX_CONNECTIONS: usize = 8;

/// Most packets taken from one connection per `read_packets` call.
pub const READ_BUDGET: usize = 32;

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// One received packet, borrowed from the collection's receive buffer for the
/// duration of a single handler call.
#[derive(Debug, Clone, Copy)]
pub struct Inbound<'a> {
    pub data: &'a [u8],
    pub from: &'a NetAddress,
    pub slot: usize,
    pub connection: &'a str,
}

pub type PacketHandler = Box<dyn FnMut(Inbound<'_>) + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Per-second averages over the last completed rate window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficRates {
    pub packets_in: f32,
    pub packets_out: f32,
    pub bytes_in: f32,
    pub bytes_out: f32,
}

#[derive(Debug, Clone)]
pub struct BoundAddress {
    pub slot: usize,
    pub connection: String,
    pub local: LocalAddress,
}

/// Owns up to `MAX_CONNECTIONS` transports and presents them as a single
/// packet source and sink. Slots keep their index for life; closing one
/// leaves a hole.
pub struct ConnectionCollection {
    ctx: Arc<NetContext>,
    listening: bool,
    slots: [Option<Box<dyn Connection>>; MAX_CONNECTIONS],
    handler: PacketHandler,
    scratch: PacketBuffer,
    totals: TrafficTotals,
    rates: TrafficRates,
    window_start: Instant,
    window_totals: TrafficTotals,
}

impl ConnectionCollection {
    pub fn new(ctx: &Arc<NetContext>, listening: bool, handler: impl FnMut(Inbound<'_>) + Send + 'static) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            listening,
            slots: Default::default(),
            handler: Box::new(handler),
            scratch: PacketBuffer::new(),
            totals: TrafficTotals::default(),
            rates: TrafficRates::default(),
            window_start: Instant::now(),
            window_totals: TrafficTotals::default(),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn context(&self) -> &Arc<NetContext> {
        &self.ctx
    }

    /// Establishes a transport picked by `family` and `protocol` and stores
    /// it in the first free slot. Returns the 1-based slot.
    pub fn add(
        &mut self,
        name: &str,
        address: &str,
        family: AddressFamily,
        protocol: Protocol,
    ) -> Result<usize, NetError> {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            log::warn!("No free connection slot for {} ({})", name, address);
            return Err(NetError::NoFreeSlot(name.to_string()));
        };

        let mut conn = match self.establish(name, address, family, protocol) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to establish {} ({}): {}", name, address, e);
                return Err(e);
            }
        };

        conn.info_mut().slot = index + 1;
        self.slots[index] = Some(conn);
        Ok(index + 1)
    }

    fn establish(
        &self,
        name: &str,
        address: &str,
        family: AddressFamily,
        protocol: Protocol,
    ) -> Result<Box<dyn Connection>, NetError> {
        if family == AddressFamily::Loopback {
            return Ok(Box::new(LoopbackConnection::establish(&self.ctx, name, self.listening)?));
        }
        if !self.ctx.enabled() {
            return Err(NetError::Disabled);
        }

        match (protocol, family) {
            (Protocol::Datagram, AddressFamily::Ipv4 | AddressFamily::Ipv6 | AddressFamily::Invalid) => Ok(Box::new(
                DatagramConnection::establish(&self.ctx, name, address, family, self.listening)?,
            )),
            (Protocol::Ws | Protocol::Wss, _) => Ok(Box::new(WebSocketConnection::establish(
                &self.ctx,
                name,
                address,
                protocol,
                self.listening,
            )?)),
            _ => Err(NetError::Unsupported { family, protocol }),
        }
    }

    /// Closes the connection in `slot` (1-based). The slot stays empty.
    pub fn remove(&mut self, slot: usize) -> bool {
        let Some(entry) = slot.checked_sub(1).and_then(|i| self.slots.get_mut(i)) else {
            return false;
        };
        match entry.take() {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, slot: usize) -> Option<&dyn Connection> {
        self.slots.get(slot.checked_sub(1)?)?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `READ_BUDGET` packets from each connection in slot order,
    /// calling the handler once per packet. The handler must not call back
    /// into this collection.
    pub fn read_packets(&mut self) -> usize {
        let mut delivered = 0;
        for conn in self.slots.iter_mut().flatten() {
            for _ in 0..READ_BUDGET {
                if !conn.get_packet(&mut self.scratch) {
                    break;
                }
                if self.ctx.should_drop() {
                    log::trace!("Fake loss dropped packet from {}", self.scratch.from());
                    continue;
                }
                self.totals.packets_in += 1;
                self.totals.bytes_in += self.scratch.len() as u64;
                delivered += 1;

                (self.handler)(Inbound {
                    data: self.scratch.data(),
                    from: self.scratch.from(),
                    slot: conn.info().slot,
                    connection: conn.name(),
                });
            }
        }
        delivered
    }

    /// Offers the packet to each connection in slot order until one sends it.
    /// When none does, the most specific failure is returned.
    pub fn send_packet(&mut self, data: &[u8], to: &NetAddress) -> SendStatus {
        if data.is_empty() || !to.is_valid() {
            return SendStatus::NoRoute;
        }
        if self.ctx.should_drop() {
            log::trace!("Fake loss dropped packet to {}", to);
            return SendStatus::Sent;
        }

        let mut status = SendStatus::NoRoute;
        for conn in self.slots.iter_mut().flatten() {
            let result = conn.send_packet(data, to);
            if result.is_sent() {
                self.totals.packets_out += 1;
                self.totals.bytes_out += data.len() as u64;
                return result;
            }
            if result.specificity() > status.specificity() {
                status = result;
            }
        }
        status
    }

    pub fn totals(&self) -> TrafficTotals {
        self.totals
    }

    pub fn rates(&self) -> TrafficRates {
        self.rates
    }

    /// Folds the counters into per-second rates once a full window passed.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < RATE_WINDOW {
            return;
        }
        let secs = elapsed.as_secs_f32();
        let current = self.totals;
        let previous = self.window_totals;
        self.rates = TrafficRates {
            packets_in: (current.packets_in - previous.packets_in) as f32 / secs,
            packets_out: (current.packets_out - previous.packets_out) as f32 / secs,
            bytes_in: (current.bytes_in - previous.bytes_in) as f32 / secs,
            bytes_out: (current.bytes_out - previous.bytes_out) as f32 / secs,
        };
        self.window_totals = current;
        self.window_start = now;
    }

    /// Local endpoints of all connections in slot order, at most `max`.
    pub fn enumerate_addresses(&self, max: usize) -> Vec<BoundAddress> {
        let mut out = Vec::new();
        for conn in self.slots.iter().flatten() {
            if out.len() >= max {
                break;
            }
            for local in conn.local_addresses(max - out.len()) {
                out.push(BoundAddress {
                    slot: conn.info().slot,
                    connection: conn.name().to_string(),
                    local,
                });
            }
        }
        out
    }

    /// Human readable dump of every connection's bound addresses.
    pub fn status_report(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for conn in self.slots.iter().flatten() {
            let addresses = conn.local_addresses(MAX_CONNECTIONS);
            if addresses.is_empty() {
                lines.push(format!("{}: (no address info)", conn.name()));
                continue;
            }
            for local in addresses {
                let mut line = format!(
                    "{}: {} ({})",
                    conn.name(),
                    local.address,
                    local.address.classify().describe()
                );
                if !local.flags.is_empty() {
                    line.push_str(&format!(" {:?}", local.flags));
                }
                if let Some(params) = &local.params {
                    line.push_str(&format!(" {}", params));
                }
                lines.push(line);
            }
        }
        lines
    }

    /// Closes every connection. Also runs on drop.
    pub fn close(mut self) {
        self.close_all();
    }

    fn close_all(&mut self) {
        for entry in self.slots.iter_mut() {
            if let Some(conn) = entry.take() {
                conn.close();
            }
        }
    }
}

impl Drop for ConnectionCollection {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Client side sockets as the engine opens them at start-up.
pub struct ClientSockets {
    pub sockets: ConnectionCollection,
    /// Address the IPv4 UDP socket reported, if one was opened.
    pub local_address: Option<NetAddress>,
}

/// Opens `CLLoopback` and, unless `loopback_only`, `CLUDP` on `port` plus an
/// optional `CLUDP6`. A missing IPv4 socket is fatal for a networked client.
pub fn init_client(
    ctx: &Arc<NetContext>,
    handler: impl FnMut(Inbound<'_>) + Send + 'static,
    loopback_only: bool,
    port: u16,
) -> Result<ClientSockets, NetError> {
    let mut sockets = ConnectionCollection::new(ctx, false, handler);
    if let Err(e) = sockets.add("CLLoopback", "", AddressFamily::Loopback, Protocol::Datagram) {
        log::debug!("Client loopback unavailable: {}", e);
    }

    if loopback_only {
        log::info!("Client running in loopback-only mode");
        return Ok(ClientSockets {
            sockets,
            local_address: None,
        });
    }

    let slot = sockets.add("CLUDP", &port.to_string(), AddressFamily::Ipv4, Protocol::Datagram)?;
    let local_address = sockets.connection(slot).and_then(|c| {
        let addresses = c.local_addresses(MAX_CONNECTIONS);
        addresses
            .iter()
            .find(|local| !local.flags.contains(AddressFlags::WILDCARD))
            .or(addresses.first())
            .map(|local| local.address.clone())
    });

    let v6 = format!("[::]:{}", port);
    if sockets.add("CLUDP6", &v6, AddressFamily::Ipv6, Protocol::Datagram).is_err() {
        log::debug!("IPv6 UDP socket unavailable for client traffic");
    }

    log::info!("Client networking ready");
    Ok(ClientSockets {
        sockets,
        local_address,
    })
}

/// Opens `SVLoopback`, `SVUDP` on `port` and, when that worked, `SVUDP6`.
pub fn init_server(
    ctx: &Arc<NetContext>,
    handler: impl FnMut(Inbound<'_>) + Send + 'static,
    port: u16,
) -> ConnectionCollection {
    let mut sockets = ConnectionCollection::new(ctx, true, handler);
    if let Err(e) = sockets.add("SVLoopback", "", AddressFamily::Loopback, Protocol::Datagram) {
        log::debug!("Server loopback unavailable: {}", e);
    }

    if sockets
        .add("SVUDP", &port.to_string(), AddressFamily::Ipv4, Protocol::Datagram)
        .is_ok()
    {
        let v6 = format!("[::]:{}", port);
        if sockets.add("SVUDP6", &v6, AddressFamily::Ipv6, Protocol::Datagram).is_err() {
            log::debug!("IPv6 UDP socket unavailable for server on {}", port);
        }
    }

    log::info!("Server networking ready");
    sockets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use parking_lot::Mutex;

    type Received = Arc<Mutex<Vec<(Vec<u8>, NetAddress, usize)>>>;

    fn recording() -> (Received, impl FnMut(Inbound<'_>) + Send + 'static) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handler = move |packet: Inbound<'_>| {
            sink.lock().push((packet.data.to_vec(), packet.from.clone(), packet.slot));
        };
        (received, handler)
    }

    fn context() -> Arc<NetContext> {
        NetContext::new(NetConfig::default()).unwrap()
    }

    #[test]
    fn test_empty_collection_has_no_route() {
        let ctx = context();
        let mut col = ConnectionCollection::new(&ctx, false, |_| {});
        assert_eq!(col.send_packet(&[1, 2, 3], &NetAddress::loopback(0)), SendStatus::NoRoute);
        assert_eq!(col.read_packets(), 0);
    }

    #[test]
    fn test_slots_are_one_based_and_stable() {
        let ctx = context();
        let mut col = ConnectionCollection::new(&ctx, true, |_| {});
        let first = col.add("A", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        let second = col.add("B", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        assert_eq!((first, second), (1, 2));

        assert!(col.remove(1));
        assert!(col.connection(1).is_none());
        assert_eq!(col.connection(2).map(|c| c.info().slot), Some(2));
        assert!(!col.remove(1));
        assert!(!col.remove(0));

        let third = col.add("C", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        assert_eq!(third, 1);
    }

    #[test]
    fn test_add_fails_closed() {
        let ctx = context();
        let mut col = ConnectionCollection::new(&ctx, true, |_| {});
        col.add("A", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        col.add("B", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();

        let err = col.add("C", "", AddressFamily::Loopback, Protocol::Datagram);
        assert!(matches!(err, Err(NetError::NoLoopbackSide)));
        assert_eq!(col.len(), 2);

        let err = col.add("T", "", AddressFamily::Ipv4, Protocol::Stream);
        assert!(matches!(err, Err(NetError::Unsupported { .. })));
        assert_eq!(col.len(), 2);
    }

    #[test]
    fn test_full_collection_rejects_add() {
        let ctx = context();
        let mut col = ConnectionCollection::new(&ctx, false, |_| {});
        for i in 0..MAX_CONNECTIONS {
            col.add(&format!("UDP{}", i), "127.0.0.1:0", AddressFamily::Ipv4, Protocol::Datagram)
                .unwrap();
        }
        let err = col.add("extra", "127.0.0.1:0", AddressFamily::Ipv4, Protocol::Datagram);
        assert!(matches!(err, Err(NetError::NoFreeSlot(_))));
    }

    #[test]
    fn test_disabled_allows_only_loopback() {
        let ctx = context();
        ctx.update_config(|c| c.enabled = false);
        let mut col = ConnectionCollection::new(&ctx, false, |_| {});
        assert!(matches!(
            col.add("UDP", "127.0.0.1:0", AddressFamily::Ipv4, Protocol::Datagram),
            Err(NetError::Disabled)
        ));
        assert!(col.add("Loop", "", AddressFamily::Loopback, Protocol::Datagram).is_ok());
    }

    #[test]
    fn test_loopback_round_trip_between_collections() {
        let ctx = context();
        let (server_rx, server_handler) = recording();
        let (client_rx, client_handler) = recording();
        let mut server = ConnectionCollection::new(&ctx, true, server_handler);
        let mut client = ConnectionCollection::new(&ctx, false, client_handler);
        server.add("A", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        client.add("B", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();

        assert_eq!(server.send_packet(&[1, 2, 3], &NetAddress::loopback(0)), SendStatus::Sent);
        assert_eq!(client.send_packet(&[4, 5], &NetAddress::loopback(0)), SendStatus::Sent);

        assert_eq!(client.read_packets(), 1);
        assert_eq!(server.read_packets(), 1);

        let client_rx = client_rx.lock();
        assert_eq!(client_rx[0].0, vec![1, 2, 3]);
        assert!(client_rx[0].1.is_loopback());
        assert_eq!(client_rx[0].2, 1);
        assert_eq!(server_rx.lock()[0].0, vec![4, 5]);
    }

    #[test]
    fn test_fake_loss_drops_everything() {
        let ctx = context();
        let (rx, handler) = recording();
        let mut server = ConnectionCollection::new(&ctx, true, |_| {});
        let mut client = ConnectionCollection::new(&ctx, false, handler);
        server.add("A", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        client.add("B", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();

        server.send_packet(&[1], &NetAddress::loopback(0));
        ctx.update_config(|c| c.fake_loss = 1.0);
        assert_eq!(client.read_packets(), 0);
        assert_eq!(server.send_packet(&[2], &NetAddress::loopback(0)), SendStatus::Sent);
        assert_eq!(server.totals().packets_out, 1);

        ctx.update_config(|c| c.fake_loss = 0.0);
        assert_eq!(client.read_packets(), 0);
        assert!(rx.lock().is_empty());
    }

    #[test]
    fn test_most_specific_failure_wins() {
        let ctx = context();
        ctx.update_config(|c| c.fake_mtu = 4);
        let mut col = ConnectionCollection::new(&ctx, false, |_| {});
        col.add("Loop", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        col.add("UDP", "127.0.0.1:0", AddressFamily::Ipv4, Protocol::Datagram).unwrap();

        // Loopback has no route to an IPv4 peer; UDP refuses the size.
        let status = col.send_packet(&[0; 16], &NetAddress::ipv4([127, 0, 0, 1], 9));
        assert_eq!(status, SendStatus::MtuExceeded);
        assert_eq!(col.totals(), TrafficTotals::default());
    }

    #[test]
    fn test_tick_computes_rates() {
        let ctx = context();
        let mut server = ConnectionCollection::new(&ctx, true, |_| {});
        let mut client = ConnectionCollection::new(&ctx, false, |_| {});
        server.add("A", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        client.add("B", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();

        let start = server.window_start;
        for _ in 0..10 {
            server.send_packet(&[0; 50], &NetAddress::loopback(0));
        }
        server.tick_at(start + Duration::from_millis(500));
        assert_eq!(server.rates(), TrafficRates::default());

        server.tick_at(start + Duration::from_secs(2));
        let rates = server.rates();
        assert!((rates.packets_out - 5.0).abs() < 0.01);
        assert!((rates.bytes_out - 250.0).abs() < 0.01);
        assert_eq!(rates.packets_in, 0.0);
    }

    #[test]
    fn test_status_report_lists_connections() {
        let ctx = context();
        let mut col = ConnectionCollection::new(&ctx, true, |_| {});
        col.add("SVLoopback", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        col.add("SVUDP", "127.0.0.1:0", AddressFamily::Ipv4, Protocol::Datagram).unwrap();

        let report = col.status_report();
        assert_eq!(report.len(), 2);
        assert!(report[0].starts_with("SVLoopback: loopback"));
        assert!(report[1].starts_with("SVUDP: 127.0.0.1:"));

        let addresses = col.enumerate_addresses(8);
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[1].slot, 2);
        assert_eq!(col.enumerate_addresses(1).len(), 1);
    }

    #[test]
    fn test_init_client_loopback_only() {
        let ctx = context();
        let client = init_client(&ctx, |_| {}, true, 0).unwrap();
        assert_eq!(client.sockets.len(), 1);
        assert!(client.local_address.is_none());
        assert!(!client.sockets.is_listening());
    }

    #[test]
    fn test_init_client_and_server() {
        let ctx = context();
        let server = init_server(&ctx, |_| {}, 0);
        assert!(server.is_listening());
        assert!(server.connection(1).is_some_and(|c| c.name() == "SVLoopback"));
        assert!(server.connection(2).is_some_and(|c| c.name() == "SVUDP"));

        let client = init_client(&ctx, |_| {}, false, 0).unwrap();
        assert!(client.sockets.connection(1).is_some_and(|c| c.name() == "CLLoopback"));
        assert!(client.sockets.connection(2).is_some_and(|c| c.name() == "CLUDP"));
        let local = client.local_address.and_then(|a| a.to_socket_addr()).unwrap();
        assert!(!local.ip().is_unspecified());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_server_opens_ipv6_on_a_fixed_port() {
        if std::net::UdpSocket::bind("[::1]:0").is_err() {
            return;
        }
        let port = std::net::UdpSocket::bind("0.0.0.0:0").unwrap().local_addr().unwrap().port();
        let ctx = context();
        let server = init_server(&ctx, |_| {}, port);
        assert!(server.connection(2).is_some_and(|c| c.name() == "SVUDP"));
        assert!(server.connection(3).is_some_and(|c| c.name() == "SVUDP6"));
    }

    #[test]
    fn test_read_packets_caps_each_slot() {
        let ctx = context();
        let (rx, handler) = recording();
        let mut listener = ConnectionCollection::new(&ctx, true, handler);
        let mut dialer = ConnectionCollection::new(&ctx, false, |_| {});
        listener.add("A", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();
        dialer.add("B", "", AddressFamily::Loopback, Protocol::Datagram).unwrap();

        for i in 0..40u8 {
            dialer.send_packet(&[i], &NetAddress::loopback(0));
        }
        assert_eq!(listener.read_packets(), READ_BUDGET);
        assert_eq!(listener.read_packets(), 40 - READ_BUDGET);
        assert_eq!(listener.read_packets(), 0);
        let order: Vec<u8> = rx.lock().iter().map(|(data, _, _)| data[0]).collect();
        assert_eq!(order, (0..40).collect::<Vec<u8>>());
    }
}
