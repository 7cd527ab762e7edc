use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use crate::error::NetError;

pub const LOOPBACK_TOKEN: &str = "loopback";
pub const DEFAULT_WS_PORT: u16 = 80;
pub const DEFAULT_WSS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressFamily {
    #[default]
    Invalid,
    Loopback,
    Ipv4,
    Ipv6,
    WebSocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Datagram,
    Stream,
    Tls,
    Ws,
    Wss,
}

impl Protocol {
    pub fn is_encrypted(self) -> bool {
        matches!(self, Protocol::Tls | Protocol::Wss)
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }
}

/// Host part of an address. Only the payload of the active variant exists, so
/// nothing can read bits that do not belong to the address type.
#[derive(Debug, Clone, Default)]
pub enum Host {
    #[default]
    Invalid,
    Loopback,
    V4([u8; 4]),
    V6 { octets: [u8; 16], scope_id: u32 },
    WebSocket(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressScope {
    Process,
    Host,
    LinkLocal,
    Lan,
    Net,
}

impl AddressScope {
    pub fn describe(self) -> &'static str {
        match self {
            AddressScope::Process => "unknown",
            AddressScope::Host => "loopback",
            AddressScope::LinkLocal => "link-local",
            AddressScope::Lan => "lan",
            AddressScope::Net => "global",
        }
    }
}

/// A transport endpoint. `port` is kept in host byte order; conversion to
/// the wire happens only at the socket boundary.
#[derive(Debug, Clone, Default)]
pub struct NetAddress {
    pub host: Host,
    pub port: u16,
    pub protocol: Protocol,
}

impl NetAddress {
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn loopback(port: u16) -> Self {
        Self {
            host: Host::Loopback,
            port,
            protocol: Protocol::Datagram,
        }
    }

    pub fn ipv4(octets: [u8; 4], port: u16) -> Self {
        Self {
            host: Host::V4(octets),
            port,
            protocol: Protocol::Datagram,
        }
    }

    pub fn ipv6(octets: [u8; 16], scope_id: u32, port: u16) -> Self {
        Self {
            host: Host::V6 { octets, scope_id },
            port,
            protocol: Protocol::Datagram,
        }
    }

    /// Builds a websocket endpoint the same way a websocket connection names
    /// its peer: a missing scheme is filled in from `protocol` and the port
    /// comes from the URL or the scheme default.
    pub fn websocket(url: &str, protocol: Protocol) -> Result<Self, NetError> {
        let url = websocket_url(url, protocol)?;
        let parsed = url::Url::parse(&url).map_err(|_| NetError::invalid_address(url.as_str()))?;
        let protocol = match parsed.scheme() {
            "wss" => Protocol::Wss,
            "ws" => Protocol::Ws,
            _ => return Err(NetError::invalid_address(url)),
        };
        let port = parsed.port_or_known_default().unwrap_or(match protocol {
            Protocol::Wss => DEFAULT_WSS_PORT,
            _ => DEFAULT_WS_PORT,
        });
        Ok(Self {
            host: Host::WebSocket(url),
            port,
            protocol,
        })
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn family(&self) -> AddressFamily {
        match self.host {
            Host::Invalid => AddressFamily::Invalid,
            Host::Loopback => AddressFamily::Loopback,
            Host::V4(_) => AddressFamily::Ipv4,
            Host::V6 { .. } => AddressFamily::Ipv6,
            Host::WebSocket(_) => AddressFamily::WebSocket,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.host, Host::Invalid)
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.host, Host::Loopback)
    }

    /// Only the in-process loopback guarantees delivery.
    pub fn is_reliable(&self) -> bool {
        self.is_loopback()
    }

    pub fn is_encrypted(&self) -> bool {
        self.protocol.is_encrypted()
    }

    pub fn is_client_legal(&self) -> bool {
        !matches!(self.host, Host::Invalid)
    }

    /// Parses a literal address without touching any resolver: the
    /// `loopback` token, a websocket URL, dotted-quad IPv4 or IPv6.
    ///
    /// IPv6 with a port must use the bracketed `[addr]:port` form. A string
    /// with several colons and no brackets is read as a bare IPv6 literal and
    /// never split.
    pub fn parse_literal(text: &str, default_port: u16) -> Result<Self, NetError> {
        let text = text.trim();
        if text == LOOPBACK_TOKEN {
            return Ok(Self::loopback(default_port));
        }
        if let Some(protocol) = websocket_scheme(text) {
            return Self::websocket(text, protocol);
        }
        let (host, port) = split_host_port(text, default_port)?;
        parse_ip_literal(host, port).ok_or_else(|| NetError::invalid_address(text))
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::Loopback => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                self.port,
            ))),
            Host::V4(octets) => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(*octets),
                self.port,
            ))),
            Host::V6 { octets, scope_id } => Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(*octets),
                self.port,
                0,
                *scope_id,
            ))),
            Host::Invalid | Host::WebSocket(_) => None,
        }
    }

    /// Host only, without the port.
    pub fn base_string(&self) -> String {
        match &self.host {
            Host::V4(octets) => Ipv4Addr::from(*octets).to_string(),
            Host::V6 { octets, scope_id } => format_ipv6(octets, *scope_id),
            Host::WebSocket(url) => url.clone(),
            Host::Invalid | Host::Loopback => self.to_string(),
        }
    }

    /// Equality ignoring the port.
    pub fn same_base(&self, other: &NetAddress) -> bool {
        match (&self.host, &other.host) {
            (Host::Invalid, Host::Invalid) => true,
            (Host::Loopback, Host::Loopback) => true,
            (Host::V4(a), Host::V4(b)) => a == b,
            (Host::V6 { octets: a, .. }, Host::V6 { octets: b, .. }) => a == b,
            (Host::WebSocket(a), Host::WebSocket(b)) => a == b,
            _ => false,
        }
    }

    pub fn classify(&self) -> AddressScope {
        match &self.host {
            Host::Loopback => AddressScope::Host,
            Host::V4(ip) => {
                let (first, second) = (ip[0], ip[1]);
                if first == 10 || (first == 192 && second == 168) || (first == 172 && (16..=31).contains(&second)) {
                    AddressScope::Lan
                } else if first == 127 {
                    AddressScope::Host
                } else {
                    AddressScope::Net
                }
            }
            Host::V6 { octets, .. } => {
                if Ipv6Addr::from(*octets) == Ipv6Addr::LOCALHOST {
                    AddressScope::Host
                } else if octets[0] & 0xfe == 0xfc {
                    AddressScope::Lan
                } else if octets[0] == 0xfe && octets[1] & 0xc0 == 0x80 {
                    AddressScope::LinkLocal
                } else {
                    AddressScope::Net
                }
            }
            Host::Invalid | Host::WebSocket(_) => AddressScope::Process,
        }
    }
}

impl PartialEq for NetAddress {
    fn eq(&self, other: &Self) -> bool {
        match (&self.host, &other.host) {
            (Host::Invalid, Host::Invalid) => true,
            (Host::Loopback, Host::Loopback) => true,
            (Host::V4(a), Host::V4(b)) => self.port == other.port && a == b,
            (
                Host::V6 {
                    octets: a,
                    scope_id: sa,
                },
                Host::V6 {
                    octets: b,
                    scope_id: sb,
                },
            ) => self.port == other.port && a == b && sa == sb,
            (Host::WebSocket(a), Host::WebSocket(b)) => self.port == other.port && a == b,
            _ => false,
        }
    }
}

impl Eq for NetAddress {}

impl Hash for NetAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.family().hash(state);
        match &self.host {
            Host::Invalid | Host::Loopback => {}
            Host::V4(octets) => {
                octets.hash(state);
                self.port.hash(state);
            }
            Host::V6 { octets, scope_id } => {
                octets.hash(state);
                scope_id.hash(state);
                self.port.hash(state);
            }
            Host::WebSocket(url) => {
                url.hash(state);
                self.port.hash(state);
            }
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Invalid => f.write_str("unknown"),
            Host::Loopback => f.write_str(LOOPBACK_TOKEN),
            Host::V4(octets) => write!(f, "{}:{}", Ipv4Addr::from(*octets), self.port),
            Host::V6 { octets, scope_id } => {
                write!(f, "[{}]:{}", format_ipv6(octets, *scope_id), self.port)
            }
            Host::WebSocket(url) => f.write_str(url),
        }
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => NetAddress::ipv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => NetAddress::ipv4(v4.octets(), v6.port()),
                None => NetAddress::ipv6(v6.ip().octets(), v6.scope_id(), v6.port()),
            },
        }
    }
}

impl FromStr for NetAddress {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetAddress::parse_literal(s, 0)
    }
}

/// Splits `host[:port]` / `[v6host][:port]`. With two or more colons and no
/// brackets the whole string is the host.
pub fn split_host_port(text: &str, default_port: u16) -> Result<(&str, u16), NetError> {
    if text.is_empty() {
        return Err(NetError::invalid_address(text));
    }

    if let Some(rest) = text.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| NetError::invalid_address(text))?;
        let host = &rest[..close];
        let tail = &rest[close + 1..];
        if host.is_empty() {
            return Err(NetError::invalid_address(text));
        }
        let port = match tail {
            "" => default_port,
            _ => match tail.strip_prefix(':') {
                Some(port) => parse_port(port).ok_or_else(|| NetError::invalid_address(text))?,
                None => return Err(NetError::invalid_address(text)),
            },
        };
        return Ok((host, port));
    }

    match text.matches(':').count() {
        0 => Ok((text, default_port)),
        1 => {
            let (host, port) = text.split_once(':').unwrap_or((text, ""));
            let port = parse_port(port).ok_or_else(|| NetError::invalid_address(text))?;
            if host.is_empty() {
                return Err(NetError::invalid_address(text));
            }
            Ok((host, port))
        }
        _ => Ok((text, default_port)),
    }
}

pub(crate) fn parse_port(text: &str) -> Option<u16> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Literal IPv4 or IPv6 (with optional numeric `%scope`) host.
pub(crate) fn parse_ip_literal(host: &str, port: u16) -> Option<NetAddress> {
    if let Ok(v4) = Ipv4Addr::from_str(host) {
        return Some(NetAddress::ipv4(v4.octets(), port));
    }
    let (address, scope_id) = match host.split_once('%') {
        Some((address, scope)) => (address, scope.parse::<u32>().ok()?),
        None => (host, 0),
    };
    let v6 = Ipv6Addr::from_str(address).ok()?;
    Some(NetAddress::ipv6(v6.octets(), scope_id, port))
}

fn format_ipv6(octets: &[u8; 16], scope_id: u32) -> String {
    let ip = Ipv6Addr::from(*octets);
    if scope_id != 0 {
        format!("{}%{}", ip, scope_id)
    } else {
        ip.to_string()
    }
}

fn websocket_scheme(text: &str) -> Option<Protocol> {
    let lower = text.get(..6).map(|p| p.to_ascii_lowercase());
    match lower.as_deref() {
        Some("wss://") => Some(Protocol::Wss),
        Some(p) if p.starts_with("ws://") => Some(Protocol::Ws),
        _ => None,
    }
}

/// Adds a `ws://`/`wss://` scheme when the caller gave a bare host.
pub(crate) fn websocket_url(address: &str, protocol: Protocol) -> Result<String, NetError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(NetError::invalid_address(address));
    }
    if address.contains("://") {
        return Ok(address.to_string());
    }
    let scheme = if protocol == Protocol::Wss { "wss" } else { "ws" };
    Ok(format!("{}://{}", scheme, address))
}

/// A netmask of the same family as the addresses it is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMask {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl AddressMask {
    /// Conventional CIDR mask: the top `bits` bits set. Bits beyond the
    /// family width are clamped.
    pub fn from_prefix(family: AddressFamily, bits: u32) -> Option<Self> {
        match family {
            AddressFamily::Ipv4 => {
                let bits = bits.min(32);
                let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
                Some(AddressMask::V4(mask.to_be_bytes()))
            }
            AddressFamily::Ipv6 => {
                let bits = bits.min(128);
                let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
                Some(AddressMask::V6(mask.to_be_bytes()))
            }
            _ => None,
        }
    }

    pub fn full(family: AddressFamily) -> Option<Self> {
        match family {
            AddressFamily::Ipv4 => Self::from_prefix(family, 32),
            AddressFamily::Ipv6 => Self::from_prefix(family, 128),
            _ => None,
        }
    }

    /// Prefix length when the mask is contiguous.
    pub fn prefix_len(&self) -> Option<u32> {
        let (ones, width, value) = match self {
            AddressMask::V4(m) => {
                let v = u32::from_be_bytes(*m);
                (v.count_ones(), 32, v as u128)
            }
            AddressMask::V6(m) => {
                let v = u128::from_be_bytes(*m);
                (v.count_ones(), 128, v)
            }
        };
        let expected = if ones == 0 {
            0
        } else {
            (u128::MAX >> (128 - width)) & !((1u128 << (width - ones)) - 1)
        };
        (value == expected).then_some(ones)
    }

    /// Compares only the host bits selected by the mask. Ports are ignored;
    /// addresses of another family than the mask never match.
    pub fn matches(&self, a: &NetAddress, b: &NetAddress) -> bool {
        match (self, &a.host, &b.host) {
            (AddressMask::V4(m), Host::V4(x), Host::V4(y)) => {
                (0..4).all(|i| x[i] & m[i] == y[i] & m[i])
            }
            (AddressMask::V6(m), Host::V6 { octets: x, .. }, Host::V6 { octets: y, .. }) => {
                (0..16).all(|i| x[i] & m[i] == y[i] & m[i])
            }
            _ => false,
        }
    }

    /// `addr` with every bit outside the mask cleared.
    pub fn apply(&self, addr: &NetAddress) -> NetAddress {
        let mut out = addr.clone();
        match (self, &mut out.host) {
            (AddressMask::V4(m), Host::V4(x)) => {
                for i in 0..4 {
                    x[i] &= m[i];
                }
            }
            (AddressMask::V6(m), Host::V6 { octets, .. }) => {
                for i in 0..16 {
                    octets[i] &= m[i];
                }
            }
            _ => {}
        }
        out
    }
}

/// Parses `a.b.c.d/nn`, `[v6]/nn` or a plain literal (full mask).
pub fn parse_masked(text: &str) -> Result<(NetAddress, AddressMask), NetError> {
    let text = text.trim();
    let (addr_text, bits) = match text.rsplit_once('/') {
        Some((addr, bits)) => {
            let bits: u32 = bits
                .parse()
                .map_err(|_| NetError::invalid_address(text))?;
            (addr, Some(bits))
        }
        None => (text, None),
    };
    let addr_text = addr_text
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(addr_text);
    let addr = parse_ip_literal(addr_text, 0).ok_or_else(|| NetError::invalid_address(text))?;
    let width = match addr.family() {
        AddressFamily::Ipv4 => 32,
        _ => 128,
    };
    if bits.is_some_and(|b| b > width) {
        return Err(NetError::invalid_address(text));
    }
    let mask = AddressMask::from_prefix(addr.family(), bits.unwrap_or(width))
        .ok_or_else(|| NetError::invalid_address(text))?;
    Ok((addr, mask))
}

/// `base/prefix` when the mask is a CIDR prefix, otherwise `base/mask`.
pub fn format_masked(addr: &NetAddress, mask: &AddressMask) -> String {
    let masked = mask.apply(addr);
    match mask.prefix_len() {
        Some(bits) => format!("{}/{}", masked.base_string(), bits),
        None => match mask {
            AddressMask::V4(m) => format!("{}/{}", masked.base_string(), Ipv4Addr::from(*m)),
            AddressMask::V6(m) => format!("{}/{}", masked.base_string(), Ipv6Addr::from(*m)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_quad_round_trip() {
        for text in ["0.0.0.0", "10.0.0.1", "192.168.1.254", "255.255.255.255", "8.8.8.8"] {
            let addr = NetAddress::parse_literal(text, 27500).unwrap();
            assert_eq!(addr.base_string(), text);
            assert_eq!(addr.port, 27500);
        }
    }

    #[test]
    fn test_rejects_bad_ipv4() {
        for text in ["256.0.0.1", "1.2.3", "1.2.3.4.5", "1..2.3", "a.b.c.d", "1.2.3.999"] {
            assert!(NetAddress::parse_literal(text, 0).is_err(), "{} accepted", text);
        }
    }

    #[test]
    fn test_host_port_split() {
        assert_eq!(split_host_port("1.2.3.4:99", 5).unwrap(), ("1.2.3.4", 99));
        assert_eq!(split_host_port("1.2.3.4", 5).unwrap(), ("1.2.3.4", 5));
        assert_eq!(split_host_port("[::1]:27500", 5).unwrap(), ("::1", 27500));
        assert_eq!(split_host_port("[fe80::1%3]", 5).unwrap(), ("fe80::1%3", 5));
        assert_eq!(split_host_port("fe80::1:27500", 5).unwrap(), ("fe80::1:27500", 5));
        assert!(split_host_port("host:notaport", 5).is_err());
        assert!(split_host_port("[::1", 5).is_err());
        assert!(split_host_port("[::1]x", 5).is_err());
    }

    #[test]
    fn test_parse_ipv6_forms() {
        let addr = NetAddress::parse_literal("[2001:db8::1]:26000", 0).unwrap();
        assert_eq!(addr.family(), AddressFamily::Ipv6);
        assert_eq!(addr.port, 26000);
        assert_eq!(addr.to_string(), "[2001:db8::1]:26000");

        let scoped = NetAddress::parse_literal("fe80::1%4", 1).unwrap();
        match scoped.host {
            Host::V6 { scope_id, .. } => assert_eq!(scope_id, 4),
            _ => panic!("expected ipv6"),
        }
        assert_eq!(scoped.base_string(), "fe80::1%4");
    }

    #[test]
    fn test_loopback_token() {
        let addr = NetAddress::parse_literal("loopback", 27500).unwrap();
        assert!(addr.is_loopback());
        assert_eq!(addr.to_string(), "loopback");
        assert!(addr.is_reliable());
    }

    #[test]
    fn test_websocket_literal() {
        let addr = NetAddress::parse_literal("wss://example.org/game", 0).unwrap();
        assert_eq!(addr.family(), AddressFamily::WebSocket);
        assert_eq!(addr.protocol, Protocol::Wss);
        assert_eq!(addr.port, 443);
        assert!(addr.is_encrypted());

        let bare = NetAddress::websocket("example.org:8080", Protocol::Ws).unwrap();
        assert_eq!(bare.to_string(), "ws://example.org:8080");
        assert_eq!(bare.port, 8080);
    }

    #[test]
    fn test_equality_rules() {
        let a = NetAddress::parse_literal("10.0.0.1:1", 0).unwrap();
        let b = NetAddress::parse_literal("10.0.0.1:2", 0).unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a.same_base(&b));

        assert_eq!(NetAddress::loopback(1), NetAddress::loopback(2));
        assert_ne!(NetAddress::loopback(0), NetAddress::ipv4([127, 0, 0, 1], 0));
        assert_eq!(NetAddress::invalid(), NetAddress::invalid());

        let v6 = NetAddress::parse_literal("::1", 1).unwrap();
        let v4 = NetAddress::parse_literal("127.0.0.1:1", 0).unwrap();
        assert_ne!(v6, v4);
        assert!(!v6.same_base(&v4));
    }

    #[test]
    fn test_equality_ignores_protocol() {
        let a = NetAddress::ipv4([1, 2, 3, 4], 5);
        let b = a.clone().with_protocol(Protocol::Stream);
        assert_eq!(a, b);
    }

    #[test]
    fn test_classify() {
        let scope = |s: &str| NetAddress::parse_literal(s, 0).unwrap().classify();
        assert_eq!(scope("10.0.0.1"), AddressScope::Lan);
        assert_eq!(scope("172.16.5.4"), AddressScope::Lan);
        assert_eq!(scope("172.32.0.1"), AddressScope::Net);
        assert_eq!(scope("192.168.0.1"), AddressScope::Lan);
        assert_eq!(scope("8.8.8.8"), AddressScope::Net);
        assert_eq!(scope("127.0.0.1"), AddressScope::Host);
        assert_eq!(scope("127.255.0.9"), AddressScope::Host);
        assert_eq!(scope("::1"), AddressScope::Host);
        assert_eq!(scope("fd00::1"), AddressScope::Lan);
        assert_eq!(scope("fe80::1"), AddressScope::LinkLocal);
        assert_eq!(scope("2001:db8::1"), AddressScope::Net);
        assert_eq!(NetAddress::loopback(99).classify(), AddressScope::Host);
        assert_eq!(NetAddress::invalid().classify(), AddressScope::Process);
        assert_eq!(AddressScope::LinkLocal.describe(), "link-local");
    }

    #[test]
    fn test_socket_addr_conversion() {
        let sa: SocketAddr = "[::ffff:10.1.2.3]:4000".parse().unwrap();
        let addr = NetAddress::from(sa);
        assert_eq!(addr, NetAddress::ipv4([10, 1, 2, 3], 4000));

        let back = NetAddress::loopback(27500).to_socket_addr().unwrap();
        assert_eq!(back, "127.0.0.1:27500".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_prefix_masks() {
        let mask = AddressMask::from_prefix(AddressFamily::Ipv4, 8).unwrap();
        assert_eq!(mask, AddressMask::V4([255, 0, 0, 0]));
        assert_eq!(mask.prefix_len(), Some(8));
        assert_eq!(
            AddressMask::from_prefix(AddressFamily::Ipv4, 0).unwrap(),
            AddressMask::V4([0; 4])
        );
        assert_eq!(
            AddressMask::from_prefix(AddressFamily::Ipv4, 20).unwrap(),
            AddressMask::V4([255, 255, 240, 0])
        );
        let v6 = AddressMask::from_prefix(AddressFamily::Ipv6, 10).unwrap();
        match v6 {
            AddressMask::V6(m) => {
                assert_eq!(m[0], 0xff);
                assert_eq!(m[1], 0xc0);
                assert_eq!(m[2], 0);
            }
            _ => panic!("expected v6 mask"),
        }
        assert!(AddressMask::from_prefix(AddressFamily::Loopback, 8).is_none());
        assert_eq!(AddressMask::V4([255, 0, 255, 0]).prefix_len(), None);
    }

    #[test]
    fn test_masked_compare() {
        let (net, mask) = parse_masked("10.0.0.0/8").unwrap();
        let inside = NetAddress::parse_literal("10.200.1.1:5", 0).unwrap();
        let outside = NetAddress::parse_literal("11.0.0.1", 0).unwrap();
        assert!(mask.matches(&net, &inside));
        assert!(!mask.matches(&net, &outside));
        assert_eq!(format_masked(&inside, &mask), "10.0.0.0/8");

        let (net6, mask6) = parse_masked("[fe80::]/10").unwrap();
        let link = NetAddress::parse_literal("fe80::1234", 0).unwrap();
        assert!(mask6.matches(&net6, &link));
        assert!(!mask6.matches(&net6, &inside));

        assert!(parse_masked("10.0.0.0/33").is_err());
    }
}
