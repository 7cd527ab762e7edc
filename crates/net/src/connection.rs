use bitflags::bitflags;

use crate::address::{AddressFamily, NetAddress, Protocol};
use crate::error::SendStatus;

/// Largest packet the receive buffer of a collection accepts.
pub const MAX_OVERALL_MSGLEN: usize = 65536;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AddressFlags: u32 {
        const RELIABLE = 1 << 0;
        const ENCRYPTED = 1 << 1;
        /// Bound to the wildcard address rather than one interface.
        const WILDCARD = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct LocalAddress {
    pub flags: AddressFlags,
    pub address: NetAddress,
    /// Transport specific extra, e.g. the URL of a websocket.
    pub params: Option<String>,
}

/// State every transport carries regardless of kind.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub name: String,
    /// 1-based index into the owning collection, 0 until inserted.
    pub slot: usize,
    pub listening: bool,
    pub protocol: Protocol,
    pub families: [AddressFamily; 2],
}

impl ConnectionInfo {
    pub fn new(name: impl Into<String>, listening: bool, protocol: Protocol, family: AddressFamily) -> Self {
        Self {
            name: name.into(),
            slot: 0,
            listening,
            protocol,
            families: [family, AddressFamily::Invalid],
        }
    }

    pub fn accepts(&self, family: AddressFamily) -> bool {
        family != AddressFamily::Invalid && self.families.contains(&family)
    }
}

/// One transport-specific channel owned by a `ConnectionCollection`.
///
/// Implementations must never block in `get_packet`. `close` runs exactly
/// once, after which the connection no longer exists; any asynchronous
/// receive machinery has to be stopped before shared state is released.
pub trait Connection: Send {
    fn info(&self) -> &ConnectionInfo;

    fn info_mut(&mut self) -> &mut ConnectionInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    /// Moves the oldest pending packet into `buffer`. Returns false when
    /// nothing is pending or the packet could not be delivered.
    fn get_packet(&mut self, buffer: &mut PacketBuffer) -> bool;

    fn send_packet(&mut self, data: &[u8], to: &NetAddress) -> SendStatus;

    /// Locally bound endpoints, at most `max`. Empty when the connection
    /// cannot currently tell.
    fn local_addresses(&self, max: usize) -> Vec<LocalAddress>;

    fn close(self: Box<Self>);
}

/// Receive scratch buffer handed to the packet handler. Valid until the next
/// successful `load`.
#[derive(Debug)]
pub struct PacketBuffer {
    data: Box<[u8]>,
    len: usize,
    from: NetAddress,
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_OVERALL_MSGLEN)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            from: NetAddress::invalid(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Copies `payload` in whole or not at all.
    pub fn load(&mut self, payload: &[u8], from: NetAddress) -> bool {
        if payload.len() > self.data.len() {
            return false;
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.len = payload.len();
        self.from = from;
        true
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn from(&self) -> &NetAddress {
        &self.from
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.from = NetAddress::invalid();
    }
}
