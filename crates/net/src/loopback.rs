use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::{AddressFamily, NetAddress, Protocol};
use crate::connection::{AddressFlags, Connection, ConnectionInfo, LocalAddress, MAX_OVERALL_MSGLEN, PacketBuffer};
use crate::context::NetContext;
use crate::error::{NetError, SendStatus};

/// Ring slots per side. Must stay a power of two.
pub const MAX_LOOPBACK: usize = 64;

#[derive(Debug, Default)]
struct LoopMessage {
    data: Vec<u8>,
    len: usize,
}

#[derive(Debug)]
struct LoopbackSide {
    inited: bool,
    msgs: Vec<LoopMessage>,
    get: u64,
    send: u64,
}

impl LoopbackSide {
    fn new() -> Self {
        Self {
            inited: false,
            msgs: (0..MAX_LOOPBACK).map(|_| LoopMessage::default()).collect(),
            get: 0,
            send: 0,
        }
    }

    fn reset(&mut self) {
        self.get = 0;
        self.send = 0;
        for msg in &mut self.msgs {
            *msg = LoopMessage::default();
        }
    }

    fn push(&mut self, data: &[u8]) {
        let msg = &mut self.msgs[(self.send as usize) & (MAX_LOOPBACK - 1)];
        if data.len() > msg.data.len() {
            let grown = data.len().max(msg.data.len() * 2);
            msg.data = vec![0u8; grown];
        }
        msg.data[..data.len()].copy_from_slice(data);
        msg.len = data.len();
        self.send += 1;
    }

    fn pop(&mut self, buffer: &mut PacketBuffer) -> bool {
        // A lapped reader loses the oldest messages.
        if self.send - self.get > MAX_LOOPBACK as u64 {
            self.get = self.send - MAX_LOOPBACK as u64;
        }
        if self.get >= self.send {
            return false;
        }

        let msg = &mut self.msgs[(self.get as usize) & (MAX_LOOPBACK - 1)];
        if !buffer.load(&msg.data[..msg.len], NetAddress::loopback(0)) {
            return false;
        }
        msg.len = 0;
        self.get += 1;
        true
    }
}

/// The two loopback sides. Side 0 and side 1 each read their own ring and
/// write into the other one.
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    sides: Arc<Mutex<[LoopbackSide; 2]>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            sides: Arc::new(Mutex::new([LoopbackSide::new(), LoopbackSide::new()])),
        }
    }

    fn claim(&self) -> Option<usize> {
        let mut sides = self.sides.lock();
        let sock = sides.iter().position(|s| !s.inited)?;
        sides[sock].inited = true;
        sides[sock].reset();
        Some(sock)
    }

    fn release(&self, sock: usize) {
        let mut sides = self.sides.lock();
        let side = &mut sides[sock & 1];
        side.inited = false;
        side.reset();
    }

    /// Writes into the opposite side's ring.
    pub fn send(&self, sock: usize, data: &[u8]) -> SendStatus {
        if data.len() > MAX_OVERALL_MSGLEN {
            return SendStatus::MtuExceeded;
        }
        let mut sides = self.sides.lock();
        let peer = &mut sides[(sock & 1) ^ 1];
        if !peer.inited {
            return SendStatus::NoRoute;
        }
        if data.is_empty() {
            return SendStatus::Sent;
        }
        peer.push(data);
        SendStatus::Sent
    }

    /// Reads the oldest message from this side's own ring.
    pub fn receive(&self, sock: usize, buffer: &mut PacketBuffer) -> bool {
        self.sides.lock()[sock & 1].pop(buffer)
    }

    pub fn pending(&self, sock: usize) -> usize {
        let sides = self.sides.lock();
        let side = &sides[sock & 1];
        (side.send - side.get).min(MAX_LOOPBACK as u64) as usize
    }
}

pub struct LoopbackConnection {
    info: ConnectionInfo,
    ctx: Arc<NetContext>,
    sock: usize,
}

impl LoopbackConnection {
    /// Claims the first free side of the context's hub.
    pub fn establish(ctx: &Arc<NetContext>, name: &str, listening: bool) -> Result<Self, NetError> {
        let sock = ctx.loopback().claim().ok_or(NetError::NoLoopbackSide)?;
        log::debug!("{} claimed loopback side {}", name, sock);
        Ok(Self {
            info: ConnectionInfo::new(name, listening, Protocol::Datagram, AddressFamily::Loopback),
            ctx: Arc::clone(ctx),
            sock,
        })
    }

    pub fn side(&self) -> usize {
        self.sock
    }
}

impl Connection for LoopbackConnection {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ConnectionInfo {
        &mut self.info
    }

    fn get_packet(&mut self, buffer: &mut PacketBuffer) -> bool {
        self.ctx.loopback().receive(self.sock, buffer)
    }

    fn send_packet(&mut self, data: &[u8], to: &NetAddress) -> SendStatus {
        if !to.is_loopback() {
            return SendStatus::NoRoute;
        }
        if let Some(verdict) = self.ctx.mtu_verdict(data.len()) {
            return verdict;
        }
        self.ctx.loopback().send(self.sock, data)
    }

    fn local_addresses(&self, max: usize) -> Vec<LocalAddress> {
        if max == 0 {
            return Vec::new();
        }
        vec![LocalAddress {
            flags: AddressFlags::RELIABLE,
            address: NetAddress::loopback(self.sock as u16 + 1),
            params: None,
        }]
    }

    fn close(self: Box<Self>) {
        log::debug!("{} released loopback side {}", self.info.name, self.sock);
        self.ctx.loopback().release(self.sock);
    }
}
