use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use netplex::{ConnectionCollection, Inbound, NetAddress, NetContext, SendStatus};

use crate::config::RelayConfig;

type Inbox = Arc<Mutex<Vec<(Vec<u8>, NetAddress)>>>;

fn inbox_handler(inbox: &Inbox) -> impl FnMut(Inbound<'_>) + Send + 'static {
    let inbox = Arc::clone(inbox);
    move |packet: Inbound<'_>| {
        log::trace!(
            "{} bytes from {} on {} (slot {})",
            packet.data.len(),
            packet.from,
            packet.connection,
            packet.slot
        );
        inbox.lock().push((packet.data.to_vec(), packet.from.clone()));
    }
}

/// What the relay does with the packets it receives.
pub enum Mode {
    /// Send every packet straight back to where it came from.
    Echo,
    /// Send numbered probes to `target` and log the round trip of each echo.
    Ping { target: NetAddress, count: u32 },
}

pub struct Relay {
    config: RelayConfig,
    sockets: ConnectionCollection,
    inbox: Inbox,
    mode: Mode,
    running: bool,
    started: Instant,
    last_report: Instant,
    next_ping: Instant,
    ping_seq: u32,
    in_flight: HashMap<u32, Instant>,
}

impl Relay {
    pub fn server(ctx: &Arc<NetContext>, config: RelayConfig, port: u16) -> Self {
        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sockets = netplex::init_server(ctx, inbox_handler(&inbox), port);
        Self::with_sockets(config, sockets, inbox, Mode::Echo)
    }

    pub fn client(ctx: &Arc<NetContext>, config: RelayConfig, port: u16, target: NetAddress, count: u32) -> Result<Self> {
        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let client = netplex::init_client(ctx, inbox_handler(&inbox), target.is_loopback(), port)
            .context("Failed to open client sockets")?;
        if let Some(local) = &client.local_address {
            log::info!("Client address {}", local);
        }
        Ok(Self::with_sockets(config, client.sockets, inbox, Mode::Ping { target, count }))
    }

    fn with_sockets(config: RelayConfig, sockets: ConnectionCollection, inbox: Inbox, mode: Mode) -> Self {
        let now = Instant::now();
        Self {
            config,
            sockets,
            inbox,
            mode,
            running: true,
            started: now,
            last_report: now,
            next_ping: now,
            ping_seq: 0,
            in_flight: HashMap::new(),
        }
    }

    pub fn sockets_mut(&mut self) -> &mut ConnectionCollection {
        &mut self.sockets
    }

    pub fn run(&mut self) {
        for line in self.sockets.status_report() {
            log::info!("{}", line);
        }

        let tick = self.config.tick_duration();
        while self.running {
            self.tick_once();
            if self.config.run_for.is_some_and(|limit| self.started.elapsed() >= limit) {
                self.running = false;
            }
            std::thread::sleep(tick);
        }
        self.report();
    }

    pub fn tick_once(&mut self) {
        self.sockets.read_packets();
        let packets = std::mem::take(&mut *self.inbox.lock());
        for (data, from) in packets {
            self.handle_packet(data, from);
        }

        if matches!(self.mode, Mode::Ping { .. }) {
            self.send_ping();
        }

        self.sockets.tick();
        if self.last_report.elapsed() >= self.config.report_interval {
            self.report();
            self.last_report = Instant::now();
        }
    }

    fn handle_packet(&mut self, data: Vec<u8>, from: NetAddress) {
        match self.mode {
            Mode::Echo => {
                let status = self.sockets.send_packet(&data, &from);
                if status != SendStatus::Sent {
                    log::debug!("Echo to {} failed: {}", from, status.as_str());
                }
            }
            Mode::Ping { .. } => {
                let Some(seq) = data.get(..4).and_then(|b| b.try_into().ok()).map(u32::from_le_bytes) else {
                    log::debug!("Ignoring {} byte packet from {}", data.len(), from);
                    return;
                };
                match self.in_flight.remove(&seq) {
                    Some(sent) => log::info!(
                        "Reply {} from {}: {:.2} ms",
                        seq,
                        from,
                        sent.elapsed().as_secs_f64() * 1000.0
                    ),
                    None => log::debug!("Unexpected reply {} from {}", seq, from),
                }
            }
        }
    }

    fn send_ping(&mut self) {
        let Mode::Ping { target, count } = &self.mode else {
            return;
        };
        let now = Instant::now();
        if now < self.next_ping {
            return;
        }
        if self.ping_seq >= *count {
            // Give the last probe a second to come back.
            if now >= self.next_ping + Duration::from_secs(1) || self.in_flight.is_empty() {
                self.running = false;
            }
            return;
        }

        let seq = self.ping_seq;
        self.ping_seq += 1;
        self.next_ping = now + Duration::from_secs(1);

        let status = self.sockets.send_packet(&seq.to_le_bytes(), target);
        match status {
            SendStatus::Sent => {
                self.in_flight.insert(seq, now);
            }
            other => log::warn!("Probe {} to {} failed: {}", seq, target, other.as_str()),
        }
    }

    fn report(&self) {
        let rates = self.sockets.rates();
        let totals = self.sockets.totals();
        log::info!(
            "in {:.1} pkt/s {:.0} B/s, out {:.1} pkt/s {:.0} B/s (total {} in, {} out)",
            rates.packets_in,
            rates.bytes_in,
            rates.packets_out,
            rates.bytes_out,
            totals.packets_in,
            totals.packets_out
        );
        if let Mode::Ping { .. } = self.mode {
            let answered = self.ping_seq as usize - self.in_flight.len();
            log::info!("{} of {} probes answered", answered, self.ping_seq);
        }
    }
}
