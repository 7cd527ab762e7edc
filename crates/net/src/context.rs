use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;

use crate::address::{self, AddressFamily, LOOPBACK_TOKEN, NetAddress};
use crate::config::NetConfig;
use crate::error::{NetError, SendStatus};
use crate::loopback::LoopbackHub;
use crate::stream::StreamTable;

/// Hostname lookup, kept behind a trait so tests and embedders can swap it.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, NetError>;
}

#[derive(Debug, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, NetError> {
        (host, port)
            .to_socket_addrs()
            .map(|addrs| addrs.collect())
            .map_err(|_| NetError::Resolve(host.to_string()))
    }
}

/// Everything process-wide the networking layer needs, owned in one place.
pub struct NetContext {
    config: RwLock<NetConfig>,
    runtime: Runtime,
    loopback: LoopbackHub,
    streams: StreamTable,
    resolver: Box<dyn Resolver>,
}

impl NetContext {
    pub fn new(config: NetConfig) -> Result<Arc<Self>, NetError> {
        Self::with_resolver(config, Box::new(SystemResolver))
    }

    pub fn with_resolver(config: NetConfig, resolver: Box<dyn Resolver>) -> Result<Arc<Self>, NetError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("net-io")
            .enable_all()
            .build()
            .map_err(|e| NetError::Runtime(e.to_string()))?;

        log::info!(
            "Networking initialized ({} io threads, enabled: {})",
            config.io_threads.max(1),
            config.enabled
        );

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            runtime,
            loopback: LoopbackHub::new(),
            streams: StreamTable::new(),
            resolver,
        }))
    }

    pub fn config(&self) -> NetConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, update: impl FnOnce(&mut NetConfig)) {
        update(&mut self.config.write());
    }

    pub fn enabled(&self) -> bool {
        self.config.read().enabled
    }

    pub fn mtu_verdict(&self, len: usize) -> Option<SendStatus> {
        self.config.read().mtu_verdict(len)
    }

    pub fn should_drop(&self) -> bool {
        self.config.read().should_drop()
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Gives `task` up to `grace` to finish on its own, then aborts it and
    /// waits until it is gone so everything it owned has been dropped.
    /// From inside the runtime this can only abort.
    pub(crate) fn join_task(&self, task: &mut JoinHandle<()>, grace: Duration) {
        if Handle::try_current().is_ok() {
            task.abort();
            return;
        }
        self.runtime.block_on(async {
            if !grace.is_zero() && tokio::time::timeout(grace, &mut *task).await.is_ok() {
                return;
            }
            task.abort();
            let _ = (&mut *task).await;
        });
    }

    pub(crate) fn loopback(&self) -> &LoopbackHub {
        &self.loopback
    }

    pub(crate) fn streams(&self) -> &StreamTable {
        &self.streams
    }

    /// First address `text` names, falling back to the resolver for
    /// hostnames.
    pub fn string_to_address(&self, text: &str, default_port: u16) -> Result<NetAddress, NetError> {
        self.string_to_addresses(text, default_port, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| NetError::Resolve(text.to_string()))
    }

    /// Up to `max` addresses for `text`. Literals never reach the resolver;
    /// resolved results are filtered by the per-family DNS switches.
    pub fn string_to_addresses(
        &self,
        text: &str,
        default_port: u16,
        max: usize,
    ) -> Result<Vec<NetAddress>, NetError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let trimmed = text.trim();
        if trimmed == LOOPBACK_TOKEN {
            return Ok(vec![NetAddress::loopback(default_port)]);
        }
        if let Ok(literal) = NetAddress::parse_literal(trimmed, default_port) {
            return Ok(vec![literal]);
        }

        let (host, port) = address::split_host_port(trimmed, default_port)?;
        if host.contains(':') {
            // Unbracketed multi-colon text is only ever an IPv6 literal.
            return Err(NetError::invalid_address(text));
        }

        let (dns_ipv4, dns_ipv6) = {
            let config = self.config.read();
            if !config.dns_enabled() {
                return Err(NetError::Resolve(host.to_string()));
            }
            (config.dns_ipv4, config.dns_ipv6)
        };

        let resolved = self.resolver.resolve(host, port)?;
        let addresses: Vec<NetAddress> = resolved
            .into_iter()
            .map(NetAddress::from)
            .filter(|a| match a.family() {
                AddressFamily::Ipv4 => dns_ipv4,
                AddressFamily::Ipv6 => dns_ipv6,
                _ => false,
            })
            .map(|mut a| {
                a.port = port;
                a
            })
            .take(max)
            .collect();

        if addresses.is_empty() {
            log::debug!("No usable addresses for {}", host);
            return Err(NetError::Resolve(host.to_string()));
        }
        Ok(addresses)
    }

    /// The address this host would use to reach the internet. No packet is
    /// sent; connecting a UDP socket only selects a route.
    pub fn local_address(&self) -> NetAddress {
        let probes: [(&str, &str); 2] = [("0.0.0.0:0", "192.0.2.1:9"), ("[::]:0", "[2001:db8::1]:9")];
        for (bind, target) in probes {
            let Ok(socket) = UdpSocket::bind(bind) else {
                continue;
            };
            if socket.connect(target).is_err() {
                continue;
            }
            if let Ok(local) = socket.local_addr() {
                let unspecified = match local.ip() {
                    IpAddr::V4(ip) => ip.is_unspecified(),
                    IpAddr::V6(ip) => ip.is_unspecified(),
                };
                if !unspecified {
                    let mut addr = NetAddress::from(local);
                    addr.port = 0;
                    return addr;
                }
            }
        }
        NetAddress::loopback(0)
    }
}
