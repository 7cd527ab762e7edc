use std::time::Duration;

use crate::error::SendStatus;

const DEFAULT_TIMEOUT_SECS: u64 = 65;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub enabled: bool,
    /// Fraction of packets (0..1) thrown away on both receive and send.
    pub fake_loss: f32,
    /// 0 disables. Positive: larger sends fail with `MtuExceeded`.
    /// Negative: larger sends vanish as if lost on the wire.
    pub fake_mtu: i32,
    pub dns_ipv4: bool,
    pub dns_ipv6: bool,
    /// Idle timeout for higher layers; nothing here enforces it.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub io_threads: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fake_loss: 0.0,
            fake_mtu: 0,
            dns_ipv4: true,
            dns_ipv6: true,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            io_threads: 2,
        }
    }
}

impl NetConfig {
    /// Verdict of the fake MTU for a payload of `len` bytes, or `None` when
    /// the payload may go out.
    pub fn mtu_verdict(&self, len: usize) -> Option<SendStatus> {
        if self.fake_mtu == 0 {
            return None;
        }
        let limit = self.fake_mtu.unsigned_abs() as usize;
        if len <= limit {
            return None;
        }
        if self.fake_mtu > 0 {
            Some(SendStatus::MtuExceeded)
        } else {
            Some(SendStatus::Sent)
        }
    }

    pub fn should_drop(&self) -> bool {
        if self.fake_loss <= 0.0 {
            return false;
        }
        rand_percent() < self.fake_loss.min(1.0)
    }

    pub fn dns_enabled(&self) -> bool {
        self.dns_ipv4 || self.dns_ipv6
    }
}

/// Uniform-ish value in `[0, 1)`; good enough for loss simulation.
pub fn rand_percent() -> f32 {
    (rand_u64() % 10000) as f32 / 10000.0
}

fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default(),
    );
    hasher.finish()
}
