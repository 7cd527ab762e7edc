use std::time::Duration;

use netplex::NetConfig;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub tick_rate: u32,
    pub report_interval: Duration,
    /// Stop after this long; `None` runs until killed.
    pub run_for: Option<Duration>,
    pub net: NetConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            report_interval: Duration::from_secs(5),
            run_for: None,
            net: NetConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}
