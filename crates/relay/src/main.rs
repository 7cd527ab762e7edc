mod config;
mod relay;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use netplex::{AddressFamily, NetConfig, NetContext, Protocol};

use config::RelayConfig;
use relay::Relay;

#[derive(Parser)]
#[command(name = "netplex-relay")]
#[command(about = "Headless packet relay and ping tool")]
struct Args {
    #[arg(short, long, default_value_t = netplex::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(long, help = "Ping this address instead of relaying")]
    ping: Option<String>,

    #[arg(short, long, default_value_t = 4, help = "Number of probes in ping mode")]
    count: u32,

    #[arg(long, help = "Also connect a websocket uplink (ws:// or wss:// URL)")]
    websocket: Option<String>,

    #[arg(long, default_value_t = 0, help = "Stop after this many seconds (0 runs forever)")]
    duration: u64,

    #[arg(long, default_value_t = 5, help = "Seconds between traffic reports")]
    report_interval: u64,

    #[arg(long, default_value_t = 0.0, help = "Simulated packet loss fraction (0-1)")]
    fake_loss: f32,

    #[arg(
        long,
        default_value_t = 0,
        allow_hyphen_values = true,
        help = "Simulated MTU; negative values drop oversized packets silently"
    )]
    fake_mtu: i32,

    #[arg(long, help = "Do not resolve hostnames to IPv4 addresses")]
    no_dns_ipv4: bool,

    #[arg(long, help = "Do not resolve hostnames to IPv6 addresses")]
    no_dns_ipv6: bool,

    #[arg(long, default_value_t = 2)]
    io_threads: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = RelayConfig {
        tick_rate: args.tick_rate,
        report_interval: Duration::from_secs(args.report_interval.max(1)),
        run_for: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
        net: NetConfig {
            fake_loss: args.fake_loss.clamp(0.0, 1.0),
            fake_mtu: args.fake_mtu,
            dns_ipv4: !args.no_dns_ipv4,
            dns_ipv6: !args.no_dns_ipv6,
            io_threads: args.io_threads,
            ..Default::default()
        },
    };

    let ctx = NetContext::new(config.net.clone())?;
    log::info!("Local address: {}", ctx.local_address());

    let mut relay = match &args.ping {
        Some(target) => {
            let target = ctx
                .string_to_address(target, netplex::DEFAULT_PORT)
                .with_context(|| format!("Bad ping target {}", target))?;
            Relay::client(&ctx, config, 0, target, args.count)?
        }
        None => Relay::server(&ctx, config, args.port),
    };

    if let Some(url) = &args.websocket {
        let protocol = if url.starts_with("wss://") { Protocol::Wss } else { Protocol::Ws };
        relay
            .sockets_mut()
            .add("WebSocket", url, AddressFamily::WebSocket, protocol)
            .with_context(|| format!("Failed to connect websocket uplink {}", url))?;
    }

    relay.run();
    log::info!("Relay shutting down");
    Ok(())
}
