//! USC controller binary.
//!
//! Accepts call-home channels from devices, dials devices given on the
//! command line, and forwards local TCP ports onto device sessions. Channel
//! and session events are logged and tracked as per-device alarms.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use usc_monitor::{AlarmTracker, EventDispatcher, LoggingListener, TransportType};
use usc_session::{listen_tcp, serve_forward, ChannelManager, PlainHandler, SecureHandlerFactory};

mod config;
mod logging;

use config::UscConfig;

#[cfg(feature = "tls")]
use usc_session::RustlsHandler;

/// Unified secure channel controller
#[derive(Parser, Debug)]
#[command(name = "usc", version, about = "Multiplexes device sessions over secure channels")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "usc.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Call-home listen port, overrides the configuration
    #[arg(long)]
    plugin_port: Option<u16>,

    /// Do not accept call-home connections
    #[arg(long)]
    no_call_home: bool,

    /// Transport for dialled channels: tcp, udp, tls, dtls
    #[arg(long)]
    transport: Option<TransportType>,

    /// Device to dial, `ip` or `ip:port` (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Forward a local port to a device port, `LISTEN=DEVICE/PORT`,
    /// e.g. `127.0.0.1:8830=10.0.0.5/830` (repeatable)
    #[arg(long)]
    forward: Vec<ForwardRule>,

    /// Server name for TLS SNI on dialled channels
    #[arg(long)]
    tls_sni: Option<String>,
}

/// One `--forward` rule
#[derive(Debug, Clone, PartialEq, Eq)]
struct ForwardRule {
    listen: SocketAddr,
    device: String,
    port: u16,
}

impl FromStr for ForwardRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (listen, target) = s
            .split_once('=')
            .ok_or_else(|| format!("expected LISTEN=DEVICE/PORT, got {:?}", s))?;
        let (device, port) = target
            .rsplit_once('/')
            .ok_or_else(|| format!("expected DEVICE/PORT, got {:?}", target))?;

        Ok(Self {
            listen: listen
                .parse()
                .map_err(|e| format!("invalid listen address {:?}: {}", listen, e))?,
            device: device.to_string(),
            port: port
                .parse()
                .map_err(|e| format!("invalid port {:?}: {}", port, e))?,
        })
    }
}

/// Parse `ip` or `ip:port`, filling in the agent port
fn device_addr(device: &str, agent_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = device.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = device
        .parse()
        .with_context(|| format!("Invalid device address {:?}", device))?;
    Ok(SocketAddr::new(ip, agent_port))
}

fn build_handler(config: &UscConfig, sni: Option<String>) -> Result<Arc<dyn SecureHandlerFactory>> {
    if !config.security.enabled {
        return Ok(Arc::new(PlainHandler));
    }

    #[cfg(feature = "tls")]
    {
        let security = &config.security;
        let handler = RustlsHandler::from_pem_files(
            &security.resolve(&security.cert_file),
            &security.resolve(&security.key_file),
            &security.resolve(&security.ca_file),
            sni,
        )
        .context("Failed to configure TLS")?;
        Ok(Arc::new(handler))
    }

    #[cfg(not(feature = "tls"))]
    {
        let _ = sni;
        anyhow::bail!("security is enabled but usc was built without the `tls` feature")
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(&args.log_level)?;

    info!("Starting USC v{}", env!("CARGO_PKG_VERSION"));

    let config = UscConfig::load_from_file(&args.config)?;
    let plugin_port = args.plugin_port.unwrap_or(config.plugin_port);
    let transport = args.transport.unwrap_or(if config.security.enabled {
        TransportType::Tls
    } else {
        TransportType::Tcp
    });

    // Event pipeline
    let events = Arc::new(EventDispatcher::new(config.max_thread_number));
    events.add_listener(Arc::new(LoggingListener::new(config.log_error_events)));
    let alarms = Arc::new(AlarmTracker::new(config.max_error_number, config.error_window));
    events.add_listener(alarms.clone());

    let handler = build_handler(&config, args.tls_sni.clone())?;
    let manager = ChannelManager::new(config.manager(), handler, events.clone(), None);

    if !args.no_call_home {
        let call_home_transport = if config.security.enabled {
            TransportType::Tls
        } else {
            TransportType::Tcp
        };
        let listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), plugin_port);
        let listener = listen_tcp(listen_addr)
            .await
            .with_context(|| format!("Failed to listen on {}", listen_addr))?;

        let acceptor = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = acceptor.accept_call_home(listener, call_home_transport).await {
                error!("Call-home listener failed: {}", e);
            }
        });
    }

    for device in &args.connect {
        let addr = device_addr(device, config.agent_port)?;
        let manager = manager.clone();
        tokio::spawn(async move {
            match manager.connect(addr, transport).await {
                Ok(channel) => info!("Channel to {} established", channel.device_id()),
                Err(e) => error!("Failed to connect to {}: {}", addr, e),
            }
        });
    }

    for rule in &args.forward {
        let addr = device_addr(&rule.device, config.agent_port)?;
        let listener = TcpListener::bind(rule.listen)
            .await
            .with_context(|| format!("Failed to listen on {}", rule.listen))?;
        let manager = manager.clone();
        let port = rule.port;
        tokio::spawn(async move {
            // Serve on whichever channel is current until the manager shuts down
            loop {
                let channel = match manager.connect(addr, transport).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        info!("Forwarding to {} stopped: {}", addr, e);
                        return;
                    }
                };
                serve_forward(channel, port, &listener).await;
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    manager.close_all();
    events.shutdown().await;

    for device in alarms.devices().await {
        let count = alarms.error_count(&device).await;
        if count > 0 {
            warn!("Device {} reported {} errors in the last window", device, count);
        }
    }

    info!("USC shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forward_rule() {
        let rule: ForwardRule = "127.0.0.1:8830=10.0.0.5/830".parse().unwrap();
        assert_eq!(rule.listen, "127.0.0.1:8830".parse().unwrap());
        assert_eq!(rule.device, "10.0.0.5");
        assert_eq!(rule.port, 830);

        let rule: ForwardRule = "[::1]:2222=[fe80::1]:1069/22".parse().unwrap();
        assert_eq!(rule.device, "[fe80::1]:1069");
        assert_eq!(rule.port, 22);

        assert!("127.0.0.1:8830".parse::<ForwardRule>().is_err());
        assert!("127.0.0.1:8830=10.0.0.5".parse::<ForwardRule>().is_err());
        assert!("127.0.0.1:8830=10.0.0.5/ssh".parse::<ForwardRule>().is_err());
    }

    #[test]
    fn test_device_addr_defaults_agent_port() {
        assert_eq!(
            device_addr("10.0.0.5", 1069).unwrap(),
            "10.0.0.5:1069".parse().unwrap()
        );
        assert_eq!(
            device_addr("10.0.0.5:4000", 1069).unwrap(),
            "10.0.0.5:4000".parse().unwrap()
        );
        assert!(device_addr("router-1", 1069).is_err());
    }

    #[test]
    fn test_plain_handler_without_security() {
        assert!(build_handler(&UscConfig::default(), None).is_ok());
    }
}
