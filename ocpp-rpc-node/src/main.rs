//! OCPP RPC Node - charge point CLI
//!
//! Connects to a CSMS over OCPP-J, registers with BootNotification, keeps
//! the connection alive with Heartbeat and answers CSMS operations.
//!
//! # Usage
//!
//! ```bash
//! # OCPP 1.6 against a local SteVe
//! ocpp-rpc-node --station CS001
//!
//! # OCPP 2.0.1 against another CSMS
//! ocpp-rpc-node --station CS001 --protocol 2.0.1 \
//!     --csms-url ws://csms.example.com/ocpp
//! ```

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ocpp_rpc::messages::{v16, v201};
use ocpp_rpc::{ws, ChannelTransport, ChargeBoxId, Endpoint, EndpointConfig, ProtocolVersion};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::handlers::StationState;

/// OCPP-J charge point node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Charge box identity
    #[arg(short, long, default_value = "EK3-001")]
    station: ChargeBoxId,

    /// CSMS WebSocket URL, the station id is appended
    #[arg(long, default_value = "ws://localhost:8180/steve/websocket/CentralSystemService")]
    csms_url: String,

    /// OCPP version (1.6, 2.0.1, 2.1)
    #[arg(short, long, default_value = "1.6")]
    protocol: ProtocolVersion,

    /// Seconds to wait for each response
    #[arg(long, default_value = "10")]
    request_timeout_secs: u64,

    /// Number of connectors / EVSEs
    #[arg(long, default_value = "1")]
    connectors: u32,

    /// Vendor name
    #[arg(long, default_value = "Elektrokombinacija")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "EK3-OCPP")]
    model: String,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// First reconnect delay in seconds
    #[arg(long, default_value = "1")]
    reconnect_delay_secs: u64,

    /// Upper bound of the reconnect backoff in seconds
    #[arg(long, default_value = "60")]
    max_reconnect_delay_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP RPC Node - Charge Point                    ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Station:  {:<50} ║", args.station);
    println!("║  Protocol: {:<50} ║", args.protocol.subprotocol());
    println!("║  CSMS URL: {:<50} ║", truncate(&args.csms_url, 50));
    println!("║  EVSEs:    {:<50} ║", args.connectors);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let state = Arc::new(StationState::new(Duration::from_secs(300), args.connectors));
    let max_delay = Duration::from_secs(args.max_reconnect_delay_secs.max(1));
    let mut delay = Duration::from_secs(args.reconnect_delay_secs.max(1));

    loop {
        tokio::select! {
            result = session(&args, state.clone()) => match result {
                Ok(true) => {
                    info!("Session ended");
                    delay = Duration::from_secs(args.reconnect_delay_secs.max(1));
                }
                Ok(false) => warn!("Session ended before registration"),
                Err(e) => error!("Session failed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }

        info!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
        delay = (delay * 2).min(max_delay);
    }
}

/// One connection lifetime. Returns whether the CSMS accepted the station.
async fn session(
    args: &Args,
    state: Arc<StationState>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let (stream, _) = ws::connect(&args.csms_url, &args.station, args.protocol).await?;

    let config = EndpointConfig::new(args.station.clone())
        .with_protocol(args.protocol)
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs.max(1)));
    let (transport, outbound) = ChannelTransport::new();
    let endpoint = Endpoint::new(config, transport);

    if args.protocol.is_v2() {
        handlers::register_v201(&endpoint, state.clone())?;
    } else {
        handlers::register_v16(&endpoint, state.clone())?;
    }

    let pump = tokio::spawn(ws::run(endpoint.clone(), stream, outbound));

    let accepted = boot(&endpoint, args, &state).await;
    if accepted {
        heartbeat_loop(&endpoint, &state).await;
    }

    endpoint.close();
    if let Err(e) = pump.await? {
        warn!("WebSocket ended with error: {}", e);
    }
    Ok(accepted)
}

/// BootNotification until Accepted or the connection closes
async fn boot(endpoint: &Endpoint, args: &Args, state: &StationState) -> bool {
    let shutdown = endpoint.shutdown_token();

    while !endpoint.is_closed() {
        let outcome = if endpoint.protocol().is_v2() {
            endpoint
                .v201()
                .boot_notification(v201::BootNotificationRequest {
                    charging_station: v201::ChargingStation {
                        model: args.model.clone(),
                        vendor_name: args.vendor.clone(),
                        serial_number: Some(args.station.to_string()),
                        firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    },
                    reason: v201::BootReason::PowerUp,
                })
                .await
                .into_result()
                .map(|r| {
                    let accepted = r.status == v201::RegistrationStatus::Accepted;
                    (accepted, format!("{:?}", r.status), r.interval)
                })
        } else {
            let mut request = v16::BootNotificationRequest::new(&args.vendor, &args.model);
            request.charge_point_serial_number = Some(args.station.to_string());
            request.firmware_version = Some(env!("CARGO_PKG_VERSION").to_string());
            endpoint
                .v16()
                .boot_notification(request)
                .await
                .into_result()
                .map(|r| {
                    let accepted = r.status == v16::RegistrationStatus::Accepted;
                    (accepted, format!("{:?}", r.status), r.interval)
                })
        };

        let interval = match outcome {
            Ok((true, _, interval)) => {
                if interval > 0 {
                    state.set_heartbeat_interval(interval as u64);
                }
                info!(
                    "Registered with CSMS, heartbeat every {:?}",
                    state.heartbeat_interval()
                );
                return true;
            }
            Ok((false, status, interval)) => {
                info!("Boot status {}", status);
                interval
            }
            Err(e) => {
                warn!("BootNotification failed: {}", e);
                0
            }
        };

        let retry = if interval > 0 {
            Duration::from_secs(interval as u64)
        } else {
            Duration::from_secs(10)
        };
        info!("Retrying BootNotification in {:?}", retry);

        tokio::select! {
            _ = tokio::time::sleep(retry) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    false
}

async fn heartbeat_loop(endpoint: &Endpoint, state: &StationState) {
    let shutdown = endpoint.shutdown_token();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(state.heartbeat_interval()) => {}
            _ = state.heartbeat_requested.notified() => {
                info!("Heartbeat triggered by CSMS");
            }
        }

        let code = if endpoint.protocol().is_v2() {
            endpoint.v201().heartbeat(v201::HeartbeatRequest {}).await.code()
        } else {
            endpoint.v16().heartbeat(v16::HeartbeatRequest {}).await.code()
        };
        if !code.is_ok() {
            warn!("Heartbeat failed: {:?}", code);
        }
    }
}

/// Truncate string with ellipsis, counting chars
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .nth(max_len.saturating_sub(3))
        .map_or(s.len(), |(index, _)| index);
    format!("{}...", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("ws://short", 50), "ws://short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");

        let url = format!("ws://{}/ocpp", "č".repeat(60));
        let cut = truncate(&url, 50);
        assert_eq!(cut.chars().count(), 50);
        assert!(cut.ends_with("..."));
    }
}
