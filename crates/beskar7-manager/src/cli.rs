use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

fn duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "beskar7",
    about = "Bare-metal infrastructure provider: claims Redfish-managed hosts for declared machines",
    version
)]
pub struct Cli {
    /// Address the metrics endpoint binds to.
    #[arg(long, default_value = ":8080", env = "BESKAR7_METRICS_BIND_ADDRESS")]
    pub metrics_bind_address: String,

    /// Address the health probe endpoint binds to.
    #[arg(long, default_value = ":8081", env = "BESKAR7_HEALTH_PROBE_BIND_ADDRESS")]
    pub health_probe_bind_address: String,

    /// Enable leader election for the claim coordinator.
    #[arg(long)]
    pub leader_elect: bool,

    #[arg(long, value_parser = duration)]
    pub leader_elect_lease_duration: Option<Duration>,

    #[arg(long, value_parser = duration)]
    pub leader_elect_renew_deadline: Option<Duration>,

    #[arg(long, value_parser = duration)]
    pub leader_elect_retry_period: Option<Duration>,

    /// Serve admission webhooks (handled outside this manager; accepted for
    /// flag compatibility).
    #[arg(long)]
    pub enable_webhook: bool,

    #[arg(long, default_value_t = 9443)]
    pub webhook_port: u16,

    #[arg(long)]
    pub webhook_cert_dir: Option<PathBuf>,

    /// Optional settings file overlaying the compiled defaults.
    #[arg(long, env = "BESKAR7_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Namespace this manager watches.
    #[arg(long, default_value = "default", env = "BESKAR7_NAMESPACE")]
    pub namespace: String,
}

/// `:8080` means all interfaces; anything else must parse as a socket
/// address.
pub fn parse_bind_address(s: &str) -> Result<SocketAddr, String> {
    let normalized = if s.starts_with(':') {
        format!("0.0.0.0{s}")
    } else {
        s.to_string()
    };
    normalized.parse().map_err(|e| format!("invalid bind address '{s}': {e}"))
}
