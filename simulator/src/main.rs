use axum::{routing::get, Router};
use clap::Parser;
use ice_simulator::config::{DeviceSpec, FleetConfig, FleetOptions, RetryPolicy};
use ice_simulator::fleet::Fleet;
use ice_simulator::metrics;
use ice_simulator::shutdown::{termination_signal, ShutdownCoordinator};
use ice_simulator::transport::memory::MemoryEndpoint;
use ice_simulator::transport::mqtt::IotHubConnector;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Simulated Rideau Canal ice sensors publishing to Azure IoT Hub.
///
/// Each device's connection string is read from IOTHUB_<DEVICE_ID>,
/// e.g. IOTHUB_DEVICE_A for device_A.
#[derive(Debug, Parser)]
#[command(name = "ice-simulator", version)]
struct Args {
    /// Device to simulate as ID=LOCATION (repeatable). Defaults to
    /// device_A, device_B and device_C.
    #[arg(long = "device", value_name = "ID=LOCATION", env = "SIMULATOR_DEVICES", value_delimiter = ',')]
    devices: Vec<DeviceSpec>,

    /// Seconds between readings for every device
    #[arg(long, env = "TELEMETRY_INTERVAL_SECS", default_value_t = 10)]
    interval_secs: u64,

    #[arg(long, env = "OPEN_TIMEOUT_SECS", default_value_t = 30)]
    open_timeout_secs: u64,

    #[arg(long, env = "DELIVER_TIMEOUT_SECS", default_value_t = 10)]
    deliver_timeout_secs: u64,

    /// Extra delivery attempts within a tick before the device is degraded
    #[arg(long, env = "DELIVERY_RETRIES", default_value_t = 0)]
    retries: u32,

    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 100)]
    retry_backoff_ms: u64,

    /// Lifetime of the SAS token minted when a device connects
    #[arg(long, env = "SAS_TTL_SECS", default_value_t = 86_400)]
    sas_ttl_secs: u64,

    /// Serve Prometheus metrics on this address, e.g. 0.0.0.0:9100
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Deliver to an in-process endpoint instead of IoT Hub
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn fleet_options(&self) -> FleetOptions {
        let initial_backoff = Duration::from_millis(self.retry_backoff_ms);
        FleetOptions {
            interval: Duration::from_secs(self.interval_secs),
            open_timeout: Duration::from_secs(self.open_timeout_secs),
            deliver_timeout: Duration::from_secs(self.deliver_timeout_secs),
            retry: RetryPolicy {
                max_retries: self.retries,
                initial_backoff,
                max_backoff: initial_backoff.saturating_mul(16),
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting ice telemetry simulator");

    let specs = if args.devices.is_empty() {
        DeviceSpec::defaults()
    } else {
        args.devices.clone()
    };

    // Credentials are resolved before any session opens
    let config = match FleetConfig::from_env(&specs, args.fleet_options()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    if let Some(addr) = &args.metrics_addr {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .unwrap_or_else(|e| {
                error!("Failed to bind to {}: {}", addr, e);
                std::process::exit(1);
            });
        info!("Metrics endpoint listening on {}", addr);

        let app = Router::new().route("/metrics", get(metrics_handler));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap_or_else(|e| {
                error!("Metrics server error: {}", e);
            });
        });
    }

    let started = if args.dry_run {
        info!("Dry run: delivering to an in-process endpoint");
        Fleet::start(config, &MemoryEndpoint::new()).await
    } else {
        let connector = IotHubConnector {
            sas_ttl: Duration::from_secs(args.sas_ttl_secs),
            ..IotHubConnector::default()
        };
        Fleet::start(config, &connector).await
    };

    let fleet = match started {
        Ok(fleet) => Arc::new(fleet),
        Err(e) => {
            error!("Failed to start fleet: {}", e);
            std::process::exit(1);
        }
    };

    ShutdownCoordinator::new(fleet)
        .run(termination_signal)
        .await;
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
