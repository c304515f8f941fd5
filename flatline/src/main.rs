//! Flatline
//!
//! Watches a fleet of networked miners over HTTP and restarts any device whose
//! accepted-share counter stops increasing. Operators are notified through a
//! webhook; each device gets a daily log that is compressed and expired.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use flatline_core::alert::{AlertDispatcher, AlertEvent, Notifier};
use flatline_core::device::DeviceClient;
use flatline_core::journal::status_line;
use flatline_core::metrics::MetricsRegistry;
use flatline_core::retention::RetentionManager;
use flatline_core::scheduler::{collect_summaries, Scheduler};
use flatline_core::state_machine::DeviceStatus;
use flatline_http::{HttpDeviceClient, WebhookNotifier};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Build the alert dispatcher from config; no URL means alerts are only logged
fn build_dispatcher(config: &Config, metrics: Arc<MetricsRegistry>) -> Result<AlertDispatcher> {
    let notifier: Option<Arc<dyn Notifier>> = match &config.notify_url {
        Some(url) => {
            let webhook = WebhookNotifier::new(url.clone(), config.alerts.timeout)
                .context("Failed to create webhook notifier")?;
            Some(Arc::new(webhook) as Arc<dyn Notifier>)
        }
        None => {
            warn!("No notify_url configured, alerts will only be logged");
            None
        }
    };
    Ok(AlertDispatcher::new(notifier, config.alerts.timeout, metrics))
}

/// Run the monitor until shutdown
async fn run(config: Config, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let metrics = Arc::new(MetricsRegistry::new());
    let client: Arc<dyn DeviceClient> = Arc::new(HttpDeviceClient::new(config.request_timeout)?);
    let dispatcher = Arc::new(build_dispatcher(&config, metrics.clone())?);
    let log_dir = config.log_dir();

    for device in &config.devices {
        info!(device = %device, address = %device.address, "Monitoring device");
    }

    // Start metrics server if enabled
    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    if config.alerts.startup_summary && dispatcher.is_enabled() {
        let devices = collect_summaries(client.as_ref(), &config.devices, config.request_timeout).await;
        dispatcher
            .dispatch(&AlertEvent::StartupSummary { devices })
            .await;
    }

    let mut scheduler = Scheduler::new(
        config.devices.clone(),
        client,
        dispatcher,
        metrics,
        config.monitor_settings(),
    )
    .with_journals(log_dir.clone());

    if config.retention.enabled {
        info!(
            dir = ?log_dir,
            max_days = config.max_days,
            interval = ?config.retention.interval,
            "Log retention enabled"
        );
        let manager = RetentionManager::new(log_dir, config.device_names(), config.max_days);
        scheduler = scheduler.with_retention(manager, config.retention.interval);
    }

    scheduler.run(shutdown_rx).await?;

    info!("Flatline shutdown complete");
    Ok(())
}

/// Poll every device once and report
async fn run_once(config: Config) -> Result<()> {
    info!("Running single poll pass (--once mode)");

    let metrics = Arc::new(MetricsRegistry::new());
    let client: Arc<dyn DeviceClient> = Arc::new(HttpDeviceClient::new(config.request_timeout)?);
    let dispatcher = Arc::new(AlertDispatcher::disabled(metrics.clone()));

    let mut scheduler = Scheduler::new(
        config.devices.clone(),
        client,
        dispatcher,
        metrics,
        config.monitor_settings(),
    )
    .with_journals(config.log_dir());
    scheduler.run_once().await;

    for monitor in scheduler.monitors() {
        let state = monitor.state();
        match (&state.last_sample, state.status) {
            (Some(sample), status) if status != DeviceStatus::Unreachable => {
                info!(device = %state.device, status = %status, "{}", status_line(sample, &state.device.name, state.total_restarts));
            }
            _ => {
                warn!(
                    device = %state.device,
                    address = %state.device.address,
                    error = state.last_error.as_deref().unwrap_or("unknown error"),
                    "Device unreachable"
                );
            }
        }
    }

    Ok(())
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!(port = port, "Metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics_output = prometheus::TextEncoder::new()
                .encode_to_string(&prometheus::gather())
                .unwrap_or_default();

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

/// Resolve when Ctrl+C or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Flatline starting");

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        if cli.address.is_none() {
            warn!(path = ?cli.config, "Config file not found, using defaults");
        }
        Config::default()
    };

    // Apply CLI overrides
    config.apply_cli(&cli);

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    info!(
        devices = config.devices.len(),
        interval = ?config.interval,
        stall_threshold = ?config.stall_threshold,
        dry_run = config.restart.dry_run,
        "Configuration loaded"
    );

    if cli.once {
        return run_once(config).await;
    }

    // Setup shutdown signal handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Run main loop
    run(config, shutdown_rx).await
}
