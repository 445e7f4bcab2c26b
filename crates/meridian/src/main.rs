//! Meridian Controller
//!
//! Runs the configured calculation and calibration cycles against the
//! enabled interfaces.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use meridian_runtime::service::{ServiceHandle, ServiceManager};
use meridian_runtime::{CycleStatus, NoCalculation};

use meridian::project::{Project, Settings};
use meridian::services::{ControllerService, HealthService, check_health};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Meridian data orchestration controller
#[derive(Parser, Debug)]
#[command(name = "meridian")]
#[command(about = "Config-driven data orchestration controller", long_about = None)]
struct Args {
    /// Path to the JSON configuration (overrides MERIDIAN_CONFIG_PATH)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single calculation cycle and exit
    #[arg(long)]
    once: bool,

    /// Run a calibration cycle before the first calculation
    #[arg(long)]
    calibrate: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Exit successfully if the last cycle completed recently
    #[arg(long)]
    health: bool,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load()?;
    if let Some(config) = &args.config {
        settings.config_path = config.clone();
    }

    init_tracing(&settings.log_level, args.log_format);
    info!("Starting Meridian v{}", env!("CARGO_PKG_VERSION"));

    let project = match Project::load(settings) {
        Ok(project) => project,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    if args.check {
        info!(
            name = %project.table.name,
            components = project.table.components().len(),
            "Configuration is valid"
        );
        return Ok(());
    }

    if args.health {
        // Two missed cycles count as unhealthy
        let max_age = project.table.schedule.calculation_interval * 2;
        let last = check_health(&project.settings.health_file, max_age, Utc::now()).await?;
        info!(%last, "Healthy");
        return Ok(());
    }

    let runner = match project.runner(Arc::new(NoCalculation)) {
        Ok(runner) => runner,
        Err(e) => {
            error!(error = %e, "Cannot start cycle runner");
            return Err(e.into());
        }
    };

    if args.once {
        let mut runner = runner;
        if args.calibrate || project.table.schedule.calibrate_on_startup {
            runner.run_calibration(Utc::now()).await;
        }
        let report = runner.run_calculation(Utc::now()).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if report.status == CycleStatus::Failed {
            bail!("calculation cycle failed");
        }
        return Ok(());
    }

    let service_manager = Arc::new(ServiceManager::new());

    let health = HealthService::new(project.settings.health_file.clone());
    if let Err(e) = service_manager.spawn(health).await {
        warn!(error = %e, "Failed to start health service");
    }

    let controller = ControllerService::new(runner).calibrate_on_start(args.calibrate);
    let handle = service_manager.spawn(controller).await?;
    handle.started().await?;
    info!(service_id = %handle.service_id, "Controller started");

    for (id, state) in service_manager.list() {
        info!("  - {} ({})", id, state);
    }

    shutdown_signal(service_manager, handle).await;
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("meridian={level},meridian_runtime={level}"))
    });
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

/// Wait for Ctrl+C, SIGTERM or the controller ending, then stop all services
async fn shutdown_signal(service_manager: Arc<ServiceManager>, controller: ServiceHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
        state = controller.stopped() => {
            warn!(%state, "Controller ended, shutting down...");
        },
    }

    if let Err(e) = service_manager.shutdown_all().await {
        warn!("Some services did not shut down cleanly: {}", e);
    }
}
