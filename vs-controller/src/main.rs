mod altitude;
mod backseat;
mod config;
mod controller;
mod geo;
mod line_start;
mod mission;
mod navigation;
mod phase_manager;
mod vs_loop;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use altitude::{AltitudeSource, RealAltitudeSource, SimulatedAltitudeSource};
use backseat::BackseatClient;
use config::VsConfig;
use controller::{ControllerSettings, SetpointSink};
use mission::PlanStore;
use navigation::NavigationStore;
use phase_manager::PhaseManager;
use vs_loop::{virtual_slope_loop, LegParameters, VsLoopContext};

#[derive(Parser, Debug)]
#[command(name = "vs-controller", about = "Virtual Slope depth controller for AUV missions")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

/// Console + file logging. The returned guard must live as long as the
/// process so the file sink flushes on shutdown.
fn init_logging(cfg: &VsConfig) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&cfg.log_directory)
        .with_context(|| format!("creating log directory {}", cfg.log_directory.display()))?;

    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_file = tracing_appender::rolling::never(&cfg.log_directory, format!("vs_{timestamp}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(log_file);

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.console_log_level.to_lowercase()));
    let file_filter = EnvFilter::new(cfg.file_log_level.to_lowercase());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(console_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer)
                .with_filter(file_filter),
        )
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = Arc::new(VsConfig::load(&args.config)?);
    let _log_guard = init_logging(&cfg)?;

    info!(
        "Virtual Slope controller v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    // DesBridge ingest: its own task for the process lifetime, sharing only
    // the snapshot store with the control loops
    let nav_store = NavigationStore::new();
    info!("Starting DesBridge server...");
    tokio::spawn(navigation::run_desbridge_server(
        cfg.desbridge_host.clone(),
        cfg.desbridge_port,
        nav_store.clone(),
    ));

    let backseat = BackseatClient::new(&cfg).context("building Backseat HTTP client")?;
    let plans = Arc::new(PlanStore::new(&cfg.params_directory));

    let altitude_source: Arc<dyn AltitudeSource> = if cfg.test_mode {
        warn!("TEST MODE ENABLED - Using simulated altitude source");
        let simulated = SimulatedAltitudeSource::new();
        simulated.seed(cfg.test_initial_bottom_depth);
        Arc::new(simulated)
    } else {
        Arc::new(RealAltitudeSource)
    };

    let mut manager = PhaseManager::new(
        backseat.clone(),
        plans,
        nav_store.clone(),
        cfg.clone(),
    );

    info!("PHASE MONITOR STARTED");

    let mut ticker =
        tokio::time::interval(Duration::from_secs_f64(cfg.monitoring_check_interval));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("User requested termination (Ctrl+C)");
                break;
            }
            _ = ticker.tick() => {
                if let Some((subphase_id, plan)) = manager.update().await {
                    let previous_step = manager.last_step();
                    info!("Starting virtual slope for subphase {subphase_id}");

                    let actual_start_z = nav_store.get().await.and_then(|nav| nav.depth);
                    let leg = LegParameters::derive(
                        &plan,
                        actual_start_z,
                        cfg.max_angle,
                        cfg.command_period,
                    );
                    manager.set_last_step(leg.step);

                    let ctx = VsLoopContext {
                        nav: nav_store.clone(),
                        sink: Arc::new(backseat.clone()) as Arc<dyn SetpointSink>,
                        altitude_source: altitude_source.clone(),
                        settings: ControllerSettings::from_config(&cfg),
                        command_period: cfg.command_period,
                        last_step: manager.last_step_cell(),
                    };
                    let task = tokio::spawn(virtual_slope_loop(
                        subphase_id,
                        plan,
                        leg,
                        previous_step,
                        ctx,
                    ));
                    manager.set_vs_task(task);
                }
            }
        }
    }

    manager.cleanup().await;
    Ok(())
}
