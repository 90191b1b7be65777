//! Argus edge agent entry point.
//!
//! Boot sequence: load and validate configuration, initialize logging and
//! metrics, build every component, register them with the orchestrator
//! under their declared dependencies, start in topological order, serve
//! the operator API, and tear everything down in reverse order on
//! SIGINT/SIGTERM.

use anyhow::{Context, Result};
use argus_agent::config::{AgentConfig, LoggingConfig};
use argus_agent::orchestrator::{ServiceOrchestrator, ServiceSpec};
use argus_agent::services::{
    CameraService, CheckoutService, PipelineService, SessionService, StatusSyncService,
    StoreService,
};
use argus_agent::session::{SessionManager, SessionTimings};
use argus_agent::status_api::{self, ApiState};
use argus_platform::checkout::BatchUploadCoordinator;
use argus_platform::client::HttpPlatformClient;
use argus_platform::status_sync::PlatformStatusSync;
use argus_platform::store::LocalResultStore;
use argus_vision::camera::{Camera, SyntheticCamera};
use argus_vision::model::{NoopDetector, NoopSegmenter};
use argus_vision::pipeline::DetectionPipeline;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    init_tracing(&config.logging);

    info!(
        service = "argus-agent",
        version = env!("CARGO_PKG_VERSION"),
        device_id = %config.platform.device_id,
        "Starting Argus edge agent"
    );

    config.validate().context("Invalid configuration")?;

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    // --- components -----------------------------------------------------

    let store = Arc::new(
        LocalResultStore::open(&config.platform.data_dir)
            .context("Failed to open local result store")?,
    );

    let client = Arc::new(
        HttpPlatformClient::new(config.platform.request_timeout())
            .context("Failed to build platform client")?,
    );

    let sync = PlatformStatusSync::new(config.platform.status_sync_config(), client.clone());

    let coordinator = Arc::new(BatchUploadCoordinator::new(
        store.clone(),
        sync.clone(),
        client.clone(),
        config.platform.checkout_config(),
        config.platform.device_id.clone(),
    ));

    // The synthetic source stands in until a real camera driver is wired
    // up for the target hardware.
    let camera = Arc::new(Camera::new(
        Box::new(SyntheticCamera::new(
            config.vision.synthetic.width,
            config.vision.synthetic.height,
            config.vision.synthetic.frame_interval(),
            None,
        )),
        config.vision.camera.clone(),
    ));

    let pipeline = DetectionPipeline::new(
        Arc::new(NoopDetector),
        Arc::new(NoopSegmenter),
        store.clone(),
        sync.clone(),
        config.platform.device_id.clone(),
        config.vision.pipeline_config(),
    );

    let (sessions, mut notices) = SessionManager::spawn(
        SessionTimings::from(&config.session),
        config.platform.device_id.clone(),
        camera.clone(),
        pipeline.clone(),
        sync.clone(),
    );

    // Log operator notices; the dashboard picks them up via /status.
    tokio::spawn(async move {
        while notices.changed().await.is_ok() {
            if let Some(notice) = notices.borrow_and_update().clone() {
                info!(notice = ?notice, "Operator notice");
            }
        }
    });

    // --- orchestration --------------------------------------------------

    let orchestrator = ServiceOrchestrator::new(config.orchestrator.clone());
    register_services(
        &orchestrator,
        store.clone(),
        camera.clone(),
        sync.clone(),
        pipeline.clone(),
        sessions.clone(),
        coordinator.clone(),
    )?;

    if let Err(e) = orchestrator.start_all().await {
        error!(error = %e, "Service startup failed, shutting down");
        orchestrator.stop_all().await;
        return Err(e.into());
    }

    let api_state = ApiState {
        orchestrator: orchestrator.clone(),
        sessions: sessions.clone(),
        coordinator: coordinator.clone(),
        store: store.clone(),
        sync: sync.clone(),
    };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = status_api::serve(api_state, &api_config).await {
            error!(error = %e, "Operator API error");
        }
    });

    info!("Argus agent started");

    shutdown_signal().await;
    info!("Shutting down");

    api_handle.abort();
    orchestrator.stop_all().await;

    log_final_stats(&store, &coordinator);
    info!("Shutdown complete");
    Ok(())
}

/// Register every component with its spec.
///
/// Dependency edges: the pipeline needs the camera, the store and the
/// config cache; sessions gate the camera and pipeline and mirror status;
/// checkout drains the store through the platform connection.
fn register_services(
    orchestrator: &Arc<ServiceOrchestrator>,
    store: Arc<LocalResultStore>,
    camera: Arc<Camera>,
    sync: Arc<PlatformStatusSync>,
    pipeline: Arc<DetectionPipeline>,
    sessions: SessionManager,
    coordinator: Arc<BatchUploadCoordinator>,
) -> Result<()> {
    orchestrator.register(
        ServiceSpec::new("result-store", &[]),
        Arc::new(StoreService { store }),
    )?;
    orchestrator.register(
        ServiceSpec::new("camera", &[]),
        Arc::new(CameraService { camera }),
    )?;
    orchestrator.register(
        ServiceSpec::new("status-sync", &[]),
        Arc::new(StatusSyncService::new(sync)),
    )?;
    orchestrator.register(
        ServiceSpec::new("detection-pipeline", &["camera", "result-store", "status-sync"]),
        Arc::new(PipelineService { pipeline }),
    )?;
    orchestrator.register(
        ServiceSpec::new(
            "session-manager",
            &["camera", "detection-pipeline", "status-sync"],
        ),
        Arc::new(SessionService { manager: sessions }),
    )?;
    orchestrator.register(
        ServiceSpec::new("upload-coordinator", &["result-store", "status-sync"]),
        Arc::new(CheckoutService { coordinator }),
    )?;
    Ok(())
}

/// Load configuration, falling back to environment-only.
fn load_config() -> Result<AgentConfig> {
    let config = AgentConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        AgentConfig::from_env()
    })?;
    Ok(config)
}

/// Initialize tracing/logging
fn init_tracing(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(store: &LocalResultStore, coordinator: &BatchUploadCoordinator) {
    let store_stats = store.stats();
    let upload_stats = coordinator.stats();
    info!(
        results_total = store_stats.total_results,
        results_pending = store_stats.pending,
        batches_committed = upload_stats.batches_committed,
        batches_failed = upload_stats.batches_failed,
        "Final statistics"
    );
}
