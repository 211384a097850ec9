use anyhow::{Context, Result};
use rollcall_core::{AttendanceLedger, Config, NearestMatcher, OnnxExtractor, Registry};
use rollcall_hw::CameraOpener;
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        known_faces = %config.known_faces_dir.display(),
        logs = %config.logs_dir.display(),
        threshold = config.match_threshold,
        "configuration loaded"
    );

    for dir in [&config.known_faces_dir, &config.logs_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let detector_path = config.detector_model_path();
    let recognizer_path = config.recognizer_model_path();
    let mut extractor = OnnxExtractor::load(&detector_path, &recognizer_path)
        .context("failed to load face models")?;
    tracing::info!(
        detector = %detector_path.display(),
        recognizer = %recognizer_path.display(),
        "face models loaded"
    );

    let registry = Registry::load(&config.known_faces_dir, &mut extractor)
        .context("failed to load known faces")?;
    if registry.is_empty() {
        tracing::warn!(
            dir = %config.known_faces_dir.display(),
            "no known faces loaded; sessions cannot start until reference images are added"
        );
    }

    let engine = engine::spawn_engine(engine::EngineParts {
        extractor,
        registry,
        matcher: NearestMatcher::new(config.match_threshold),
        ledger: AttendanceLedger::new(&config.logs_dir),
        opener: CameraOpener::new(&config.camera_device),
        tick_interval: config.tick_interval(),
        recent_log_capacity: config.recent_log_capacity,
    })?;

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine.clone()))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    if let Err(e) = engine.stop().await {
        tracing::warn!(error = %e, "engine did not stop cleanly");
    }

    Ok(())
}
