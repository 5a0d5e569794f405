//! sentineld - restricted-zone monitoring daemon
//!
//! This daemon:
//! 1. Opens the violation database and the zones file
//! 2. Loads the configured detector model
//! 3. Captures frames from the configured video source
//! 4. Runs the monitoring loop on a dedicated thread
//! 5. Serves the observer gateway until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use zone_sentinel::config::SentinelConfig;
use zone_sentinel::gateway::{self, AppState};
use zone_sentinel::ingest::RtspSource;
use zone_sentinel::{
    Detector, LatestFrameSource, MonitoringLoop, NotificationHub, ShutdownSignal, SnapshotWriter,
    SqliteViolationStore, ViolationLedger, ViolationStore, ZoneIndex,
};

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SentinelConfig::load()?;
    let shutdown = ShutdownSignal::new();

    let store: Arc<dyn ViolationStore> =
        Arc::new(SqliteViolationStore::open(&config.storage.db_path)?);
    let ledger = Arc::new(ViolationLedger::new(store));
    let hub = Arc::new(NotificationHub::new(ledger));
    let zones = Arc::new(ZoneIndex::open(&config.storage.zones_path)?);
    log::info!(
        "{} zone(s) loaded from {}",
        zones.len(),
        config.storage.zones_path.display()
    );

    let detector = Arc::new(build_detector(&config)?);
    detector.swap_model(&config.detection.model)?;

    let producer = RtspSource::new(config.rtsp_config())?;
    let source = Arc::new(LatestFrameSource::spawn(Box::new(producer), config.video.fps)?);
    source.play();

    let snapshots = SnapshotWriter::new(&config.storage.violations_path)?;
    let monitor = Arc::new(MonitoringLoop::new(
        source.clone(),
        detector.clone(),
        zones.clone(),
        hub.clone(),
        snapshots,
        config.monitor_settings(),
        shutdown.clone(),
    ));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("sentinel-rt")
        .build()?;
    hub.bind_runtime(runtime.handle().clone());

    if config.monitoring.autostart {
        monitor.start()?;
    }

    let (tx, rx) = mpsc::channel();
    let addr = config.socket_addr()?;
    let state = AppState {
        hub: hub.clone(),
        monitor: monitor.clone(),
        detector: detector.clone(),
        zones,
        source: source.clone(),
    };
    let server_exit = tx.clone();
    let server_shutdown = shutdown.clone();
    let server = runtime.spawn(async move {
        let result = gateway::serve(addr, state, server_shutdown).await;
        let _ = server_exit.send(());
        result
    });

    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "sentineld running. database {}, source {}",
        config.storage.db_path,
        config.video.source
    );
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping services...");
    shutdown.trigger();

    if monitor.is_running() {
        monitor.stop();
    }
    source.stop();
    let served = runtime.block_on(server);
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    detector.release();

    match served {
        Ok(result) => result,
        Err(e) => Err(anyhow!("gateway task failed: {}", e)),
    }
}

fn build_detector(config: &SentinelConfig) -> Result<Detector> {
    #[allow(unused_mut)]
    let mut detector = Detector::with_default_backends();

    #[cfg(feature = "backend-tract")]
    for path in &config.detection.onnx_models {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("cannot derive a model name from {}", path.display()))?
            .to_string();
        detector.register_onnx(
            &name,
            path.clone(),
            config.detection.input_width,
            config.detection.input_height,
        );
        log::info!("registered onnx model {} ({})", name, path.display());
    }
    #[cfg(not(feature = "backend-tract"))]
    if !config.detection.onnx_models.is_empty() {
        log::warn!(
            "ignoring {} onnx model(s): built without the backend-tract feature",
            config.detection.onnx_models.len()
        );
    }

    detector.set_thresholds(
        config.detection.confidence_threshold,
        config.detection.iou_threshold,
    )?;
    Ok(detector)
}
