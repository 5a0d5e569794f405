//! The monitoring loop: sample, detect, contain, debounce, record, notify.
//!
//! Runs on its own std thread. Each iteration takes the latest frame from the
//! source, runs the detector, checks every detection against every zone and
//! turns non-suppressed matches into violations. Violations are indexed and
//! persisted through the ledger and handed to the notification hub without
//! waiting on observer I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::detect::{Detection, Detector};
use crate::error::SentinelError;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::notify::NotificationHub;
use crate::snapshot::SnapshotWriter;
use crate::violation::Violation;
use crate::zone::ZoneIndex;
use crate::ShutdownSignal;

/// Retry delay while waiting for the next detection slot.
const PACING_WAIT: Duration = Duration::from_millis(10);
/// Delay when no frame is ready or playback is paused.
const IDLE_WAIT: Duration = Duration::from_millis(100);
/// Delay after a failed iteration.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const SLEEP_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq)]
pub struct MonitorSettings {
    /// Detection passes per second.
    pub detection_fps: u32,
    /// Minimum spacing between two violations for the same zone.
    pub debounce: Duration,
    /// How long `stop` waits for the worker before abandoning it.
    pub stop_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            detection_fps: 10,
            debounce: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MonitorStatus {
    pub is_monitoring: bool,
    pub pending_violations: usize,
    pub total_violations: usize,
    pub debounce_secs: f64,
    pub detection_fps: u32,
    pub iterations: u64,
    pub violations_raised: u64,
}

struct Debounce {
    window: Duration,
    last: HashMap<String, Instant>,
}

struct Inner {
    source: Arc<dyn FrameSource>,
    detector: Arc<Detector>,
    zones: Arc<ZoneIndex>,
    hub: Arc<NotificationHub>,
    snapshots: SnapshotWriter,
    debounce: Mutex<Debounce>,
    interval: Duration,
    detection_fps: u32,
    shutdown: ShutdownSignal,
    iterations: AtomicU64,
    violations_raised: AtomicU64,
    /// Worker threads still inside `run`, including detached ones.
    live_workers: AtomicUsize,
}

struct Worker {
    stop: ShutdownSignal,
    alive: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

enum Step {
    Idle,
    Processed,
}

pub struct MonitoringLoop {
    inner: Arc<Inner>,
    stop_timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl MonitoringLoop {
    pub fn new(
        source: Arc<dyn FrameSource>,
        detector: Arc<Detector>,
        zones: Arc<ZoneIndex>,
        hub: Arc<NotificationHub>,
        snapshots: SnapshotWriter,
        settings: MonitorSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let fps = settings.detection_fps.max(1);
        Self {
            inner: Arc::new(Inner {
                source,
                detector,
                zones,
                hub,
                snapshots,
                debounce: Mutex::new(Debounce {
                    window: settings.debounce,
                    last: HashMap::new(),
                }),
                interval: Duration::from_secs(1) / fps,
                detection_fps: fps,
                shutdown,
                iterations: AtomicU64::new(0),
                violations_raised: AtomicU64::new(0),
                live_workers: AtomicUsize::new(0),
            }),
            stop_timeout: settings.stop_timeout,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker. A no-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| anyhow!("monitor worker lock poisoned"))?;
        if worker.as_ref().is_some_and(|w| w.alive.load(Ordering::SeqCst)) {
            log::warn!("monitoring already running");
            return Ok(());
        }
        if self.inner.live_workers.load(Ordering::SeqCst) > 0 {
            return Err(anyhow!(
                "previous monitoring worker has not exited yet; retry shortly"
            ));
        }

        let stop = ShutdownSignal::new();
        let alive = Arc::new(AtomicBool::new(true));
        let (done_tx, done) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let worker_stop = stop.clone();
        let worker_alive = Arc::clone(&alive);
        self.inner.live_workers.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name("zone-monitor".into())
            .spawn(move || {
                inner.run(&worker_stop);
                inner.live_workers.fetch_sub(1, Ordering::SeqCst);
                worker_alive.store(false, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.live_workers.fetch_sub(1, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        *worker = Some(Worker {
            stop,
            alive,
            done,
            handle,
        });
        log::info!("monitoring started");
        Ok(())
    }

    /// Ask the worker to exit and wait up to the stop timeout. A worker that
    /// does not exit in time is detached.
    pub fn stop(&self) {
        let worker = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                log::error!("monitor worker lock poisoned");
                return;
            }
        };
        let Some(worker) = worker else {
            log::warn!("monitoring already stopped");
            return;
        };

        worker.stop.trigger();
        match worker.done.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    log::error!("monitoring worker panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "monitoring worker did not exit within {:?}; detaching",
                    self.stop_timeout
                );
            }
        }
        log::info!("monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|w| w.as_ref().is_some_and(|w| w.alive.load(Ordering::SeqCst)))
            .unwrap_or(false)
    }

    /// Change the debounce window. Negative values clamp to zero.
    pub fn set_debounce_window(&self, seconds: f64) {
        let window = Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX);
        if let Ok(mut debounce) = self.inner.debounce.lock() {
            debounce.window = window;
        }
        log::info!("debounce window set to {:?}", window);
    }

    pub fn debounce_window(&self) -> Duration {
        self.inner
            .debounce
            .lock()
            .map(|d| d.window)
            .unwrap_or_default()
    }

    /// Run the containment, debounce and recording steps for one frame's
    /// detections as observed at `now`. Returns the violations raised.
    pub fn process_detections(
        &self,
        frame: &Frame,
        detections: &[Detection],
        now: Instant,
    ) -> Vec<Violation> {
        self.inner.process(frame, detections, now)
    }

    pub fn status(&self) -> MonitorStatus {
        let ledger = self.inner.hub.ledger();
        MonitorStatus {
            is_monitoring: self.is_running(),
            pending_violations: ledger.pending().len(),
            total_violations: ledger.indexed_len(),
            debounce_secs: self.debounce_window().as_secs_f64(),
            detection_fps: self.inner.detection_fps,
            iterations: self.inner.iterations.load(Ordering::Relaxed),
            violations_raised: self.inner.violations_raised.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MonitoringLoop {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

impl Inner {
    fn run(&self, stop: &ShutdownSignal) {
        log::info!(
            "monitoring loop running ({} detections/s)",
            self.detection_fps
        );
        let mut last_pass: Option<Instant> = None;
        while !self.exiting(stop) {
            if last_pass.is_some_and(|t| t.elapsed() < self.interval) {
                self.pause(stop, PACING_WAIT);
                continue;
            }
            let now = Instant::now();
            last_pass = Some(now);

            match self.iterate(now) {
                Ok(Step::Processed) => {}
                Ok(Step::Idle) => {
                    self.pause(stop, IDLE_WAIT);
                }
                Err(e) => {
                    log::error!("monitoring iteration failed: {:#}", e);
                    self.pause(stop, ERROR_BACKOFF);
                }
            }
        }
        log::info!("monitoring loop exited");
    }

    fn iterate(&self, now: Instant) -> Result<Step> {
        let Some(frame) = self.source.get_frame() else {
            log::debug!("{}", SentinelError::FrameUnavailable);
            return Ok(Step::Idle);
        };
        if !self.source.is_playing() {
            return Ok(Step::Idle);
        }
        self.iterations.fetch_add(1, Ordering::Relaxed);

        let detections = match self.detector.try_detect(&frame) {
            Ok(detections) => detections,
            Err(e) => match e.downcast_ref::<SentinelError>() {
                Some(SentinelError::DetectorUnavailable(_)) => {
                    log::warn!("{}", e);
                    Vec::new()
                }
                _ => return Err(e),
            },
        };
        if !detections.is_empty() {
            log::debug!("{} detection(s)", detections.len());
            self.process(&frame, &detections, now);
        }
        Ok(Step::Processed)
    }

    fn process(&self, frame: &Frame, detections: &[Detection], now: Instant) -> Vec<Violation> {
        let Some(representative) = detections.first() else {
            return Vec::new();
        };
        let mut raised = Vec::new();
        for hit in self.zones.check_violations(detections) {
            let Some(previous) = self.try_arm(&hit.zone_id, now) else {
                log::debug!("violation in zone {} debounced", hit.zone_id);
                continue;
            };
            log::warn!(
                "violation detected in zone {} ({})",
                hit.zone_name,
                hit.zone_id
            );

            let at = crate::now_local();
            let image_path = match self
                .snapshots
                .write(frame, representative, &hit.zone_id, &at)
            {
                Ok(path) => path,
                Err(e) => {
                    log::error!("snapshot for zone {} failed: {:#}", hit.zone_id, e);
                    self.disarm(&hit.zone_id, now, previous);
                    continue;
                }
            };
            let violation = Violation::new(
                &hit.zone_id,
                &hit.zone_name,
                representative.clone(),
                image_path,
                at,
            );

            self.hub.ledger().record(&violation);
            self.hub.dispatch(violation.clone());
            self.violations_raised.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "violation {} recorded (confidence {:.2})",
                violation.id,
                violation.detection.confidence
            );
            raised.push(violation);
        }
        raised
    }

    /// Check and arm the zone's debounce slot in one step. Returns the
    /// previous arm time (`Some(None)` for a fresh zone) when `now` falls
    /// outside the window, `None` when the match is suppressed.
    fn try_arm(&self, zone_id: &str, now: Instant) -> Option<Option<Instant>> {
        let mut d = self.debounce.lock().ok()?;
        let window = d.window;
        let previous = d.last.get(zone_id).copied();
        if previous.is_some_and(|last| now.saturating_duration_since(last) < window) {
            return None;
        }
        d.last.insert(zone_id.to_string(), now);
        Some(previous)
    }

    /// Undo `try_arm` after a failed snapshot, unless another pass re-armed
    /// the zone in the meantime.
    fn disarm(&self, zone_id: &str, armed_at: Instant, previous: Option<Instant>) {
        let Ok(mut d) = self.debounce.lock() else {
            return;
        };
        if d.last.get(zone_id) != Some(&armed_at) {
            return;
        }
        match previous {
            Some(last) => {
                d.last.insert(zone_id.to_string(), last);
            }
            None => {
                d.last.remove(zone_id);
            }
        }
    }

    fn exiting(&self, stop: &ShutdownSignal) -> bool {
        stop.is_triggered() || self.shutdown.is_triggered()
    }

    fn pause(&self, stop: &ShutdownSignal, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.exiting(stop) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(SLEEP_POLL.min(deadline - now));
        }
    }
}
