use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::frame::Frame;
use crate::ShutdownSignal;

use super::{FrameProducer, FrameSource};

const PAUSED_POLL: Duration = Duration::from_millis(50);
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Serialize)]
pub struct CaptureStats {
    pub source: String,
    pub playing: bool,
    pub frames_captured: u64,
    pub capture_errors: u64,
}

struct Shared {
    latest: Mutex<Option<Arc<Frame>>>,
    playing: AtomicBool,
    frames_captured: AtomicU64,
    capture_errors: AtomicU64,
    source: String,
}

/// Capture thread feeding a single latest-frame slot.
///
/// Readers never wait for a decode: `get_frame` returns whatever was stored
/// last. Pausing stops the capture thread from pulling and makes `is_playing`
/// false; the last frame stays readable.
pub struct LatestFrameSource {
    shared: Arc<Shared>,
    stop: ShutdownSignal,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LatestFrameSource {
    /// Connect `producer` and start pulling at `fps` frames per second.
    pub fn spawn(mut producer: Box<dyn FrameProducer>, fps: u32) -> Result<Self> {
        if fps == 0 {
            return Err(anyhow!("capture fps must be greater than zero"));
        }
        producer.connect()?;

        let shared = Arc::new(Shared {
            latest: Mutex::new(None),
            playing: AtomicBool::new(true),
            frames_captured: AtomicU64::new(0),
            capture_errors: AtomicU64::new(0),
            source: producer.describe(),
        });
        let stop = ShutdownSignal::new();
        let interval = Duration::from_secs_f64(1.0 / f64::from(fps));

        let worker = {
            let shared = shared.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("frame-capture".to_string())
                .spawn(move || capture_loop(producer, shared, stop, interval))?
        };

        Ok(Self {
            shared,
            stop,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn play(&self) {
        self.shared.playing.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.shared.playing.store(false, Ordering::SeqCst);
    }

    /// Pause and drop the held frame, so readers see nothing until playback
    /// resumes. The capture thread stays up.
    pub fn halt(&self) {
        self.pause();
        if let Ok(mut slot) = self.shared.latest.lock() {
            *slot = None;
        }
    }

    /// Stop capturing and join the capture thread. Idempotent.
    pub fn stop(&self) {
        self.pause();
        self.stop.trigger();
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("frame capture thread panicked");
            }
            log::info!("frame capture stopped ({})", self.shared.source);
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            source: self.shared.source.clone(),
            playing: self.is_playing(),
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            capture_errors: self.shared.capture_errors.load(Ordering::Relaxed),
        }
    }
}

impl FrameSource for LatestFrameSource {
    fn get_frame(&self) -> Option<Arc<Frame>> {
        self.shared.latest.lock().ok()?.clone()
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }
}

impl Drop for LatestFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut producer: Box<dyn FrameProducer>,
    shared: Arc<Shared>,
    stop: ShutdownSignal,
    interval: Duration,
) {
    log::info!("frame capture started ({})", shared.source);
    while !stop.is_triggered() {
        if !shared.playing.load(Ordering::SeqCst) {
            stop.sleep(PAUSED_POLL);
            continue;
        }

        let started = Instant::now();
        match producer.next_frame() {
            Ok(frame) => {
                if let Ok(mut slot) = shared.latest.lock() {
                    // A frame decoded across a pause is discarded.
                    if shared.playing.load(Ordering::SeqCst) {
                        *slot = Some(Arc::new(frame));
                    }
                }
                shared.frames_captured.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                shared.capture_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("frame capture from {} failed: {:#}", shared.source, e);
                if stop.sleep(RETRY_DELAY) {
                    break;
                }
                if !producer.is_healthy() {
                    if let Err(e) = producer.connect() {
                        log::warn!("reconnect to {} failed: {:#}", shared.source, e);
                    }
                }
                continue;
            }
        }

        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            stop.sleep(remaining);
        }
    }
}
