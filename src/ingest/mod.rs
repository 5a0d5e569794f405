//! Frame ingestion.
//!
//! Two layers:
//! - `FrameProducer`: a blocking decoder (RTSP, synthetic `stub://` scenes)
//!   pulled one frame at a time.
//! - `FrameSource`: the non-blocking "latest frame" view the monitoring loop
//!   samples. `LatestFrameSource` bridges the two with a capture thread.
//!
//! `StillSource` serves one fixed frame and is meant for tests.

pub mod latest;
pub mod rtsp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::frame::Frame;

pub use latest::{CaptureStats, LatestFrameSource};
pub use rtsp::{RtspConfig, RtspSource};

/// Latest-frame capability consumed by the monitoring loop.
pub trait FrameSource: Send + Sync {
    /// Most recent frame, without blocking. `None` when nothing has been
    /// captured yet.
    fn get_frame(&self) -> Option<Arc<Frame>>;

    /// False while playback is paused or stopped.
    fn is_playing(&self) -> bool;
}

/// Blocking frame decoder.
pub trait FrameProducer: Send {
    fn connect(&mut self) -> Result<()>;

    /// Decode the next frame, blocking until one is available.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    /// Human-readable source name for logs.
    fn describe(&self) -> String;
}

/// A fixed frame that can be swapped or paused by the caller.
pub struct StillSource {
    frame: Mutex<Option<Arc<Frame>>>,
    playing: AtomicBool,
}

impl StillSource {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame: Mutex::new(Some(Arc::new(frame))),
            playing: AtomicBool::new(true),
        }
    }

    /// A playing source that has not produced a frame yet.
    pub fn empty() -> Self {
        Self {
            frame: Mutex::new(None),
            playing: AtomicBool::new(true),
        }
    }

    pub fn set_frame(&self, frame: Frame) {
        if let Ok(mut slot) = self.frame.lock() {
            *slot = Some(Arc::new(frame));
        }
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }
}

impl FrameSource for StillSource {
    fn get_frame(&self) -> Option<Arc<Frame>> {
        self.frame.lock().ok()?.clone()
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}
