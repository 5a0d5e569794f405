//! Zone Sentinel
//!
//! Restricted-zone violation monitoring: frames are sampled from a video
//! source, run through a person detector, tested against operator-defined
//! polygons, and turned into debounced violation records that are persisted
//! and pushed to connected observers for confirmation.
//!
//! # Module Structure
//!
//! - `zone`: polygon storage and containment tests
//! - `detect`: detector backends and the active-model registry
//! - `frame`, `ingest`: decoded frames and the sources that produce them
//! - `violation`, `ledger`, `storage`: violation records, the in-process index
//!   and the durable store
//! - `notify`: observer registry, broadcast and response routing
//! - `monitor`: the sampling loop tying everything together
//! - `gateway`: HTTP/WebSocket surface for observers and operators

use anyhow::Result;
use chrono::NaiveDateTime;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod ingest;
pub mod ledger;
pub mod monitor;
pub mod notify;
pub mod snapshot;
pub mod storage;
pub mod violation;
pub mod zone;

pub use detect::{BBox, Detection, Detector, DetectorBackend, Thresholds};
pub use error::SentinelError;
pub use frame::Frame;
pub use ingest::{FrameProducer, FrameSource, LatestFrameSource, StillSource};
pub use ledger::ViolationLedger;
pub use monitor::{MonitorSettings, MonitoringLoop};
pub use notify::NotificationHub;
pub use snapshot::SnapshotWriter;
pub use storage::{InMemoryViolationStore, SqliteViolationStore, ViolationStore};
pub use violation::{Violation, ViolationStatus};
pub use zone::{Point, Zone, ZoneIndex};

/// Text layout for timestamps stored in SQLite. Lexicographic order matches
/// chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Local wall-clock time, the timestamp basis for zones and violations.
pub fn now_local() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

// -------------------- Shutdown --------------------

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Cooperative stop flag shared by every long-running worker.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early once the signal fires. Returns true
    /// when it did.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
        }
    }
}

// -------------------- SQLite --------------------

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:zone_sentinel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
