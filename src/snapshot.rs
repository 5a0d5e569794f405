//! Annotated JPEG snapshots of violating frames.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;

use crate::detect::Detection;
use crate::frame::Frame;

/// Zone ids are shortened to this many characters in file names.
const ZONE_ID_PREFIX_LEN: usize = 8;

pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    /// Writer rooted at `dir`, created if missing.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `frame` with the detection outlined, as
    /// `violation_{YYYYmmdd_HHMMSS_ffffff}_{zone_id[..8]}.jpg`.
    pub fn write(
        &self,
        frame: &Frame,
        detection: &Detection,
        zone_id: &str,
        at: &NaiveDateTime,
    ) -> Result<PathBuf> {
        let path = self.dir.join(snapshot_file_name(zone_id, at));
        let image = frame.annotated(&detection.bbox)?;
        image
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        Ok(path)
    }
}

fn snapshot_file_name(zone_id: &str, at: &NaiveDateTime) -> String {
    let short: String = zone_id.chars().take(ZONE_ID_PREFIX_LEN).collect();
    format!("violation_{}_{}.jpg", at.format("%Y%m%d_%H%M%S_%6f"), short)
}
