//! Restricted zones: storage, validation and containment queries.
//!
//! Zones are kept in memory behind a mutex and mirrored to a JSON file keyed by
//! zone id. Every mutation validates the polygon first, writes the whole table
//! to a temporary file and renames it over the previous one, and only then
//! commits the change in memory. A failed write leaves both copies untouched.

mod geometry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::error::SentinelError;

pub use geometry::{bbox_intersects_zone, check_violations, point_in_polygon, Point, ZoneMatch};

pub const MIN_ZONE_POINTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub points: Vec<Point>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Partial update; `None` fields keep their current value.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ZoneUpdate {
    pub name: Option<String>,
    pub points: Option<Vec<Point>>,
}

pub struct ZoneIndex {
    zones: Mutex<BTreeMap<String, Zone>>,
    storage_path: Option<PathBuf>,
}

impl ZoneIndex {
    /// Open the zone table at `path`, creating the parent directory when the
    /// file does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let zones = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read zones file {}", path.display()))?;
            serde_json::from_str::<BTreeMap<String, Zone>>(&raw)
                .with_context(|| format!("invalid zones file {}", path.display()))?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            BTreeMap::new()
        };
        log::info!("loaded {} zone(s) from {}", zones.len(), path.display());
        Ok(Self {
            zones: Mutex::new(zones),
            storage_path: Some(path),
        })
    }

    /// Zone table that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            zones: Mutex::new(BTreeMap::new()),
            storage_path: None,
        }
    }

    pub fn create(&self, name: &str, points: Vec<Point>) -> Result<Zone> {
        validate_name(name)?;
        validate_points(&points)?;

        let now = crate::now_local();
        let zone = Zone {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            points,
            created_at: now,
            updated_at: now,
        };

        self.mutate(|zones| {
            zones.insert(zone.id.clone(), zone.clone());
            Ok(())
        })?;
        log::info!("zone {} ({}) created", zone.id, zone.name);
        Ok(zone)
    }

    /// Returns `Ok(None)` when `id` is unknown.
    pub fn update(&self, id: &str, update: ZoneUpdate) -> Result<Option<Zone>> {
        if let Some(name) = update.name.as_deref() {
            validate_name(name)?;
        }
        if let Some(points) = update.points.as_deref() {
            validate_points(points)?;
        }

        let updated = self.mutate(|zones| {
            let Some(zone) = zones.get_mut(id) else {
                return Ok(None);
            };
            if let Some(name) = update.name {
                zone.name = name.trim().to_string();
            }
            if let Some(points) = update.points {
                zone.points = points;
            }
            zone.updated_at = crate::now_local();
            Ok(Some(zone.clone()))
        })?;
        if let Some(zone) = &updated {
            log::info!("zone {} ({}) updated", zone.id, zone.name);
        }
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.mutate(|zones| Ok(zones.remove(id).is_some()))?;
        if removed {
            log::info!("zone {} deleted", id);
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Zone> {
        self.lock().ok()?.get(id).cloned()
    }

    /// Snapshot of every zone, ordered by id.
    pub fn all(&self) -> Vec<Zone> {
        match self.lock() {
            Ok(zones) => zones.values().cloned().collect(),
            Err(e) => {
                log::error!("{}", e);
                Vec::new()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|zones| zones.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Containment check against a snapshot of the current zones.
    pub fn check_violations(&self, detections: &[Detection]) -> Vec<ZoneMatch> {
        let zones = self.all();
        check_violations(detections, &zones)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Zone>>> {
        self.zones
            .lock()
            .map_err(|_| anyhow!("zone table lock poisoned"))
    }

    /// Apply `f` to a copy of the table, persist the copy, then swap it in.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Zone>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.storage_path {
            write_zones_file(path, &next)?;
        }
        *guard = next;
        Ok(out)
    }
}

fn write_zones_file(path: &Path, zones: &BTreeMap<String, Zone>) -> Result<()> {
    let json = serde_json::to_vec_pretty(zones)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .with_context(|| format!("failed to write zones file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace zones file {}", path.display()))?;
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SentinelError::configuration("zone name must not be empty").into());
    }
    Ok(())
}

fn validate_points(points: &[Point]) -> Result<()> {
    if points.len() < MIN_ZONE_POINTS {
        return Err(SentinelError::configuration(format!(
            "zone needs at least {} points, got {}",
            MIN_ZONE_POINTS,
            points.len()
        ))
        .into());
    }
    if let Some(p) = points.iter().find(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(SentinelError::configuration(format!(
            "zone point ({}, {}) is not finite",
            p.x, p.y
        ))
        .into());
    }
    Ok(())
}
