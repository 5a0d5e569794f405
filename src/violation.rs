//! Violation records and their status lifecycle.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::detect::Detection;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStatus {
    Pending,
    Confirmed,
    FalsePositive,
}

impl ViolationStatus {
    /// Operator outcome: `true` confirms, `false` dismisses.
    pub fn from_outcome(confirmed: bool) -> Self {
        if confirmed {
            Self::Confirmed
        } else {
            Self::FalsePositive
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::FalsePositive => "false_positive",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ViolationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "false_positive" => Ok(Self::FalsePositive),
            other => Err(anyhow!("unknown violation status '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub zone_id: String,
    pub zone_name: String,
    pub detection: Detection,
    pub image_path: PathBuf,
    pub timestamp: NaiveDateTime,
    pub status: ViolationStatus,
    pub operator_id: Option<String>,
    pub operator_response: Option<bool>,
    pub response_time: Option<NaiveDateTime>,
}

impl Violation {
    /// New pending violation with a fresh id.
    pub fn new(
        zone_id: &str,
        zone_name: &str,
        detection: Detection,
        image_path: PathBuf,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            zone_id: zone_id.to_string(),
            zone_name: zone_name.to_string(),
            detection,
            image_path,
            timestamp,
            status: ViolationStatus::Pending,
            operator_id: None,
            operator_response: None,
            response_time: None,
        }
    }

    /// Move a pending violation to `status`. Returns false, leaving the
    /// record untouched, when it was already resolved or `status` is pending.
    pub fn resolve(
        &mut self,
        status: ViolationStatus,
        operator_id: Option<&str>,
        at: NaiveDateTime,
    ) -> bool {
        if self.status.is_resolved() || !status.is_resolved() {
            return false;
        }
        self.status = status;
        self.operator_id = operator_id.map(str::to_string);
        self.operator_response = Some(status == ViolationStatus::Confirmed);
        self.response_time = Some(at);
        true
    }

    /// Public URL the gateway serves the snapshot under.
    pub fn image_url(&self) -> String {
        format!("/api/violations/{}/image", self.id)
    }
}

/// One status change, as written to the store and its audit table.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub violation_id: String,
    pub status: ViolationStatus,
    pub operator_id: Option<String>,
    pub operator_response: Option<bool>,
    pub response_time: NaiveDateTime,
}

impl StatusUpdate {
    pub fn from_violation(v: &Violation) -> Option<Self> {
        Some(Self {
            violation_id: v.id.clone(),
            status: v.status,
            operator_id: v.operator_id.clone(),
            operator_response: v.operator_response,
            response_time: v.response_time?,
        })
    }
}
