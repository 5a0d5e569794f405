//! JSON messages exchanged with observers.

use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::violation::Violation;

/// Outbound violation notice.
#[derive(Debug, Serialize)]
pub struct ViolationNotice<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub violation_id: &'a str,
    pub timestamp: String,
    pub zone_id: &'a str,
    pub zone_name: &'a str,
    pub detection: &'a Detection,
    /// Base64 JPEG, or null when the snapshot could not be read.
    pub image: Option<String>,
    pub image_url: String,
}

impl<'a> ViolationNotice<'a> {
    pub fn new(violation: &'a Violation, image: Option<String>) -> Self {
        Self {
            kind: "violation",
            violation_id: &violation.id,
            timestamp: crate::format_timestamp(&violation.timestamp),
            zone_id: &violation.zone_id,
            zone_name: &violation.zone_name,
            detection: &violation.detection,
            image,
            image_url: violation.image_url(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SystemNotice<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message_type: &'a str,
    pub message: &'a str,
    pub timestamp: String,
}

impl<'a> SystemNotice<'a> {
    pub fn new(message: &'a str, message_type: &'a str) -> Self {
        Self {
            kind: "system",
            message_type,
            message,
            timestamp: crate::format_timestamp(&crate::now_local()),
        }
    }
}

/// Inbound observer message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    Response {
        #[serde(alias = "violationId")]
        violation_id: String,
        response: bool,
    },
    Ping,
}

pub const PONG: &str = r#"{"type":"pong"}"#;
