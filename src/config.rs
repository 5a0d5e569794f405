use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SentinelError;
use crate::ingest::RtspConfig;
use crate::monitor::MonitorSettings;

const DEFAULT_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_MODEL: &str = "motion";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_ONNX_INPUT: u32 = 640;
const DEFAULT_DEBOUNCE_SECS: f64 = 5.0;
const DEFAULT_DETECTION_FPS: u32 = 10;
const DEFAULT_STOP_TIMEOUT_SECS: f64 = 2.0;
const DEFAULT_DB_PATH: &str = "data/database.db";
const DEFAULT_VIOLATIONS_PATH: &str = "data/violations";
const DEFAULT_ZONES_PATH: &str = "data/zones.json";
const DEFAULT_VIDEO_SOURCE: &str = "stub://camera";
const DEFAULT_VIDEO_FPS: u32 = 30;
const DEFAULT_VIDEO_WIDTH: u32 = 640;
const DEFAULT_VIDEO_HEIGHT: u32 = 480;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    server: Option<ServerConfigFile>,
    detection: Option<DetectionConfigFile>,
    monitoring: Option<MonitoringConfigFile>,
    storage: Option<StorageConfigFile>,
    video: Option<VideoConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    model: Option<String>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    onnx_models: Option<Vec<PathBuf>>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MonitoringConfigFile {
    debounce_secs: Option<f64>,
    detection_fps: Option<u32>,
    stop_timeout_secs: Option<f64>,
    autostart: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    db_path: Option<String>,
    violations_path: Option<PathBuf>,
    zones_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    source: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub addr: String,
    pub detection: DetectionSettings,
    pub monitoring: MonitoringSettings,
    pub storage: StorageSettings,
    pub video: VideoSettings,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// Model activated at startup.
    pub model: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// ONNX files registered as models, named by file stem.
    pub onnx_models: Vec<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
}

#[derive(Debug, Clone)]
pub struct MonitoringSettings {
    pub debounce_secs: f64,
    pub detection_fps: u32,
    pub stop_timeout_secs: f64,
    pub autostart: bool,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub db_path: String,
    pub violations_path: PathBuf,
    pub zones_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub source: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl SentinelConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Self {
        let server = file.server.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let monitoring = file.monitoring.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let video = file.video.unwrap_or_default();

        Self {
            addr: server.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            detection: DetectionSettings {
                model: detection.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                confidence_threshold: detection.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
                iou_threshold: detection.iou_threshold.unwrap_or(DEFAULT_IOU),
                onnx_models: detection.onnx_models.unwrap_or_default(),
                input_width: detection.input_width.unwrap_or(DEFAULT_ONNX_INPUT),
                input_height: detection.input_height.unwrap_or(DEFAULT_ONNX_INPUT),
            },
            monitoring: MonitoringSettings {
                debounce_secs: monitoring.debounce_secs.unwrap_or(DEFAULT_DEBOUNCE_SECS),
                detection_fps: monitoring.detection_fps.unwrap_or(DEFAULT_DETECTION_FPS),
                stop_timeout_secs: monitoring
                    .stop_timeout_secs
                    .unwrap_or(DEFAULT_STOP_TIMEOUT_SECS),
                autostart: monitoring.autostart.unwrap_or(true),
            },
            storage: StorageSettings {
                db_path: storage
                    .db_path
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
                violations_path: storage
                    .violations_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_VIOLATIONS_PATH)),
                zones_path: storage
                    .zones_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ZONES_PATH)),
            },
            video: VideoSettings {
                source: video
                    .source
                    .unwrap_or_else(|| DEFAULT_VIDEO_SOURCE.to_string()),
                fps: video.fps.unwrap_or(DEFAULT_VIDEO_FPS),
                width: video.width.unwrap_or(DEFAULT_VIDEO_WIDTH),
                height: video.height.unwrap_or(DEFAULT_VIDEO_HEIGHT),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("SENTINEL_ADDR") {
            self.addr = addr;
        }
        if let Some(model) = non_empty_env("SENTINEL_MODEL") {
            self.detection.model = model;
        }
        if let Some(models) = non_empty_env("SENTINEL_ONNX_MODELS") {
            self.detection.onnx_models = split_csv(&models).into_iter().map(PathBuf::from).collect();
        }
        if let Some(value) = non_empty_env("SENTINEL_CONFIDENCE") {
            self.detection.confidence_threshold = value
                .parse()
                .map_err(|_| anyhow!("SENTINEL_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Some(value) = non_empty_env("SENTINEL_DEBOUNCE_SECS") {
            self.monitoring.debounce_secs = value
                .parse()
                .map_err(|_| anyhow!("SENTINEL_DEBOUNCE_SECS must be a number of seconds"))?;
        }
        if let Some(value) = non_empty_env("SENTINEL_DETECTION_FPS") {
            self.monitoring.detection_fps = value
                .parse()
                .map_err(|_| anyhow!("SENTINEL_DETECTION_FPS must be a positive integer"))?;
        }
        if let Some(path) = non_empty_env("SENTINEL_DB_PATH") {
            self.storage.db_path = path;
        }
        if let Some(source) = non_empty_env("SENTINEL_SOURCE") {
            self.video.source = source;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("confidence_threshold", self.detection.confidence_threshold),
            ("iou_threshold", self.detection.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{} {} is outside [0, 1]", label, value)));
            }
        }
        if self.monitoring.detection_fps == 0 {
            return Err(invalid("detection_fps must be at least 1"));
        }
        if self.video.fps == 0 {
            return Err(invalid("video fps must be at least 1"));
        }
        let debounce = self.monitoring.debounce_secs;
        if !debounce.is_finite() || debounce < 0.0 {
            return Err(invalid("debounce_secs must be a non-negative number"));
        }
        let stop_timeout = self.monitoring.stop_timeout_secs;
        if !stop_timeout.is_finite() || stop_timeout <= 0.0 {
            return Err(invalid("stop_timeout_secs must be greater than zero"));
        }
        if self.video.width == 0 || self.video.height == 0 {
            return Err(invalid("video width and height must be non-zero"));
        }
        if self.detection.input_width == 0 || self.detection.input_height == 0 {
            return Err(invalid("model input width and height must be non-zero"));
        }
        self.addr
            .parse::<SocketAddr>()
            .map_err(|_| invalid(format!("server address {} is not host:port", self.addr)))?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|_| anyhow!("invalid server address {}", self.addr))
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            detection_fps: self.monitoring.detection_fps,
            debounce: Duration::from_secs_f64(self.monitoring.debounce_secs),
            stop_timeout: Duration::from_secs_f64(self.monitoring.stop_timeout_secs),
        }
    }

    pub fn rtsp_config(&self) -> RtspConfig {
        RtspConfig {
            url: self.video.source.clone(),
            target_fps: self.video.fps,
            width: self.video.width,
            height: self.video.height,
        }
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    SentinelError::configuration(message).into()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
