use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::detect::{BBox, Detection, ModelInfo};
use crate::ingest::CaptureStats;
use crate::monitor::MonitorStatus;
use crate::notify::HTTP_OBSERVER_ID;
use crate::storage::{DateRange, ViolationFilter, ViolationStats};
use crate::violation::{Violation, ViolationStatus};
use crate::zone::{Point, ZoneUpdate};

use super::error::{blocking, ApiError, ApiResult};
use super::AppState;

const DEFAULT_PAGE_SIZE: usize = 100;

// -------------------- Status --------------------

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn api_status() -> Json<Value> {
    Json(json!({
        "status": "running",
        "timestamp": crate::format_timestamp(&crate::now_local()),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// -------------------- Notifications --------------------

#[derive(Debug, Deserialize)]
pub struct ResponseBody {
    pub violation_id: String,
    pub response: bool,
}

/// HTTP fallback for observers without a socket.
pub async fn notification_response(
    State(state): State<AppState>,
    Json(body): Json<ResponseBody>,
) -> ApiResult<Json<Value>> {
    let hub = Arc::clone(&state.hub);
    let violation_id = body.violation_id.clone();
    let routed = blocking(move || {
        Ok(hub.route_response(HTTP_OBSERVER_ID, &body.violation_id, body.response))
    })
    .await?;
    if !routed {
        return Err(ApiError::not_found(format!(
            "violation {} not found or already resolved",
            violation_id
        )));
    }
    Ok(Json(json!({
        "message": "response recorded",
        "violation_id": violation_id,
    })))
}

pub async fn notification_clients(State(state): State<AppState>) -> Json<Value> {
    let clients = state.hub.connected_observers();
    Json(json!({
        "total": clients.len(),
        "connected_clients": clients,
    }))
}

/// Broadcast a synthetic violation so operators can check their link. The
/// notice is not recorded and cannot be answered.
pub async fn notification_test(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let store = Arc::clone(state.hub.ledger().store());
    let latest = blocking(move || store.query(&ViolationFilter::default(), 1, 0)).await?;
    let image_path = latest
        .into_iter()
        .next()
        .map(|v| v.image_path)
        .unwrap_or_default();
    let notice = Violation::new(
        "test",
        "Test notification",
        Detection::person(BBox::new(100, 100, 300, 400), 0.95),
        image_path,
        crate::now_local(),
    );
    let sent_to = state.hub.broadcast(&notice).await;
    Ok(Json(json!({
        "message": "test notification sent",
        "violation_id": notice.id,
        "sent_to": sent_to,
    })))
}

// -------------------- Violations --------------------

#[derive(Debug, Default, Deserialize)]
pub struct ViolationQuery {
    pub status: Option<String>,
    pub zone_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl RangeQuery {
    fn range(&self) -> Result<DateRange, ApiError> {
        Ok(DateRange::parse(
            self.start_date.as_deref(),
            self.end_date.as_deref(),
        )?)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
    #[serde(flatten)]
    pub range: RangeQuery,
}

pub async fn list_violations(
    State(state): State<AppState>,
    Query(q): Query<ViolationQuery>,
) -> ApiResult<Json<Value>> {
    let status = q
        .status
        .as_deref()
        .map(|s| {
            s.parse::<ViolationStatus>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))
        })
        .transpose()?;
    let filter = ViolationFilter {
        zone_id: q.zone_id.clone(),
        status,
        range: DateRange::parse(q.start_date.as_deref(), q.end_date.as_deref())?,
    };
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let offset = q.offset.unwrap_or(0);

    let store = Arc::clone(state.hub.ledger().store());
    let (violations, total) = blocking(move || {
        let violations = store.query(&filter, limit, offset)?;
        let total = store.count(&filter)?;
        Ok((violations, total))
    })
    .await?;
    Ok(Json(json!({ "violations": violations, "total": total })))
}

pub async fn violation_statistics(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> ApiResult<Json<ViolationStats>> {
    let range = q.range()?;
    let store = Arc::clone(state.hub.ledger().store());
    Ok(Json(blocking(move || store.statistics(&range)).await?))
}

pub async fn export_violations(
    State(state): State<AppState>,
    Query(q): Query<ExportQuery>,
) -> ApiResult<impl IntoResponse> {
    let range = q.range.range()?;
    let format = q.format.unwrap_or_else(|| "csv".to_string());
    let store = Arc::clone(state.hub.ledger().store());
    let (body, content_type, file_name) = match format.as_str() {
        "csv" => (
            blocking(move || store.export_csv(&range)).await?,
            "text/csv; charset=utf-8",
            "violations_export.csv",
        ),
        "json" => (
            blocking(move || store.export_json(&range)).await?,
            "application/json",
            "violations_export.json",
        ),
        other => {
            return Err(ApiError::BadRequest(format!(
                "unsupported export format '{}', expected csv or json",
                other
            )))
        }
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        body,
    ))
}

pub async fn get_violation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Violation>> {
    let ledger = Arc::clone(state.hub.ledger());
    let lookup = id.clone();
    match blocking(move || ledger.get(&lookup)).await? {
        Some(v) => Ok(Json(v)),
        None => Err(ApiError::not_found(format!("violation {} not found", id))),
    }
}

pub async fn violation_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let ledger = Arc::clone(state.hub.ledger());
    let lookup = id.clone();
    let Some(violation) = blocking(move || ledger.get(&lookup)).await? else {
        return Err(ApiError::not_found(format!("violation {} not found", id)));
    };
    let bytes = tokio::fs::read(&violation.image_path).await.map_err(|_| {
        ApiError::not_found(format!("snapshot for violation {} not found", id))
    })?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes))
}

/// Administrative removal of a record, its audit rows and its snapshot.
pub async fn delete_violation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let ledger = Arc::clone(state.hub.ledger());
    let target = id.clone();
    let removed = blocking(move || {
        let existing = ledger.get(&target)?;
        if !ledger.delete(&target)? {
            return Ok(None);
        }
        Ok(Some(existing.map(|v| v.image_path)))
    })
    .await?;
    let Some(image_path) = removed else {
        return Err(ApiError::not_found(format!("violation {} not found", id)));
    };
    if let Some(path) = image_path {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            log::warn!("could not remove snapshot {}: {}", path.display(), e);
        }
    }
    log::info!("violation {} deleted", id);
    Ok(Json(json!({ "message": "violation deleted", "violation_id": id })))
}

// -------------------- Monitoring --------------------

pub async fn monitoring_start(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let monitor = Arc::clone(&state.monitor);
    blocking(move || monitor.start()).await?;
    state.hub.broadcast_system_message("monitoring started", "info");
    Ok(Json(json!({ "message": "monitoring started", "status": "running" })))
}

pub async fn monitoring_stop(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let monitor = Arc::clone(&state.monitor);
    blocking(move || {
        monitor.stop();
        Ok(())
    })
    .await?;
    state.hub.broadcast_system_message("monitoring stopped", "info");
    Ok(Json(json!({ "message": "monitoring stopped", "status": "stopped" })))
}

pub async fn monitoring_status(State(state): State<AppState>) -> ApiResult<Json<MonitorStatus>> {
    let monitor = Arc::clone(&state.monitor);
    Ok(Json(blocking(move || Ok(monitor.status())).await?))
}

// -------------------- Video --------------------

#[derive(Debug, Deserialize)]
pub struct VideoControl {
    pub action: String,
}

pub async fn video_control(
    State(state): State<AppState>,
    Query(q): Query<VideoControl>,
) -> ApiResult<Json<Value>> {
    let message = match q.action.as_str() {
        "play" => {
            state.source.play();
            "playback started"
        }
        "pause" => {
            state.source.pause();
            "playback paused"
        }
        "stop" => {
            state.source.halt();
            "playback stopped"
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown action '{}', expected play, pause or stop",
                other
            )))
        }
    };
    log::info!("video {}", q.action);
    Ok(Json(json!({ "message": message, "info": state.source.stats() })))
}

pub async fn video_info(State(state): State<AppState>) -> Json<CaptureStats> {
    Json(state.source.stats())
}

// -------------------- Zones --------------------

#[derive(Debug, Deserialize)]
pub struct ZoneCreate {
    pub name: String,
    pub points: Vec<Point>,
}

pub async fn list_zones(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.zones.all()))
}

pub async fn create_zone(
    State(state): State<AppState>,
    Json(body): Json<ZoneCreate>,
) -> ApiResult<impl IntoResponse> {
    let zones = Arc::clone(&state.zones);
    let zone = blocking(move || zones.create(&body.name, body.points)).await?;
    Ok((StatusCode::CREATED, Json(zone)))
}

pub async fn get_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    match state.zones.get(&id) {
        Some(zone) => Ok(Json(json!(zone))),
        None => Err(ApiError::not_found(format!("zone {} not found", id))),
    }
}

pub async fn update_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ZoneUpdate>,
) -> ApiResult<Json<Value>> {
    let zones = Arc::clone(&state.zones);
    let target = id.clone();
    match blocking(move || zones.update(&target, body)).await? {
        Some(zone) => Ok(Json(json!(zone))),
        None => Err(ApiError::not_found(format!("zone {} not found", id))),
    }
}

pub async fn delete_zone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let zones = Arc::clone(&state.zones);
    let target = id.clone();
    if !blocking(move || zones.delete(&target)).await? {
        return Err(ApiError::not_found(format!("zone {} not found", id)));
    }
    Ok(Json(json!({ "message": "zone deleted", "zone_id": id })))
}

// -------------------- Models --------------------

#[derive(Debug, Deserialize)]
pub struct SetModelBody {
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelConfigBody {
    pub confidence_threshold: f32,
    pub iou_threshold: Option<f32>,
}

pub async fn list_models(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let detector = Arc::clone(&state.detector);
    let info = blocking(move || Ok(detector.model_info())).await?;
    let models: Vec<Value> = info
        .available
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "active": info.model.as_deref() == Some(name.as_str()),
            })
        })
        .collect();
    Ok(Json(json!(models)))
}

pub async fn current_model(State(state): State<AppState>) -> ApiResult<Json<ModelInfo>> {
    let detector = Arc::clone(&state.detector);
    Ok(Json(blocking(move || Ok(detector.model_info())).await?))
}

pub async fn set_model(
    State(state): State<AppState>,
    Json(body): Json<SetModelBody>,
) -> ApiResult<Json<Value>> {
    let detector = Arc::clone(&state.detector);
    let model = body.model.clone();
    blocking(move || detector.swap_model(&body.model)).await?;
    Ok(Json(json!({ "message": "model loaded", "model": model })))
}

pub async fn set_model_config(
    State(state): State<AppState>,
    Json(body): Json<ModelConfigBody>,
) -> ApiResult<Json<Value>> {
    let detector = Arc::clone(&state.detector);
    let thresholds = blocking(move || {
        let iou = body.iou_threshold.unwrap_or(detector.thresholds().iou);
        detector.set_thresholds(body.confidence_threshold, iou)?;
        Ok(detector.thresholds())
    })
    .await?;
    Ok(Json(json!({
        "message": "thresholds updated",
        "confidence_threshold": thresholds.confidence,
        "iou_threshold": thresholds.iou,
    })))
}
