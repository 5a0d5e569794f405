use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

use zone_sentinel::detect::StubBackend;
use zone_sentinel::gateway::{router, AppState};
use zone_sentinel::ingest::rtsp::SyntheticSource;
use zone_sentinel::ingest::RtspConfig;
use zone_sentinel::{
    BBox, Detection, Detector, Frame, LatestFrameSource, MonitorSettings, MonitoringLoop,
    NotificationHub, ShutdownSignal, SnapshotWriter, SqliteViolationStore, Violation,
    ViolationLedger, ZoneIndex,
};

struct Harness {
    app: Router,
    hub: Arc<NotificationHub>,
    ledger: Arc<ViolationLedger>,
    snapshots: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(Detector::with_default_backends())
}

fn harness_with(detector: Detector) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sentinel.db");
    let store = Arc::new(SqliteViolationStore::open(db.to_str().unwrap()).unwrap());
    let ledger = Arc::new(ViolationLedger::new(store));
    let hub = Arc::new(NotificationHub::new(ledger.clone()));
    let zones = Arc::new(ZoneIndex::open(dir.path().join("zones.json")).unwrap());
    let detector = Arc::new(detector);
    let snapshots = dir.path().join("violations");
    let scene = SyntheticSource::new(RtspConfig {
        url: "stub://gateway".to_string(),
        target_fps: 30,
        width: 160,
        height: 120,
    });
    let source = Arc::new(LatestFrameSource::spawn(Box::new(scene), 30).unwrap());
    let monitor = Arc::new(MonitoringLoop::new(
        source.clone(),
        detector.clone(),
        zones.clone(),
        hub.clone(),
        SnapshotWriter::new(&snapshots).unwrap(),
        MonitorSettings::default(),
        ShutdownSignal::new(),
    ));
    let app = router(AppState {
        hub: hub.clone(),
        monitor,
        detector,
        zones,
        source,
    });
    Harness {
        app,
        hub,
        ledger,
        snapshots,
        _dir: dir,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn call_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = call(app, method, uri, body).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn seeded_violation(h: &Harness) -> Violation {
    let image = h.snapshots.join("seed.jpg");
    Frame::filled(8, 8, [200, 10, 10])
        .to_rgb_image()
        .unwrap()
        .save_with_format(&image, image::ImageFormat::Jpeg)
        .unwrap();
    let v = Violation::new(
        "zone-1",
        "Gate",
        Detection::person(BBox::new(1, 1, 6, 6), 0.9),
        image,
        zone_sentinel::now_local(),
    );
    h.ledger.record(&v);
    v
}

#[tokio::test]
async fn health_and_status() {
    let h = harness();
    let (status, body) = call_json(&h.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call_json(&h.app, "GET", "/api/monitoring/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_monitoring"], false);
    assert_eq!(body["pending_violations"], 0);
}

#[tokio::test]
async fn zone_crud_and_validation() {
    let h = harness();
    let square = json!({
        "name": "Dock",
        "points": [{"x": 0, "y": 0}, {"x": 100, "y": 0}, {"x": 100, "y": 100}, {"x": 0, "y": 100}]
    });
    let (status, zone) = call_json(&h.app, "POST", "/api/zones", Some(square)).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = zone["id"].as_str().unwrap().to_string();

    let bad = json!({ "name": "Line", "points": [{"x": 0, "y": 0}, {"x": 1, "y": 1}] });
    let (status, body) = call_json(&h.app, "POST", "/api/zones", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, zone) = call_json(
        &h.app,
        "PUT",
        &format!("/api/zones/{}", id),
        Some(json!({ "name": "Dock 2" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(zone["name"], "Dock 2");

    let (_, zones) = call_json(&h.app, "GET", "/api/zones", None).await;
    assert_eq!(zones.as_array().map(Vec::len), Some(1));

    let (status, _) = call_json(&h.app, "DELETE", &format!("/api/zones/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call_json(&h.app, "GET", &format!("/api/zones/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn http_response_resolves_once() {
    let h = harness();
    let v = seeded_violation(&h);
    let answer = json!({ "violation_id": v.id, "response": false });

    let (status, _) =
        call_json(&h.app, "POST", "/api/notifications/response", Some(answer.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call_json(&h.app, "POST", "/api/notifications/response", Some(answer)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, stored) = call_json(&h.app, "GET", &format!("/api/violations/{}", v.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["status"], "false_positive");
    assert_eq!(stored["operator_id"], "http_client");
}

#[tokio::test]
async fn violation_listing_filters_and_exports() {
    let h = harness();
    let v = seeded_violation(&h);
    seeded_violation(&h);
    h.ledger
        .resolve(&v.id, zone_sentinel::ViolationStatus::Confirmed, Some("op"))
        .unwrap();

    let (status, body) = call_json(&h.app, "GET", "/api/violations?status=pending", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["violations"].as_array().map(Vec::len), Some(1));

    let (status, _) = call_json(&h.app, "GET", "/api/violations?status=maybe", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, stats) = call_json(&h.app, "GET", "/api/violations/statistics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!((stats["total"].as_u64(), stats["confirmed"].as_u64()), (Some(2), Some(1)));

    let (status, csv) = call(&h.app, "GET", "/api/violations/export?format=csv", None).await;
    assert_eq!(status, StatusCode::OK);
    let csv = String::from_utf8(csv).unwrap();
    assert_eq!(csv.split("\r\n").filter(|l| !l.is_empty()).count(), 3);

    let (status, _) = call(&h.app, "GET", "/api/violations/export?format=xml", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&h.app, "GET", "/api/violations/statistics?start_date=soon", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn image_and_delete() {
    let h = harness();
    let v = seeded_violation(&h);

    let (status, bytes) = call(&h.app, "GET", &format!("/api/violations/{}/image", v.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

    let (status, _) = call(&h.app, "DELETE", &format!("/api/violations/{}", v.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!v.image_path.exists());

    let (status, _) = call(&h.app, "GET", &format!("/api/violations/{}", v.id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&h.app, "DELETE", &format!("/api/violations/{}", v.id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn model_switching_and_thresholds() {
    let h = harness();
    let (status, models) = call_json(&h.app, "GET", "/api/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(models.as_array().map(Vec::len), Some(2));

    let (status, _) =
        call_json(&h.app, "POST", "/api/models/set", Some(json!({ "model": "stub" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) =
        call_json(&h.app, "POST", "/api/models/set", Some(json!({ "model": "yolo-huge" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, info) = call_json(&h.app, "GET", "/api/models/current", None).await;
    assert_eq!(info["model"], "stub");
    assert_eq!(info["loaded"], true);

    let (status, _) = call_json(
        &h.app,
        "POST",
        "/api/models/config",
        Some(json!({ "confidence_threshold": 1.4 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, body) = call_json(
        &h.app,
        "POST",
        "/api/models/config",
        Some(json!({ "confidence_threshold": 0.7, "iou_threshold": 0.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!((body["confidence_threshold"].as_f64().unwrap() - 0.7).abs() < 1e-6);
}

#[tokio::test]
async fn monitoring_switch() {
    let h = harness();
    let (status, body) = call_json(&h.app, "POST", "/api/monitoring/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    let (_, body) = call_json(&h.app, "GET", "/api/monitoring/status", None).await;
    assert_eq!(body["is_monitoring"], true);

    let (status, _) = call_json(&h.app, "POST", "/api/monitoring/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call_json(&h.app, "GET", "/api/monitoring/status", None).await;
    assert_eq!(body["is_monitoring"], false);
}

async fn violation_total(app: &Router) -> u64 {
    let (_, body) = call_json(app, "GET", "/api/violations", None).await;
    body["total"].as_u64().unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_playback_raises_no_violations() {
    let mut detector = Detector::new();
    detector.register("scripted", || {
        Ok(Box::new(StubBackend::repeating(vec![Detection::person(
            BBox::new(20, 20, 60, 90),
            0.9,
        )])))
    });
    detector.swap_model("scripted").unwrap();
    let h = harness_with(detector);

    let yard = json!({
        "name": "Yard",
        "points": [{"x": 0, "y": 0}, {"x": 160, "y": 0}, {"x": 160, "y": 120}, {"x": 0, "y": 120}]
    });
    let (status, _) = call_json(&h.app, "POST", "/api/zones", Some(yard)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call_json(&h.app, "POST", "/api/video/control?action=pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["playing"], false);

    call_json(&h.app, "POST", "/api/monitoring/start", None).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(violation_total(&h.app).await, 0);

    let (status, _) = call_json(&h.app, "POST", "/api/video/control?action=play", None).await;
    assert_eq!(status, StatusCode::OK);
    let deadline = Instant::now() + Duration::from_secs(5);
    while violation_total(&h.app).await == 0 {
        assert!(Instant::now() < deadline, "no violation after resuming playback");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    call_json(&h.app, "POST", "/api/monitoring/stop", None).await;

    let (status, info) = call_json(&h.app, "GET", "/api/video/info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["playing"], true);
    assert_eq!(info["source"], "stub://gateway");
    assert!(info["frames_captured"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn video_control_rejects_unknown_action() {
    let h = harness();
    let (status, body) = call_json(&h.app, "POST", "/api/video/control?action=rewind", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, body) = call_json(&h.app, "POST", "/api/video/control?action=stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["playing"], false);
}

#[tokio::test]
async fn test_notification_reaches_observers_without_recording() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.hub.register("console", tx);

    let (status, body) = call_json(&h.app, "POST", "/api/notifications/test", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sent_to"], json!(["console"]));

    let notice: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(notice["type"], "violation");
    assert_eq!(notice["violation_id"], body["violation_id"]);
    assert_eq!(violation_total(&h.app).await, 0);
}
