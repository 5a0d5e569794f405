use std::path::PathBuf;

use chrono::NaiveDateTime;

use zone_sentinel::storage::{DateRange, ViolationFilter, EXPORT_LIMIT};
use zone_sentinel::violation::StatusUpdate;
use zone_sentinel::{
    BBox, Detection, InMemoryViolationStore, SqliteViolationStore, Violation, ViolationStatus,
    ViolationStore,
};

fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(
        &format!("2024-05-{:02}T{:02}:30:00", day, hour),
        "%Y-%m-%dT%H:%M:%S",
    )
    .unwrap()
}

fn violation(zone: &str, ts: NaiveDateTime) -> Violation {
    Violation::new(
        zone,
        &format!("Zone {}", zone),
        Detection::person(BBox::new(10, 20, 110, 220), 0.8),
        PathBuf::from(format!("data/violations/{}.jpg", ts.format("%d%H"))),
        ts,
    )
}

fn resolve(store: &dyn ViolationStore, v: &Violation, status: ViolationStatus) {
    let mut resolved = v.clone();
    assert!(resolved.resolve(status, Some("op-7"), v.timestamp + chrono::Duration::minutes(1)));
    let update = StatusUpdate::from_violation(&resolved).unwrap();
    assert!(store.update_status(&update).unwrap());
}

fn seed(store: &dyn ViolationStore) -> Vec<Violation> {
    let rows = vec![
        violation("north", at(1, 8)),
        violation("north", at(1, 9)),
        violation("south", at(2, 10)),
        violation("north", at(3, 11)),
        violation("south", at(4, 12)),
    ];
    for v in &rows {
        store.insert_or_replace(v).unwrap();
    }
    resolve(store, &rows[0], ViolationStatus::Confirmed);
    resolve(store, &rows[2], ViolationStatus::FalsePositive);
    rows
}

fn stores() -> (tempfile::TempDir, Vec<Box<dyn ViolationStore>>) {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("violations.db");
    let stores: Vec<Box<dyn ViolationStore>> = vec![
        Box::new(SqliteViolationStore::open(db.to_str().unwrap()).unwrap()),
        Box::new(SqliteViolationStore::open(":memory:").unwrap()),
        Box::new(InMemoryViolationStore::new()),
    ];
    (dir, stores)
}

#[test]
fn query_and_count_agree_for_every_filter() {
    let (_dir, stores) = stores();
    for store in &stores {
        seed(store.as_ref());
        let filters = [
            ViolationFilter::default(),
            ViolationFilter {
                zone_id: Some("north".into()),
                ..ViolationFilter::default()
            },
            ViolationFilter {
                status: Some(ViolationStatus::Pending),
                ..ViolationFilter::default()
            },
            ViolationFilter {
                zone_id: Some("south".into()),
                status: Some(ViolationStatus::FalsePositive),
                ..ViolationFilter::default()
            },
            ViolationFilter::from(DateRange::parse(Some("2024-05-02"), Some("2024-05-03")).unwrap()),
        ];
        let expected = [5, 3, 3, 1, 2];
        for (filter, want) in filters.iter().zip(expected) {
            let rows = store.query(filter, 100, 0).unwrap();
            assert_eq!(rows.len() as u64, store.count(filter).unwrap(), "{filter:?}");
            assert_eq!(rows.len(), want, "{filter:?}");
        }
    }
}

#[test]
fn query_is_newest_first_and_paged() {
    let (_dir, stores) = stores();
    for store in &stores {
        let rows = seed(store.as_ref());
        let all = store.query(&ViolationFilter::default(), 100, 0).unwrap();
        let stamps: Vec<_> = all.iter().map(|v| v.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(stamps, sorted);
        assert_eq!(all[0].id, rows[4].id);

        let page = store.query(&ViolationFilter::default(), 2, 2).unwrap();
        assert_eq!(
            page.iter().map(|v| v.id.clone()).collect::<Vec<_>>(),
            vec![all[2].id.clone(), all[3].id.clone()]
        );
    }
}

#[test]
fn statistics_and_audit_rows() {
    let (_dir, stores) = stores();
    for store in &stores {
        let rows = seed(store.as_ref());
        let stats = store.statistics(&DateRange::default()).unwrap();
        assert_eq!(
            (stats.total, stats.confirmed, stats.false_positive, stats.pending),
            (5, 1, 1, 3)
        );
        let day_one = store
            .statistics(&DateRange::parse(Some("2024-05-01"), Some("2024-05-01")).unwrap())
            .unwrap();
        assert_eq!((day_one.total, day_one.confirmed), (2, 1));

        let stored = store.get_by_id(&rows[0].id).unwrap().unwrap();
        assert_eq!(stored.status, ViolationStatus::Confirmed);
        assert_eq!(stored.operator_id.as_deref(), Some("op-7"));
        assert_eq!(stored.operator_response, Some(true));
        assert_eq!(stored.detection, rows[0].detection);

        let audit = store.responses(&rows[0].id).unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].response);

        assert!(store.delete(&rows[0].id).unwrap());
        assert!(!store.delete(&rows[0].id).unwrap());
        assert!(store.get_by_id(&rows[0].id).unwrap().is_none());
        assert!(store.responses(&rows[0].id).unwrap().is_empty());
    }
}

#[test]
fn update_of_unknown_id_reports_false() {
    let (_dir, stores) = stores();
    for store in &stores {
        let mut ghost = violation("north", at(1, 1));
        ghost.resolve(ViolationStatus::Confirmed, None, at(1, 2));
        let update = StatusUpdate::from_violation(&ghost).unwrap();
        assert!(!store.update_status(&update).unwrap());
    }
}

#[test]
fn exports_respect_the_date_range() {
    let (_dir, stores) = stores();
    for store in &stores {
        seed(store.as_ref());
        let range = DateRange::parse(Some("2024-05-02"), None).unwrap();

        let csv = store.export_csv(&range).unwrap();
        let lines: Vec<&str> = csv.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 1 + 3);
        assert!(lines[0].starts_with("ID,Zone ID,Zone Name,Timestamp,Status"));
        assert!(csv.contains("false_positive"));

        let json: serde_json::Value = serde_json::from_str(&store.export_json(&range).unwrap()).unwrap();
        assert_eq!(json.as_array().map(Vec::len), Some(3));
    }
    assert_eq!(EXPORT_LIMIT, 10_000);
}

#[test]
fn system_events_are_newest_first() {
    let (_dir, stores) = stores();
    for store in &stores {
        store.log_system_event("startup", "daemon started", None).unwrap();
        let meta = serde_json::json!({ "violation_id": "v1", "response": true });
        store
            .log_system_event("operator_response", "op answered", Some(&meta))
            .unwrap();
        let events = store.system_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "operator_response");
        assert_eq!(events[0].metadata.as_ref(), Some(&meta));
        assert_eq!(events[1].metadata, None);
    }
}
