//! Durable violation store.
//!
//! `SqliteViolationStore` is the production store. All writes go through one
//! writer connection under a mutex; file-backed databases get a second
//! connection for reads so queries do not queue behind writes (WAL mode).
//! `InMemoryViolationStore` implements the same contract for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

use crate::detect::{BBox, Detection};
use crate::error::SentinelError;
use crate::violation::{StatusUpdate, Violation, ViolationStatus};
use crate::{format_timestamp, open_db_connection, shared_memory_uri};

/// Upper bound on rows in a single export.
pub const EXPORT_LIMIT: usize = 10_000;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CSV_HEADERS: [&str; 13] = [
    "ID",
    "Zone ID",
    "Zone Name",
    "Timestamp",
    "Status",
    "Operator Response",
    "Operator ID",
    "Response Time",
    "Confidence",
    "BBox X1",
    "BBox Y1",
    "BBox X2",
    "BBox Y2",
];

/// Inclusive timestamp bounds; `None` is unbounded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DateRange {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl DateRange {
    /// Parse optional ISO bounds. A bare date as `start` means the start of
    /// that day; as `end` it means the last microsecond of that day.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        Ok(Self {
            start: start.map(|s| parse_bound(s, false)).transpose()?,
            end: end.map(|s| parse_bound(s, true)).transpose()?,
        })
    }
}

fn parse_bound(raw: &str, end_of_day: bool) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    for layout in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, layout) {
            return Ok(ts);
        }
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        SentinelError::configuration(format!("'{}' is not an ISO date or timestamp", raw))
    })?;
    let ts = if end_of_day {
        day.and_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        day.and_hms_opt(0, 0, 0)
    };
    ts.ok_or_else(|| anyhow!("date {} out of range", raw))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViolationFilter {
    pub zone_id: Option<String>,
    pub status: Option<ViolationStatus>,
    pub range: DateRange,
}

impl ViolationFilter {
    fn matches(&self, v: &Violation) -> bool {
        self.zone_id.as_ref().is_none_or(|z| *z == v.zone_id)
            && self.status.is_none_or(|s| s == v.status)
            && self.range.start.is_none_or(|s| v.timestamp >= s)
            && self.range.end.is_none_or(|e| v.timestamp <= e)
    }
}

impl From<DateRange> for ViolationFilter {
    fn from(range: DateRange) -> Self {
        Self {
            range,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ViolationStats {
    pub total: u64,
    pub confirmed: u64,
    pub false_positive: u64,
    pub pending: u64,
}

/// Audit row written alongside each status update.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperatorResponseRecord {
    pub violation_id: String,
    pub operator_id: Option<String>,
    pub response: bool,
    pub timestamp: NaiveDateTime,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SystemEvent {
    pub event_type: String,
    pub message: String,
    pub timestamp: NaiveDateTime,
    pub metadata: Option<serde_json::Value>,
}

pub trait ViolationStore: Send + Sync {
    fn insert_or_replace(&self, violation: &Violation) -> Result<()>;

    /// Apply a status change and append its audit row. Returns false when no
    /// record has that id.
    fn update_status(&self, update: &StatusUpdate) -> Result<bool>;

    fn get_by_id(&self, id: &str) -> Result<Option<Violation>>;

    /// Remove a record and its audit rows.
    fn delete(&self, id: &str) -> Result<bool>;

    /// Matching records, newest first.
    fn query(&self, filter: &ViolationFilter, limit: usize, offset: usize)
        -> Result<Vec<Violation>>;

    fn count(&self, filter: &ViolationFilter) -> Result<u64>;

    fn statistics(&self, range: &DateRange) -> Result<ViolationStats>;

    fn log_system_event(
        &self,
        event_type: &str,
        message: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()>;

    /// Audit rows for one violation, oldest first.
    fn responses(&self, violation_id: &str) -> Result<Vec<OperatorResponseRecord>>;

    /// Most recent system events, newest first.
    fn system_events(&self, limit: usize) -> Result<Vec<SystemEvent>>;

    fn export_csv(&self, range: &DateRange) -> Result<String> {
        let rows = self.query(&ViolationFilter::from(range.clone()), EXPORT_LIMIT, 0)?;
        Ok(render_csv(&rows))
    }

    fn export_json(&self, range: &DateRange) -> Result<String> {
        let rows = self.query(&ViolationFilter::from(range.clone()), EXPORT_LIMIT, 0)?;
        Ok(serde_json::to_string_pretty(&rows)?)
    }
}

// -------------------- SQLite --------------------

pub struct SqliteViolationStore {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    location: String,
}

impl SqliteViolationStore {
    /// Open (and migrate) the database at `db_path`. `:memory:` and `file:`
    /// URIs are accepted; both use a single connection.
    pub fn open(db_path: &str) -> Result<Self> {
        let location = if db_path == ":memory:" {
            shared_memory_uri()
        } else {
            db_path.to_string()
        };
        let in_memory = location.starts_with("file:");
        if !in_memory {
            if let Some(parent) = Path::new(&location)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let writer = open_db_connection(&location)
            .with_context(|| format!("failed to open database {}", location))?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        ensure_schema(&writer)?;

        let reader = if in_memory {
            None
        } else {
            let conn = open_db_connection(&location)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA query_only = ON;")?;
            Some(Mutex::new(conn))
        };

        Ok(Self {
            writer: Mutex::new(writer),
            reader,
            location,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn write_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| anyhow!("database writer lock poisoned"))
    }

    fn read_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        match &self.reader {
            Some(reader) => reader
                .lock()
                .map_err(|_| anyhow!("database reader lock poisoned")),
            None => self.write_conn(),
        }
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS violations (
          id TEXT PRIMARY KEY,
          zone_id TEXT NOT NULL,
          zone_name TEXT NOT NULL,
          timestamp TEXT NOT NULL,
          image_path TEXT NOT NULL,
          detection_bbox TEXT NOT NULL,
          detection_confidence REAL NOT NULL,
          detection_center TEXT NOT NULL,
          status TEXT NOT NULL DEFAULT 'pending',
          operator_response INTEGER,
          operator_id TEXT,
          response_time TEXT
        );

        CREATE TABLE IF NOT EXISTS operator_responses (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          violation_id TEXT NOT NULL,
          operator_id TEXT,
          response INTEGER NOT NULL,
          timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS system_events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          event_type TEXT NOT NULL,
          message TEXT NOT NULL,
          timestamp TEXT NOT NULL,
          metadata TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_violations_timestamp ON violations(timestamp);
        CREATE INDEX IF NOT EXISTS idx_violations_zone ON violations(zone_id);
        CREATE INDEX IF NOT EXISTS idx_violations_status ON violations(status);
        CREATE INDEX IF NOT EXISTS idx_responses_violation ON operator_responses(violation_id);
        "#,
    )?;
    ensure_columns(
        conn,
        "violations",
        &[("detection_class_id", "INTEGER NOT NULL DEFAULT 0")],
    )?;
    Ok(())
}

/// Add any of `columns` missing from `table`. Databases written before a
/// column existed keep working.
pub(crate) fn ensure_columns(
    conn: &Connection,
    table: &str,
    columns: &[(&str, &str)],
) -> Result<()> {
    let mut existing = Vec::new();
    {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            existing.push(name);
        }
    }
    for (name, decl) in columns {
        if !existing.iter().any(|c| c == name) {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, name, decl),
                [],
            )?;
        }
    }
    Ok(())
}

const VIOLATION_COLUMNS: &str = "id, zone_id, zone_name, timestamp, image_path, detection_bbox, \
     detection_confidence, detection_center, status, operator_response, operator_id, \
     response_time, detection_class_id";

/// Raw column values; converted outside the rusqlite row callback so parse
/// failures carry context.
struct ViolationRow {
    id: String,
    zone_id: String,
    zone_name: String,
    timestamp: String,
    image_path: String,
    bbox: String,
    confidence: f64,
    status: String,
    operator_response: Option<i64>,
    operator_id: Option<String>,
    response_time: Option<String>,
    class_id: i64,
}

impl ViolationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            zone_id: row.get(1)?,
            zone_name: row.get(2)?,
            timestamp: row.get(3)?,
            image_path: row.get(4)?,
            bbox: row.get(5)?,
            confidence: row.get(6)?,
            status: row.get(8)?,
            operator_response: row.get(9)?,
            operator_id: row.get(10)?,
            response_time: row.get(11)?,
            class_id: row.get(12)?,
        })
    }

    fn into_violation(self) -> Result<Violation> {
        let bbox: [i32; 4] = serde_json::from_str(&self.bbox)
            .with_context(|| format!("violation {} has a corrupt bbox", self.id))?;
        let class_id = u32::try_from(self.class_id)
            .map_err(|_| anyhow!("violation {} has a corrupt class id", self.id))?;
        Ok(Violation {
            detection: Detection::new(BBox::from(bbox), self.confidence as f32, class_id),
            timestamp: parse_timestamp(&self.timestamp)?,
            status: self.status.parse()?,
            operator_response: self.operator_response.map(|r| r != 0),
            response_time: self
                .response_time
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            image_path: PathBuf::from(self.image_path),
            id: self.id,
            zone_id: self.zone_id,
            zone_name: self.zone_name,
            operator_id: self.operator_id,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    raw.parse::<NaiveDateTime>()
        .with_context(|| format!("invalid stored timestamp '{}'", raw))
}

/// `WHERE` clause and its positional parameters.
fn where_clause(filter: &ViolationFilter) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    if let Some(zone_id) = &filter.zone_id {
        clauses.push("zone_id = ?");
        values.push(SqlValue::Text(zone_id.clone()));
    }
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        values.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(start) = &filter.range.start {
        clauses.push("timestamp >= ?");
        values.push(SqlValue::Text(format_timestamp(start)));
    }
    if let Some(end) = &filter.range.end {
        clauses.push("timestamp <= ?");
        values.push(SqlValue::Text(format_timestamp(end)));
    }
    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

impl ViolationStore for SqliteViolationStore {
    fn insert_or_replace(&self, v: &Violation) -> Result<()> {
        let bbox = serde_json::to_string(&v.detection.bbox)?;
        let center = serde_json::to_string(&v.detection.center)?;
        let conn = self.write_conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO violations ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                VIOLATION_COLUMNS
            ),
            params![
                v.id,
                v.zone_id,
                v.zone_name,
                format_timestamp(&v.timestamp),
                v.image_path.to_string_lossy(),
                bbox,
                f64::from(v.detection.confidence),
                center,
                v.status.as_str(),
                v.operator_response,
                v.operator_id,
                v.response_time.as_ref().map(format_timestamp),
                i64::from(v.detection.class_id),
            ],
        )?;
        Ok(())
    }

    fn update_status(&self, update: &StatusUpdate) -> Result<bool> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        let response_time = format_timestamp(&update.response_time);
        let changed = tx.execute(
            "UPDATE violations SET status = ?1, operator_response = ?2, operator_id = ?3, \
             response_time = ?4 WHERE id = ?5",
            params![
                update.status.as_str(),
                update.operator_response,
                update.operator_id,
                response_time,
                update.violation_id,
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(response) = update.operator_response {
            tx.execute(
                "INSERT INTO operator_responses (violation_id, operator_id, response, timestamp) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    update.violation_id,
                    update.operator_id,
                    response,
                    response_time
                ],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<Violation>> {
        let row = {
            let conn = self.read_conn()?;
            conn.query_row(
                &format!("SELECT {} FROM violations WHERE id = ?1", VIOLATION_COLUMNS),
                params![id],
                ViolationRow::read,
            )
            .optional()?
        };
        row.map(ViolationRow::into_violation).transpose()
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM operator_responses WHERE violation_id = ?1",
            params![id],
        )?;
        let removed = tx.execute("DELETE FROM violations WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn query(
        &self,
        filter: &ViolationFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Violation>> {
        let (where_sql, mut values) = where_clause(filter);
        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        values.push(SqlValue::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
        let sql = format!(
            "SELECT {} FROM violations{} ORDER BY timestamp DESC LIMIT ? OFFSET ?",
            VIOLATION_COLUMNS, where_sql
        );

        let rows = {
            let conn = self.read_conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let mapped = stmt.query_map(params_from_iter(values.iter()), ViolationRow::read)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(ViolationRow::into_violation).collect()
    }

    fn count(&self, filter: &ViolationFilter) -> Result<u64> {
        let (where_sql, values) = where_clause(filter);
        let conn = self.read_conn()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM violations{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    fn statistics(&self, range: &DateRange) -> Result<ViolationStats> {
        let (where_sql, values) = where_clause(&ViolationFilter::from(range.clone()));
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM violations{} GROUP BY status",
            where_sql
        ))?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut stats = ViolationStats::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let n = row.get::<_, i64>(1)? as u64;
            stats.total += n;
            match status.parse::<ViolationStatus>() {
                Ok(ViolationStatus::Pending) => stats.pending += n,
                Ok(ViolationStatus::Confirmed) => stats.confirmed += n,
                Ok(ViolationStatus::FalsePositive) => stats.false_positive += n,
                Err(e) => log::warn!("statistics: {}", e),
            }
        }
        Ok(stats)
    }

    fn log_system_event(
        &self,
        event_type: &str,
        message: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let metadata = metadata.map(serde_json::to_string).transpose()?;
        let conn = self.write_conn()?;
        conn.execute(
            "INSERT INTO system_events (event_type, message, timestamp, metadata) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event_type,
                message,
                format_timestamp(&crate::now_local()),
                metadata
            ],
        )?;
        Ok(())
    }

    fn responses(&self, violation_id: &str) -> Result<Vec<OperatorResponseRecord>> {
        let raw = {
            let conn = self.read_conn()?;
            let mut stmt = conn.prepare(
                "SELECT operator_id, response, timestamp FROM operator_responses \
                 WHERE violation_id = ?1 ORDER BY id ASC",
            )?;
            let mapped = stmt.query_map(params![violation_id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raw.into_iter()
            .map(|(operator_id, response, ts)| {
                Ok(OperatorResponseRecord {
                    violation_id: violation_id.to_string(),
                    operator_id,
                    response,
                    timestamp: parse_timestamp(&ts)?,
                })
            })
            .collect()
    }

    fn system_events(&self, limit: usize) -> Result<Vec<SystemEvent>> {
        let raw = {
            let conn = self.read_conn()?;
            let mut stmt = conn.prepare(
                "SELECT event_type, message, timestamp, metadata FROM system_events \
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let mapped = stmt.query_map(
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raw.into_iter()
            .map(|(event_type, message, ts, metadata)| {
                Ok(SystemEvent {
                    event_type,
                    message,
                    timestamp: parse_timestamp(&ts)?,
                    metadata: metadata
                        .as_deref()
                        .map(serde_json::from_str::<serde_json::Value>)
                        .transpose()?,
                })
            })
            .collect()
    }
}

// -------------------- In-memory --------------------

#[derive(Default)]
struct InMemoryState {
    violations: HashMap<String, Violation>,
    responses: Vec<OperatorResponseRecord>,
    events: Vec<SystemEvent>,
}

#[derive(Default)]
pub struct InMemoryViolationStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn sorted(&self, filter: &ViolationFilter) -> Result<Vec<Violation>> {
        let state = self.lock()?;
        let mut rows: Vec<Violation> = state
            .violations
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(rows)
    }
}

impl ViolationStore for InMemoryViolationStore {
    fn insert_or_replace(&self, violation: &Violation) -> Result<()> {
        self.lock()?
            .violations
            .insert(violation.id.clone(), violation.clone());
        Ok(())
    }

    fn update_status(&self, update: &StatusUpdate) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(v) = state.violations.get_mut(&update.violation_id) else {
            return Ok(false);
        };
        v.status = update.status;
        v.operator_response = update.operator_response;
        v.operator_id = update.operator_id.clone();
        v.response_time = Some(update.response_time);
        if let Some(response) = update.operator_response {
            state.responses.push(OperatorResponseRecord {
                violation_id: update.violation_id.clone(),
                operator_id: update.operator_id.clone(),
                response,
                timestamp: update.response_time,
            });
        }
        Ok(true)
    }

    fn get_by_id(&self, id: &str) -> Result<Option<Violation>> {
        Ok(self.lock()?.violations.get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        state.responses.retain(|r| r.violation_id != id);
        Ok(state.violations.remove(id).is_some())
    }

    fn query(
        &self,
        filter: &ViolationFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Violation>> {
        Ok(self
            .sorted(filter)?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn count(&self, filter: &ViolationFilter) -> Result<u64> {
        let state = self.lock()?;
        Ok(state.violations.values().filter(|v| filter.matches(v)).count() as u64)
    }

    fn statistics(&self, range: &DateRange) -> Result<ViolationStats> {
        let filter = ViolationFilter::from(range.clone());
        let state = self.lock()?;
        let mut stats = ViolationStats::default();
        for v in state.violations.values().filter(|v| filter.matches(v)) {
            stats.total += 1;
            match v.status {
                ViolationStatus::Pending => stats.pending += 1,
                ViolationStatus::Confirmed => stats.confirmed += 1,
                ViolationStatus::FalsePositive => stats.false_positive += 1,
            }
        }
        Ok(stats)
    }

    fn log_system_event(
        &self,
        event_type: &str,
        message: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        self.lock()?.events.push(SystemEvent {
            event_type: event_type.to_string(),
            message: message.to_string(),
            timestamp: crate::now_local(),
            metadata: metadata.cloned(),
        });
        Ok(())
    }

    fn responses(&self, violation_id: &str) -> Result<Vec<OperatorResponseRecord>> {
        Ok(self
            .lock()?
            .responses
            .iter()
            .filter(|r| r.violation_id == violation_id)
            .cloned()
            .collect())
    }

    fn system_events(&self, limit: usize) -> Result<Vec<SystemEvent>> {
        Ok(self.lock()?.events.iter().rev().take(limit).cloned().collect())
    }
}

// -------------------- Export --------------------

fn render_csv(rows: &[Violation]) -> String {
    let mut out = String::new();
    push_csv_record(&mut out, CSV_HEADERS.iter().map(|h| h.to_string()));
    for v in rows {
        let b = v.detection.bbox;
        push_csv_record(
            &mut out,
            [
                v.id.clone(),
                v.zone_id.clone(),
                v.zone_name.clone(),
                format_timestamp(&v.timestamp),
                v.status.as_str().to_string(),
                v.operator_response
                    .map(|r| if r { "1" } else { "0" }.to_string())
                    .unwrap_or_default(),
                v.operator_id.clone().unwrap_or_default(),
                v.response_time
                    .as_ref()
                    .map(format_timestamp)
                    .unwrap_or_default(),
                v.detection.confidence.to_string(),
                b.x1.to_string(),
                b.y1.to_string(),
                b.x2.to_string(),
                b.y2.to_string(),
            ],
        );
    }
    out
}

fn push_csv_record(out: &mut String, fields: impl IntoIterator<Item = String>) {
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        }
        first = false;
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(&field);
        }
    }
    out.push_str("\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(zone: &str, name: &str, minute: u32) -> Violation {
        let ts = NaiveDateTime::parse_from_str(
            &format!("2024-06-01T10:{:02}:00", minute),
            "%Y-%m-%dT%H:%M:%S",
        )
        .unwrap();
        Violation::new(
            zone,
            name,
            Detection::person(BBox::new(1, 2, 30, 40), 0.75),
            PathBuf::from(format!("data/violations/{}.jpg", minute)),
            ts,
        )
    }

    #[test]
    fn csv_quotes_fields_with_separators() {
        let mut v = violation("z1", "Gate, \"north\"", 1);
        v.id = "v1".to_string();
        let csv = render_csv(&[v]);
        let mut lines = csv.split("\r\n");
        assert_eq!(
            lines.next().unwrap(),
            "ID,Zone ID,Zone Name,Timestamp,Status,Operator Response,Operator ID,\
             Response Time,Confidence,BBox X1,BBox Y1,BBox X2,BBox Y2"
        );
        assert_eq!(
            lines.next().unwrap(),
            "v1,z1,\"Gate, \"\"north\"\"\",2024-06-01T10:01:00.000000,pending,,,,0.75,1,2,30,40"
        );
    }

    #[test]
    fn sqlite_round_trips_violation() {
        let store = SqliteViolationStore::open(":memory:").unwrap();
        let v = violation("z1", "Dock", 5);
        store.insert_or_replace(&v).unwrap();
        assert_eq!(store.get_by_id(&v.id).unwrap(), Some(v.clone()));
        assert!(store.get_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn ensure_columns_migrates_old_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE violations (id TEXT PRIMARY KEY);")
            .unwrap();
        ensure_columns(&conn, "violations", &[("detection_class_id", "INTEGER")]).unwrap();
        ensure_columns(&conn, "violations", &[("detection_class_id", "INTEGER")]).unwrap();
        conn.execute(
            "INSERT INTO violations (id, detection_class_id) VALUES ('a', 3)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn date_bounds_expand_bare_days() {
        let range = DateRange::parse(Some("2024-06-01"), Some("2024-06-02")).unwrap();
        assert_eq!(format_timestamp(&range.start.unwrap()), "2024-06-01T00:00:00.000000");
        assert_eq!(format_timestamp(&range.end.unwrap()), "2024-06-02T23:59:59.999999");

        let exact = DateRange::parse(Some("2024-06-01T10:15:30.25"), None).unwrap();
        assert_eq!(format_timestamp(&exact.start.unwrap()), "2024-06-01T10:15:30.250000");
        assert_eq!(exact.end, None);

        let err = DateRange::parse(Some("yesterday"), None).unwrap_err();
        assert!(SentinelError::is_configuration(&err));
    }

    #[test]
    fn in_memory_filter_matches_sqlite_where_clause() {
        let sqlite = SqliteViolationStore::open(":memory:").unwrap();
        let memory = InMemoryViolationStore::new();
        for (zone, minute) in [("a", 1), ("b", 2), ("a", 3), ("a", 4)] {
            let v = violation(zone, zone, minute);
            sqlite.insert_or_replace(&v).unwrap();
            memory.insert_or_replace(&v).unwrap();
        }
        let filter = ViolationFilter {
            zone_id: Some("a".to_string()),
            status: Some(ViolationStatus::Pending),
            range: DateRange {
                start: Some(
                    NaiveDateTime::parse_from_str("2024-06-01T10:02:00", "%Y-%m-%dT%H:%M:%S")
                        .unwrap(),
                ),
                end: None,
            },
        };
        let stamps = |rows: Vec<Violation>| rows.into_iter().map(|v| v.timestamp).collect::<Vec<_>>();
        assert_eq!(
            stamps(sqlite.query(&filter, 10, 0).unwrap()),
            stamps(memory.query(&filter, 10, 0).unwrap())
        );
        assert_eq!(sqlite.count(&filter).unwrap(), 2);
        assert_eq!(memory.count(&filter).unwrap(), 2);
    }
}
