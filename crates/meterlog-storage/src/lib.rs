//! Report persistence: the store seam shared by ingestion and queries, a
//! PostgreSQL implementation on sqlx, and an in-process implementation.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meterlog_core::{
    MeasurementField, Measurements, NewReport, Report, ReportFilter, ReportKey,
    UNFILTERED_QUERY_LIMIT,
};
use serde::Serialize;
use sqlx::postgres::{PgDatabaseError, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "meterlog-storage";

/// Unique index over the report natural key.
pub const KEY_INDEX_NAME: &str = "report_natural_key_idx";

const CREATE_KEY_INDEX_SQL: &str = r#"
    CREATE UNIQUE INDEX IF NOT EXISTS report_natural_key_idx
        ON report (meter, ship, batch_number, "timestamp") NULLS NOT DISTINCT
"#;

const KEY_INDEX_EXISTS_SQL: &str = r#"
    SELECT EXISTS (
        SELECT 1
          FROM pg_indexes
         WHERE schemaname = current_schema()
           AND tablename = 'report'
           AND indexname = $1
    )
"#;

const INSERT_UNNEST_SQL: &str = r#"
    INSERT INTO report
        (meter, ship, batch_number, "timestamp", temperature, pressure, mass_flow,
         air_index, total_quantity, standard_density, raw_density)
    SELECT * FROM UNNEST(
        $1::text[], $2::text[], $3::int8[], $4::timestamptz[],
        $5::float8[], $6::float8[], $7::float8[], $8::float8[],
        $9::float8[], $10::float8[], $11::float8[]
    )
"#;

const INSERT_UNNEST_IGNORE_SQL: &str = r#"
    INSERT INTO report
        (meter, ship, batch_number, "timestamp", temperature, pressure, mass_flow,
         air_index, total_quantity, standard_density, raw_density)
    SELECT * FROM UNNEST(
        $1::text[], $2::text[], $3::int8[], $4::timestamptz[],
        $5::float8[], $6::float8[], $7::float8[], $8::float8[],
        $9::float8[], $10::float8[], $11::float8[]
    )
    ON CONFLICT DO NOTHING
"#;

const INSERT_ONE_SQL: &str = r#"
    INSERT INTO report
        (meter, ship, batch_number, "timestamp", temperature, pressure, mass_flow,
         air_index, total_quantity, standard_density, raw_density)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    RETURNING id::int8
"#;

const EXISTING_KEYS_SQL: &str = r#"
    SELECT r.meter::text AS meter,
           r.ship::text AS ship,
           r.batch_number::int8 AS batch_number,
           r."timestamp"::timestamptz AS "timestamp"
      FROM report r
      JOIN UNNEST($1::text[], $2::text[], $3::int8[], $4::timestamptz[])
           AS k(meter, ship, batch_number, ts)
        ON r.meter = k.meter
       AND r.ship = k.ship
       AND r.batch_number IS NOT DISTINCT FROM k.batch_number
       AND r."timestamp" = k.ts
"#;

// Casts keep rows readable from tables created before the migrations existed.
const REPORT_COLUMNS: &str = r#"id::int8 AS id,
       meter::text AS meter,
       ship::text AS ship,
       batch_number::int8 AS batch_number,
       "timestamp"::timestamptz AS "timestamp",
       temperature::float8 AS temperature,
       pressure::float8 AS pressure,
       mass_flow::float8 AS mass_flow,
       air_index::float8 AS air_index,
       total_quantity::float8 AS total_quantity,
       standard_density::float8 AS standard_density,
       raw_density::float8 AS raw_density"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("DATABASE_URL not set (database not configured)")]
    Unavailable,
    #[error("report already exists for (meter, ship, batch_number, timestamp)")]
    DuplicateKey,
    #[error("database error: {0}")]
    Query(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::DuplicateKey => true,
            StoreError::Query(err) => is_unique_violation(err),
            _ => false,
        }
    }

    /// Database diagnostics (SQLSTATE, constraint, detail) when the driver reports them.
    pub fn diagnostic(&self) -> Option<String> {
        let StoreError::Query(err) = self else {
            return None;
        };
        let db = err.as_database_error()?;
        let mut parts = Vec::new();
        if let Some(code) = db.code() {
            parts.push(format!("code={code}"));
        }
        if let Some(constraint) = db.constraint() {
            parts.push(format!("constraint={constraint}"));
        }
        if let Some(detail) = db
            .try_downcast_ref::<PgDatabaseError>()
            .and_then(PgDatabaseError::detail)
        {
            parts.push(format!("detail={detail}"));
        }
        (!parts.is_empty()).then(|| parts.join(" "))
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Failures to reach the database at all, as opposed to the server
/// refusing a statement (old server version, missing privilege).
pub fn is_connection_failure(err: &sqlx::Error) -> bool {
    !matches!(err, sqlx::Error::Database(_))
}

/// Whether inserts can rely on the natural-key unique index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyIndexState {
    Present,
    /// The index is missing and cannot be created.
    Unavailable,
}

/// Persistent store for flow reports.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Create the natural-key unique index when it is missing. When the
    /// server refuses (duplicate rows already in the table, no
    /// `NULLS NOT DISTINCT` support, missing privilege) the result is
    /// [`KeyIndexState::Unavailable`]; only connection failures are errors.
    async fn ensure_key_index(&self) -> Result<KeyIndexState, StoreError>;

    async fn insert_report(&self, report: &NewReport) -> Result<i64, StoreError>;

    /// Insert a chunk, silently dropping rows that collide with the unique
    /// index. Returns the number of rows accepted.
    async fn insert_ignoring_conflicts(&self, chunk: &[NewReport]) -> Result<u64, StoreError>;

    /// Insert a chunk as-is.
    async fn insert_unchecked(&self, chunk: &[NewReport]) -> Result<u64, StoreError>;

    /// Keys of stored rows that match any record in `chunk`.
    async fn existing_keys(&self, chunk: &[NewReport]) -> Result<HashSet<ReportKey>, StoreError>;

    /// Rows matching `filter`, ascending by timestamp. An empty filter
    /// returns the most recent [`UNFILTERED_QUERY_LIMIT`] rows.
    async fn query_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            acquire_timeout = ?config.acquire_timeout,
            "connecting report store"
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("report migrations applied");
        Ok(())
    }

    async fn key_index_exists(&self) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(KEY_INDEX_EXISTS_SQL)
            .bind(KEY_INDEX_NAME)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn insert_chunk(&self, sql: &'static str, chunk: &[NewReport]) -> Result<u64, StoreError> {
        if chunk.is_empty() {
            return Ok(0);
        }
        let columns = ReportColumns::from_reports(chunk);
        let mut query = sqlx::query(sql)
            .bind(columns.meters)
            .bind(columns.ships)
            .bind(columns.batch_numbers)
            .bind(columns.timestamps);
        for values in columns.measurements {
            query = query.bind(values);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_key_index(&self) -> Result<KeyIndexState, StoreError> {
        if self.key_index_exists().await? {
            return Ok(KeyIndexState::Present);
        }
        match sqlx::query(CREATE_KEY_INDEX_SQL).execute(&self.pool).await {
            Ok(_) => {
                info!(index = KEY_INDEX_NAME, "created report natural-key index");
                Ok(KeyIndexState::Present)
            }
            Err(err) if is_unique_violation(&err) => {
                warn!(
                    index = KEY_INDEX_NAME,
                    error = %err,
                    "report table holds duplicate keys; natural-key index unavailable"
                );
                Ok(KeyIndexState::Unavailable)
            }
            Err(err) => {
                // A concurrent bootstrap may have won the race.
                if self.key_index_exists().await? {
                    return Ok(KeyIndexState::Present);
                }
                if is_connection_failure(&err) {
                    return Err(err.into());
                }
                warn!(
                    index = KEY_INDEX_NAME,
                    error = %err,
                    "cannot create natural-key index; falling back to existence checks"
                );
                Ok(KeyIndexState::Unavailable)
            }
        }
    }

    async fn insert_report(&self, report: &NewReport) -> Result<i64, StoreError> {
        let m = &report.measurements;
        let result = sqlx::query_scalar::<_, i64>(INSERT_ONE_SQL)
            .bind(&report.meter)
            .bind(&report.ship)
            .bind(report.batch_number)
            .bind(report.timestamp)
            .bind(m.temperature)
            .bind(m.pressure)
            .bind(m.mass_flow)
            .bind(m.air_index)
            .bind(m.total_quantity)
            .bind(m.standard_density)
            .bind(m.raw_density)
            .fetch_one(&self.pool)
            .await;
        match result {
            Ok(id) => Ok(id),
            Err(err) if is_unique_violation(&err) => Err(StoreError::DuplicateKey),
            Err(err) => Err(err.into()),
        }
    }

    async fn insert_ignoring_conflicts(&self, chunk: &[NewReport]) -> Result<u64, StoreError> {
        self.insert_chunk(INSERT_UNNEST_IGNORE_SQL, chunk).await
    }

    async fn insert_unchecked(&self, chunk: &[NewReport]) -> Result<u64, StoreError> {
        self.insert_chunk(INSERT_UNNEST_SQL, chunk).await
    }

    async fn existing_keys(&self, chunk: &[NewReport]) -> Result<HashSet<ReportKey>, StoreError> {
        if chunk.is_empty() {
            return Ok(HashSet::new());
        }
        let columns = ReportColumns::from_reports(chunk);
        let rows = sqlx::query(EXISTING_KEYS_SQL)
            .bind(columns.meters)
            .bind(columns.ships)
            .bind(columns.batch_numbers)
            .bind(columns.timestamps)
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let meter: String = row.try_get("meter")?;
            let ship: String = row.try_get("ship")?;
            let batch_number: Option<i64> = row.try_get("batch_number")?;
            let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
            out.insert(ReportKey::new(meter, ship, batch_number, timestamp));
        }
        Ok(out)
    }

    async fn query_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>, StoreError> {
        let mut qb = if filter.is_unfiltered() {
            QueryBuilder::<Postgres>::new(format!(
                r#"SELECT * FROM (
                       SELECT {REPORT_COLUMNS}
                         FROM report
                        ORDER BY "timestamp" DESC, id DESC
                        LIMIT {UNFILTERED_QUERY_LIMIT}
                   ) latest
                   ORDER BY "timestamp" ASC, id ASC"#
            ))
        } else {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT {REPORT_COLUMNS} FROM report WHERE TRUE"
            ));
            if let Some(meter) = &filter.meter_id {
                qb.push(" AND meter = ").push_bind(meter.clone());
            }
            if let Some(ship) = &filter.ship_name {
                qb.push(" AND ship = ").push_bind(ship.clone());
            }
            if let Some(batch) = filter.batch_number {
                qb.push(" AND batch_number = ").push_bind(batch);
            }
            if let Some(from) = filter.from {
                qb.push(r#" AND "timestamp" >= "#).push_bind(from);
            }
            if let Some(to) = filter.to {
                qb.push(r#" AND "timestamp" <= "#).push_bind(to);
            }
            qb.push(r#" ORDER BY "timestamp" ASC, id ASC"#);
            qb
        };

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(report_from_row(&row)?);
        }
        Ok(out)
    }
}

fn report_from_row(row: &PgRow) -> Result<Report, sqlx::Error> {
    let mut measurements = Measurements::default();
    for field in MeasurementField::ALL {
        measurements.set(field, row.try_get(field.as_str())?);
    }
    Ok(Report {
        id: row.try_get("id")?,
        meter: row.try_get("meter")?,
        ship: row.try_get("ship")?,
        batch_number: row.try_get("batch_number")?,
        timestamp: row.try_get("timestamp")?,
        measurements,
    })
}

/// Column-major view of a chunk, bound as one array per column.
struct ReportColumns {
    meters: Vec<String>,
    ships: Vec<String>,
    batch_numbers: Vec<Option<i64>>,
    timestamps: Vec<DateTime<Utc>>,
    measurements: [Vec<Option<f64>>; 7],
}

impl ReportColumns {
    fn from_reports(reports: &[NewReport]) -> Self {
        let mut measurements: [Vec<Option<f64>>; 7] =
            std::array::from_fn(|_| Vec::with_capacity(reports.len()));
        for report in reports {
            for (column, field) in measurements.iter_mut().zip(MeasurementField::ALL) {
                column.push(report.measurements.get(field));
            }
        }
        Self {
            meters: reports.iter().map(|r| r.meter.clone()).collect(),
            ships: reports.iter().map(|r| r.ship.clone()).collect(),
            batch_numbers: reports.iter().map(|r| r.batch_number).collect(),
            timestamps: reports.iter().map(|r| r.timestamp).collect(),
            measurements,
        }
    }
}

/// In-process store with the same conflict semantics as [`PgReportStore`].
///
/// Used by `meterlog serve --in-memory` and by tests.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<Report>,
    next_id: i64,
    key_index: bool,
}

impl MemoryState {
    fn push(&mut self, report: &NewReport) -> i64 {
        self.next_id += 1;
        self.rows.push(Report {
            id: self.next_id,
            meter: report.meter.clone(),
            ship: report.ship.clone(),
            batch_number: report.batch_number,
            timestamp: report.timestamp,
            measurements: report.measurements,
        });
        self.next_id
    }

    fn keys(&self) -> HashSet<ReportKey> {
        self.rows.iter().map(Report::key).collect()
    }
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows as a legacy table would hold them: no index, duplicates allowed.
    pub fn with_rows(rows: impl IntoIterator<Item = NewReport>) -> Self {
        let mut state = MemoryState::default();
        for row in rows {
            state.push(&row);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ensure_key_index(&self) -> Result<KeyIndexState, StoreError> {
        let mut state = self.state.lock().await;
        if state.key_index {
            return Ok(KeyIndexState::Present);
        }
        if state.keys().len() != state.rows.len() {
            return Ok(KeyIndexState::Unavailable);
        }
        state.key_index = true;
        Ok(KeyIndexState::Present)
    }

    async fn insert_report(&self, report: &NewReport) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if state.key_index && state.keys().contains(&report.key()) {
            return Err(StoreError::DuplicateKey);
        }
        Ok(state.push(report))
    }

    async fn insert_ignoring_conflicts(&self, chunk: &[NewReport]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        if !state.key_index {
            for report in chunk {
                state.push(report);
            }
            return Ok(chunk.len() as u64);
        }
        let mut keys = state.keys();
        let mut accepted = 0;
        for report in chunk {
            if keys.insert(report.key()) {
                state.push(report);
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    async fn insert_unchecked(&self, chunk: &[NewReport]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        if state.key_index {
            let mut keys = state.keys();
            if !chunk.iter().all(|r| keys.insert(r.key())) {
                return Err(StoreError::DuplicateKey);
            }
        }
        for report in chunk {
            state.push(report);
        }
        Ok(chunk.len() as u64)
    }

    async fn existing_keys(&self, chunk: &[NewReport]) -> Result<HashSet<ReportKey>, StoreError> {
        let state = self.state.lock().await;
        let wanted: HashSet<ReportKey> = chunk.iter().map(NewReport::key).collect();
        Ok(state
            .rows
            .iter()
            .map(Report::key)
            .filter(|k| wanted.contains(k))
            .collect())
    }

    async fn query_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<Report> = state
            .rows
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.timestamp, r.id));
        if filter.is_unfiltered() {
            let cap = UNFILTERED_QUERY_LIMIT as usize;
            let skip = rows.len().saturating_sub(cap);
            rows.drain(..skip);
        }
        Ok(rows)
    }
}
