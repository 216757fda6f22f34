//! Batch ingestion pipeline: normalize historian snapshots, drop in-batch
//! duplicates, and write the survivors in bounded, ordered chunks.

use std::collections::HashSet;
use std::sync::Arc;

use meterlog_core::{BatchSubmission, NewReport, NormalizedSnapshot};
use meterlog_historian::normalize_submission;
use meterlog_storage::{KeyIndexState, ReportStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "meterlog-ingest";

pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// When the natural-key index is checked (and created if missing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyIndexPolicy {
    /// Once, when the service starts.
    #[default]
    Startup,
    /// On every batch submission.
    PerRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub chunk_size: usize,
    pub key_index: KeyIndexPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            key_index: KeyIndexPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to insert chunk {chunk_index} ({inserted_before} rows committed by earlier chunks): {source}")]
    ChunkFailed {
        chunk_index: usize,
        inserted_before: u64,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    /// Surviving reports in first-seen order.
    pub reports: Vec<NewReport>,
    pub total: usize,
    pub invalid_timestamps: usize,
    pub duplicates: usize,
}

impl DedupOutcome {
    pub fn unique(&self) -> usize {
        self.reports.len()
    }
}

/// Drop records without a usable timestamp and records whose natural key
/// was already seen earlier in the same batch. The first occurrence wins.
pub fn dedup_reports(items: impl IntoIterator<Item = NormalizedSnapshot>) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    let mut seen = HashSet::new();
    for item in items {
        outcome.total += 1;
        let Some(report) = item.into_new_report() else {
            outcome.invalid_timestamps += 1;
            continue;
        };
        if seen.insert(report.key()) {
            outcome.reports.push(report);
        } else {
            outcome.duplicates += 1;
        }
    }
    outcome
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertSummary {
    pub inserted: u64,
    pub skipped: u64,
    pub chunks: usize,
}

/// Writes reports in fixed-size chunks, strictly one chunk after another.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedInserter {
    chunk_size: usize,
}

impl Default for ChunkedInserter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkedInserter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// A failing chunk aborts the remaining chunks; earlier chunks stay committed.
    pub async fn insert(
        &self,
        store: &dyn ReportStore,
        reports: &[NewReport],
        key_index: KeyIndexState,
    ) -> Result<InsertSummary, IngestError> {
        let mut summary = InsertSummary::default();
        for (chunk_index, chunk) in reports.chunks(self.chunk_size).enumerate() {
            let result = match key_index {
                KeyIndexState::Present => store.insert_ignoring_conflicts(chunk).await,
                KeyIndexState::Unavailable => insert_missing(store, chunk).await,
            };
            let accepted = result.map_err(|source| {
                error!(chunk_index, size = chunk.len(), error = %source, "chunk insert failed");
                IngestError::ChunkFailed {
                    chunk_index,
                    inserted_before: summary.inserted,
                    source,
                }
            })?;
            debug!(chunk_index, size = chunk.len(), accepted, "chunk inserted");
            summary.inserted += accepted;
            summary.skipped += (chunk.len() as u64).saturating_sub(accepted);
            summary.chunks += 1;
        }
        Ok(summary)
    }
}

/// Check-then-insert for tables without the unique index. Not atomic:
/// concurrent submissions of overlapping data can still both insert.
async fn insert_missing(store: &dyn ReportStore, chunk: &[NewReport]) -> Result<u64, StoreError> {
    let existing = store.existing_keys(chunk).await?;
    let remainder: Vec<NewReport> = chunk
        .iter()
        .filter(|r| !existing.contains(&r.key()))
        .cloned()
        .collect();
    if remainder.is_empty() {
        return Ok(0);
    }
    store.insert_unchecked(&remainder).await
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub submission_id: Uuid,
    pub total: usize,
    pub unique: usize,
    pub invalid_timestamps: usize,
    pub duplicates: usize,
    pub inserted: u64,
    /// Rows already present in the store.
    pub skipped: u64,
    pub chunks: usize,
    pub key_index: KeyIndexState,
}

#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn ReportStore>,
    config: IngestConfig,
    inserter: ChunkedInserter,
    startup_key_index: Option<KeyIndexState>,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn ReportStore>,
        config: IngestConfig,
        startup_key_index: Option<KeyIndexState>,
    ) -> Self {
        Self {
            inserter: ChunkedInserter::new(config.chunk_size),
            store,
            config,
            startup_key_index,
        }
    }

    /// Build the service, running the key-index bootstrap now when the
    /// policy is [`KeyIndexPolicy::Startup`].
    pub async fn bootstrap(
        store: Arc<dyn ReportStore>,
        config: IngestConfig,
    ) -> Result<Self, StoreError> {
        let startup_key_index = match config.key_index {
            KeyIndexPolicy::Startup => {
                let state = store.ensure_key_index().await?;
                info!(key_index = ?state, "natural-key index checked at startup");
                Some(state)
            }
            KeyIndexPolicy::PerRequest => None,
        };
        Ok(Self::new(store, config, startup_key_index))
    }

    pub fn store(&self) -> &Arc<dyn ReportStore> {
        &self.store
    }

    pub fn startup_key_index(&self) -> Option<KeyIndexState> {
        self.startup_key_index
    }

    async fn resolve_key_index(&self) -> Result<KeyIndexState, StoreError> {
        match (self.config.key_index, self.startup_key_index) {
            (KeyIndexPolicy::Startup, Some(state)) => Ok(state),
            _ => self.store.ensure_key_index().await,
        }
    }

    pub async fn ingest_single(&self, report: &NewReport) -> Result<i64, StoreError> {
        let id = self.store.insert_report(report).await?;
        info!(id, meter = %report.meter, ship = %report.ship, "report inserted");
        Ok(id)
    }

    pub async fn ingest_batch(
        &self,
        submission: &BatchSubmission,
    ) -> Result<IngestSummary, IngestError> {
        let submission_id = Uuid::new_v4();
        let span = info_span!(
            "ingest_batch",
            %submission_id,
            meter = %submission.meter_id,
            ship = %submission.ship_name,
            batch_number = ?submission.batch_number,
        );
        self.run_batch(submission_id, submission)
            .instrument(span)
            .await
    }

    async fn run_batch(
        &self,
        submission_id: Uuid,
        submission: &BatchSubmission,
    ) -> Result<IngestSummary, IngestError> {
        let outcome = dedup_reports(normalize_submission(submission));
        if outcome.invalid_timestamps > 0 {
            warn!(
                skipped = outcome.invalid_timestamps,
                "snapshots with invalid timestamps dropped"
            );
        }

        let key_index = self.resolve_key_index().await?;
        if key_index == KeyIndexState::Unavailable {
            warn!("natural-key index unavailable; falling back to existence checks");
        }

        let inserted = self
            .inserter
            .insert(self.store.as_ref(), &outcome.reports, key_index)
            .await?;

        let summary = IngestSummary {
            submission_id,
            total: outcome.total,
            unique: outcome.unique(),
            invalid_timestamps: outcome.invalid_timestamps,
            duplicates: outcome.duplicates,
            inserted: inserted.inserted,
            skipped: inserted.skipped,
            chunks: inserted.chunks,
            key_index,
        };
        info!(
            total = summary.total,
            unique = summary.unique,
            inserted = summary.inserted,
            skipped = summary.skipped,
            chunks = summary.chunks,
            "batch ingested"
        );
        Ok(summary)
    }
}
