// Requires a reachable PostgreSQL 15+ via DATABASE_URL; run with `cargo test -- --ignored`.

use chrono::{TimeZone, Utc};
use meterlog_core::{Measurements, NewReport, ReportFilter};
use meterlog_storage::{KeyIndexState, PgReportStore, ReportStore, StoreError};
use sqlx::PgPool;

fn new_report(ship: &str, batch: Option<i64>, secs: i64, temperature: f64) -> NewReport {
    NewReport {
        meter: "M-100".into(),
        ship: ship.into(),
        batch_number: batch,
        timestamp: Utc.timestamp_opt(1_704_067_200 + secs, 0).single().unwrap(),
        measurements: Measurements {
            temperature: Some(temperature),
            ..Default::default()
        },
    }
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn key_index_makes_chunk_inserts_idempotent(pool: PgPool) {
    let store = PgReportStore::from_pool(pool);
    assert_eq!(store.ensure_key_index().await.unwrap(), KeyIndexState::Present);

    let chunk: Vec<_> = (0..10).map(|i| new_report("Nordic", Some(3), i, i as f64)).collect();
    assert_eq!(store.insert_ignoring_conflicts(&chunk).await.unwrap(), 10);
    assert_eq!(store.insert_ignoring_conflicts(&chunk).await.unwrap(), 0);

    let rows = store
        .query_reports(&ReportFilter {
            ship_name: Some("Nordic".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 10);
    assert!(rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn null_batch_numbers_collide_on_the_natural_key(pool: PgPool) {
    let store = PgReportStore::from_pool(pool);
    store.ensure_key_index().await.unwrap();

    let report = new_report("Nordic", None, 0, 1.0);
    store.insert_report(&report).await.unwrap();
    assert!(matches!(
        store.insert_report(&report).await,
        Err(StoreError::DuplicateKey)
    ));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn legacy_duplicates_leave_key_index_unavailable(pool: PgPool) {
    let store = PgReportStore::from_pool(pool);
    let dup = new_report("Legacy", Some(1), 0, 1.0);
    store.insert_unchecked(&[dup.clone(), dup.clone()]).await.unwrap();

    assert_eq!(
        store.ensure_key_index().await.unwrap(),
        KeyIndexState::Unavailable
    );

    let existing = store
        .existing_keys(&[dup.clone(), new_report("Legacy", Some(1), 60, 2.0)])
        .await
        .unwrap();
    assert_eq!(existing.len(), 1);
    assert!(existing.contains(&dup.key()));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn query_filters_compose_with_time_range(pool: PgPool) {
    let store = PgReportStore::from_pool(pool);
    store.ensure_key_index().await.unwrap();
    let mut chunk: Vec<_> = (0..5).map(|i| new_report("X", Some(1), i * 60, i as f64)).collect();
    chunk.push(new_report("Y", Some(1), 60, 99.0));
    store.insert_ignoring_conflicts(&chunk).await.unwrap();

    let rows = store
        .query_reports(&ReportFilter {
            ship_name: Some("X".into()),
            from: Some(chunk[1].timestamp),
            to: Some(chunk[3].timestamp),
            ..Default::default()
        })
        .await
        .unwrap();
    let temps: Vec<_> = rows.iter().map(|r| r.measurements.temperature).collect();
    assert_eq!(temps, vec![Some(1.0), Some(2.0), Some(3.0)]);
}
