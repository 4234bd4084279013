#![allow(missing_docs)]

use std::sync::Arc;

use arrow::array::{Float64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tempfile::TempDir;
use tickstore_core::{
    calendar::{StaticCalendar, TradingCalendar, WeekdayCalendar},
    config::StoreConfig,
    date::{DateRange, TradeDate},
    decision::{Reason, Strategy},
    lock::{LockError, LockTarget},
    scan::{ScanStatus, Subject},
    storage::StoreLocation,
    store::{Store, StoreError},
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn d(s: &str) -> Result<TradeDate, Box<dyn std::error::Error>> {
    Ok(s.parse()?)
}

fn range(a: &str, b: &str) -> Result<DateRange, Box<dyn std::error::Error>> {
    Ok(DateRange::new(d(a)?, d(b)?))
}

fn daily_rows(rows: &[(&str, &str, f64)]) -> Result<RecordBatch, Box<dyn std::error::Error>> {
    let mut codes = StringBuilder::new();
    let mut dates = StringBuilder::new();
    let mut close = Float64Builder::new();
    for (code, date, value) in rows {
        codes.append_value(code);
        dates.append_value(date);
        close.append_value(*value);
    }
    let schema = Schema::new(vec![
        Field::new("ts_code", DataType::Utf8, true),
        Field::new("trade_date", DataType::Utf8, true),
        Field::new("close", DataType::Float64, true),
    ]);
    Ok(RecordBatch::try_new(
        Arc::new(schema),
        vec![
            Arc::new(codes.finish()),
            Arc::new(dates.finish()),
            Arc::new(close.finish()),
        ],
    )?)
}

fn manual_store(tmp: &TempDir) -> Result<Store, StoreError> {
    let mut config = StoreConfig::default();
    config.compaction.auto = false;
    config.lock.wait_ms = 50;
    Store::with_config(StoreLocation::local(tmp.path()), config)
}

async fn write_all(store: &Store, batch: &RecordBatch) -> TestResult {
    let lease = store.acquire("daily", LockTarget::All)?;
    let report = store.write("daily", &lease, batch).await?;
    store.release(lease)?;
    assert!(report.is_complete(), "write incomplete: {report:?}");
    Ok(())
}

#[tokio::test]
async fn empty_store_needs_one_full_fetch() -> TestResult {
    let tmp = TempDir::new()?;
    let store = manual_store(&tmp)?;

    let coverage = store.scan("daily").await?;
    assert_eq!(coverage.status, ScanStatus::Missing);
    assert!(!store.has_data("daily").await?);

    let items = store
        .decide("daily", range("20230101", "20231231")?, None)
        .await?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].target, Subject::All);
    assert_eq!(items[0].strategy, Strategy::Full);
    assert_eq!(items[0].reason, Reason::NoExistingData);
    assert_eq!(items[0].range, range("20230101", "20231231")?);
    Ok(())
}

#[tokio::test]
async fn covered_entity_only_extends_the_tail() -> TestResult {
    let tmp = TempDir::new()?;
    let store = manual_store(&tmp)?;
    write_all(
        &store,
        &daily_rows(&[("000001.SZ", "20230103", 1.0), ("000001.SZ", "20231229", 2.0)])?,
    )
    .await?;

    assert!(store.has_data("daily").await?);
    let items = store
        .decide("daily", range("20230103", "20240110")?, None)
        .await?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].target, Subject::Entity(1));
    assert_eq!(items[0].strategy, Strategy::ExtendTail);
    assert_eq!(items[0].reason, Reason::ExtendsBeyondTail);
    assert_eq!(items[0].range, range("20231230", "20240110")?);

    // Nothing left once the request is inside the stored span.
    let items = store
        .decide("daily", range("20230103", "20231229")?, None)
        .await?;
    assert!(items.is_empty());
    Ok(())
}

#[tokio::test]
async fn calendar_gaps_become_fill_gap_items() -> TestResult {
    let tmp = TempDir::new()?;
    let calendar = StaticCalendar::from_dates(
        ["20230103", "20230104", "20230105", "20230106", "20230109"]
            .into_iter()
            .map(d)
            .collect::<Result<Vec<_>, _>>()?,
    );
    let store = manual_store(&tmp)?.with_calendar(Arc::new(calendar));
    write_all(
        &store,
        &daily_rows(&[
            ("A", "20230103", 1.0),
            ("A", "20230104", 1.0),
            ("A", "20230109", 1.0),
        ])?,
    )
    .await?;

    let coverage = store.scan("daily").await?;
    let record = coverage.get(Subject::Entity(1)).ok_or("no coverage for A")?;
    assert_eq!(record.gaps, vec![range("20230105", "20230106")?]);
    assert_eq!(record.covered_dates, 3);

    let items = store
        .decide("daily", range("20230101", "20230109")?, None)
        .await?;
    let kinds: Vec<(Strategy, DateRange)> = items.iter().map(|i| (i.strategy, i.range)).collect();
    assert_eq!(
        kinds,
        vec![
            (Strategy::ExtendHead, range("20230101", "20230102")?),
            (Strategy::FillGap, range("20230105", "20230106")?),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn fetching_what_was_decided_closes_every_gap() -> TestResult {
    let tmp = TempDir::new()?;
    let store = manual_store(&tmp)?.with_calendar(Arc::new(WeekdayCalendar));
    write_all(
        &store,
        &daily_rows(&[
            ("A", "20230104", 1.0),
            ("A", "20230106", 1.0),
            ("B", "20230109", 1.0),
        ])?,
    )
    .await?;

    let request = range("20230103", "20230110")?;
    let items = store.decide("daily", request, None).await?;
    assert!(!items.is_empty());

    // Simulate the fetcher: one row per weekday of every item.
    let registry = store.registry("instrument").await?;
    let mut rows: Vec<(String, String)> = Vec::new();
    for item in &items {
        let Subject::Entity(id) = item.target else {
            return Err("unexpected All item".into());
        };
        let code = registry.lookup_code(id).await?;
        for date in WeekdayCalendar.expected_dates(item.range) {
            rows.push((code.clone(), date.to_string()));
        }
    }
    let rows: Vec<(&str, &str, f64)> = rows
        .iter()
        .map(|(c, d)| (c.as_str(), d.as_str(), 2.0))
        .collect();
    write_all(&store, &daily_rows(&rows)?).await?;

    assert!(store.decide("daily", request, None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unreadable_partition_is_reported_and_skipped() -> TestResult {
    let tmp = TempDir::new()?;
    let mut config = StoreConfig::default();
    config.compaction.auto = false;
    if let Some(daily) = config.data_types.get_mut("daily") {
        daily.refetch_uncertain = true;
    }
    let store = Store::with_config(StoreLocation::local(tmp.path()), config)?;
    write_all(&store, &daily_rows(&[("A", "20230103", 1.0)])?).await?;

    let bad = tmp.path().join("daily/year=2022");
    std::fs::create_dir_all(&bad)?;
    std::fs::write(bad.join("data.parquet"), b"not parquet")?;

    let coverage = store.scan("daily").await?;
    assert_eq!(coverage.unreadable.len(), 1);
    assert_eq!(coverage.unreadable[0].span, Some(range("20220101", "20221231")?));
    assert!(coverage.get(Subject::Entity(1)).is_some());

    let uncertain = range("20220601", "20221231")?;
    let items = store
        .decide("daily", range("20220601", "20230103")?, None)
        .await?;
    assert!(items.iter().any(|i| i.target == Subject::All
        && i.reason == Reason::UncertainCoverage
        && i.range == uncertain));
    Ok(())
}

#[tokio::test]
async fn interrupted_write_leaves_previous_bytes() -> TestResult {
    let tmp = TempDir::new()?;
    let store = manual_store(&tmp)?;
    write_all(&store, &daily_rows(&[("A", "20230103", 1.0)])?).await?;

    let data = tmp.path().join("daily/year=2023/data.parquet");
    let before = std::fs::read(&data)?;
    // A crash between staging and rename leaves only the temporary file.
    std::fs::write(tmp.path().join("daily/year=2023/data.tmp"), b"half a file")?;

    assert_eq!(std::fs::read(&data)?, before);
    let coverage = store.scan("daily").await?;
    assert!(coverage.unreadable.is_empty());
    assert_eq!(coverage.rows, 1);

    // The next write replaces the leftover and succeeds.
    write_all(&store, &daily_rows(&[("A", "20230104", 1.0)])?).await?;
    assert_eq!(store.scan("daily").await?.rows, 2);
    Ok(())
}

#[tokio::test]
async fn ids_survive_reopening_the_store() -> TestResult {
    let tmp = TempDir::new()?;
    {
        let store = manual_store(&tmp)?;
        write_all(
            &store,
            &daily_rows(&[("600000.SH", "20230103", 1.0), ("000001.SZ", "20230103", 1.0)])?,
        )
        .await?;
    }

    let store = Store::open(tmp.path()).await?;
    let registry = store.registry("instrument").await?;
    assert_eq!(registry.lookup_id("600000.SH").await, Some(1));
    assert_eq!(registry.lookup_id("000001.SZ").await, Some(2));
    assert_eq!(registry.resolve("300750.SZ").await?, 3);

    let coverage = store.scan("daily").await?;
    assert_eq!(
        coverage.subjects.keys().copied().collect::<Vec<_>>(),
        vec![Subject::Entity(1), Subject::Entity(2)]
    );
    Ok(())
}

#[tokio::test]
async fn racing_acquirers_get_exactly_one_lease() -> TestResult {
    let tmp = TempDir::new()?;
    let store = Arc::new(manual_store(&tmp)?);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            store.acquire("daily", LockTarget::Entity(1))
        }));
    }
    let mut winners = Vec::new();
    let mut busy = 0;
    for task in tasks {
        match task.await? {
            Ok(lease) => winners.push(lease),
            Err(StoreError::Lock {
                source: LockError::Busy { .. },
            }) => busy += 1,
            Err(e) => return Err(e.into()),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(busy, 7);

    for lease in winners {
        store.release(lease)?;
    }
    let again = store.acquire("daily", LockTarget::Entity(1))?;
    store.release(again)?;
    Ok(())
}

#[tokio::test]
async fn entity_less_types_cover_the_all_subject() -> TestResult {
    let tmp = TempDir::new()?;
    let store = manual_store(&tmp)?;

    let mut dates = StringBuilder::new();
    let mut open = arrow::array::Int32Builder::new();
    for (date, flag) in [("20230103", 1), ("20230104", 1), ("20230107", 0)] {
        dates.append_value(date);
        open.append_value(flag);
    }
    let schema = Schema::new(vec![
        Field::new("cal_date", DataType::Utf8, true),
        Field::new("is_open", DataType::Int32, true),
    ]);
    let batch = RecordBatch::try_new(
        Arc::new(schema),
        vec![Arc::new(dates.finish()), Arc::new(open.finish())],
    )?;

    let lease = store.acquire("trade_cal", LockTarget::All)?;
    let report = store.write("trade_cal", &lease, &batch).await?;
    store.release(lease)?;
    assert!(report.is_complete());
    assert!(tmp.path().join("trade_cal/data.parquet").exists());

    let coverage = store.scan("trade_cal").await?;
    let all = coverage.get(Subject::All).ok_or("no coverage")?;
    assert_eq!(all.span(), range("20230103", "20230107")?);
    Ok(())
}
