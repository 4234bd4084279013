//! Projection-only decoding of one partition file into per-subject presence
//! bitmaps.
//!
//! Only the Parquet footer and the two key columns (`<entity>_id`,
//! `<date>_int`) are decoded, batch by batch; value columns are never
//! materialized. Files are read through their handle, so only the projected
//! column chunks of the batch in flight are held in memory.

use std::{collections::BTreeMap, fs::File, path::Path};

use arrow::{datatypes::DataType, error::ArrowError};
use arrow_array::{Array, Int32Array, RecordBatch, UInt32Array};
use parquet::{
    arrow::{ProjectionMask, arrow_reader::ParquetRecordBatchReaderBuilder},
    errors::ParquetError,
    file::reader::ChunkReader,
};
use snafu::prelude::*;

use crate::{
    coverage::Coverage,
    date::{DateError, TradeDate},
    scan::Subject,
};

/// Reasons a partition file cannot be decoded.
#[derive(Debug, Snafu)]
pub(crate) enum PresenceError {
    #[snafu(display("Failed to open: {source}"))]
    Open { source: std::io::Error },

    #[snafu(display("Parquet error: {source}"))]
    Parquet { source: ParquetError },

    #[snafu(display("Arrow error: {source}"))]
    Arrow { source: ArrowError },

    #[snafu(display("Missing column {column:?}"))]
    MissingColumn { column: String },

    #[snafu(display("Column {column:?} has type {datatype}, expected {expected}"))]
    UnexpectedType {
        column: String,
        datatype: String,
        expected: &'static str,
    },

    #[snafu(display("Column {column:?} holds an invalid date: {source}"))]
    InvalidDate { column: String, source: DateError },
}

/// Dates present in one partition file, keyed by subject, as
/// [`TradeDate::day_number`] buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FilePresence {
    pub(crate) subjects: BTreeMap<Subject, Coverage>,
    pub(crate) rows: u64,
}

fn downcast<'a, T: 'static>(
    batch: &'a RecordBatch,
    column: &str,
    expected_type: DataType,
    expected: &'static str,
) -> Result<&'a T, PresenceError> {
    let col = batch
        .column_by_name(column)
        .context(MissingColumnSnafu { column })?;
    ensure!(
        *col.data_type() == expected_type,
        UnexpectedTypeSnafu {
            column,
            datatype: col.data_type().to_string(),
            expected,
        }
    );
    col.as_any()
        .downcast_ref::<T>()
        .context(UnexpectedTypeSnafu {
            column,
            datatype: col.data_type().to_string(),
            expected,
        })
}

/// Open `path` and decode its presence. Runs on a blocking thread.
pub(crate) fn read_presence_file(
    path: &Path,
    entity_id_column: Option<&str>,
    date_int_column: &str,
) -> Result<FilePresence, PresenceError> {
    let file = File::open(path).context(OpenSnafu)?;
    read_presence(file, entity_id_column, date_int_column)
}

/// Decode presence from any Parquet source.
///
/// With `entity_id_column == None` every row counts for [`Subject::All`].
pub(crate) fn read_presence<R: ChunkReader + 'static>(
    data: R,
    entity_id_column: Option<&str>,
    date_int_column: &str,
) -> Result<FilePresence, PresenceError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data).context(ParquetSnafu)?;

    let mut wanted: Vec<&str> = vec![date_int_column];
    if let Some(col) = entity_id_column {
        wanted.push(col);
    }
    for col in &wanted {
        builder
            .schema()
            .index_of(col)
            .map_err(|_| PresenceError::MissingColumn {
                column: col.to_string(),
            })?;
    }

    let mask = ProjectionMask::columns(builder.parquet_schema(), wanted.iter().copied());
    let reader = builder.with_projection(mask).build().context(ParquetSnafu)?;

    let mut out = FilePresence::default();
    for batch in reader {
        let batch = batch.context(ArrowSnafu)?;
        let dates: &Int32Array = downcast(&batch, date_int_column, DataType::Int32, "Int32")?;
        let ids: Option<&UInt32Array> = match entity_id_column {
            Some(col) => Some(downcast(&batch, col, DataType::UInt32, "UInt32")?),
            None => None,
        };

        for row in 0..batch.num_rows() {
            if dates.is_null(row) {
                continue;
            }
            let subject = match ids {
                Some(ids) if ids.is_null(row) => continue,
                Some(ids) => Subject::Entity(ids.value(row)),
                None => Subject::All,
            };
            let day = TradeDate::from_yyyymmdd(dates.value(row) as i64)
                .context(InvalidDateSnafu {
                    column: date_int_column,
                })?
                .day_number();
            out.subjects.entry(subject).or_default().insert(day);
            out.rows += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{key_batch, parquet_bytes};
    use bytes::Bytes;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn d(s: &str) -> u32 {
        s.parse::<TradeDate>().expect("valid date").day_number()
    }

    #[test]
    fn groups_dates_by_entity() -> TestResult {
        let batch = key_batch(&[(2, 20230104), (1, 20230103), (2, 20230103), (1, 20230103)])?;
        let presence = read_presence(
            Bytes::from(parquet_bytes(&batch)?),
            Some("ts_code_id"),
            "trade_date_int",
        )?;

        assert_eq!(presence.rows, 4);
        let one = &presence.subjects[&Subject::Entity(1)];
        assert_eq!(one.cardinality(), 1);
        assert!(one.contains(d("20230103")));
        let two = &presence.subjects[&Subject::Entity(2)];
        assert_eq!((two.first(), two.last()), (Some(d("20230103")), Some(d("20230104"))));
        Ok(())
    }

    #[test]
    fn entityless_rows_count_for_all() -> TestResult {
        let batch = key_batch(&[(7, 20230103), (8, 20230105)])?;
        let presence = read_presence(Bytes::from(parquet_bytes(&batch)?), None, "trade_date_int")?;
        assert_eq!(presence.subjects.len(), 1);
        assert_eq!(presence.subjects[&Subject::All].cardinality(), 2);
        Ok(())
    }

    #[test]
    fn reports_missing_columns_and_garbage() -> TestResult {
        let batch = key_batch(&[(1, 20230103)])?;
        let bytes = Bytes::from(parquet_bytes(&batch)?);
        let err = read_presence(bytes, Some("ts_code_id"), "ann_date_int").expect_err("missing");
        assert!(matches!(err, PresenceError::MissingColumn { .. }));

        let err = read_presence(Bytes::from_static(b"not parquet"), None, "trade_date_int")
            .expect_err("garbage");
        assert!(matches!(err, PresenceError::Parquet { .. }));
        Ok(())
    }

    #[test]
    fn reads_through_a_file_handle() -> TestResult {
        let tmp = tempfile::TempDir::new()?;
        let path = tmp.path().join("data.parquet");
        std::fs::write(&path, parquet_bytes(&key_batch(&[(3, 20230105)])?)?)?;

        let presence = read_presence_file(&path, Some("ts_code_id"), "trade_date_int")?;
        assert!(presence.subjects[&Subject::Entity(3)].contains(d("20230105")));

        let err = read_presence_file(&tmp.path().join("gone.parquet"), None, "trade_date_int")
            .expect_err("missing file");
        assert!(matches!(err, PresenceError::Open { .. }));
        Ok(())
    }
}
