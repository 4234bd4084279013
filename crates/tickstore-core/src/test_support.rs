//! Fixtures shared by unit tests.

use std::sync::Arc;

use arrow::{
    datatypes::{DataType, Field, Schema},
    error::ArrowError,
};
use arrow_array::{ArrayRef, Float64Array, Int32Array, RecordBatch, StringArray, UInt32Array};
use parquet::{arrow::ArrowWriter, errors::ParquetError};

use crate::{config::DataTypeConfig, layout::Granularity};

/// A batch with only the stored key columns of `daily`.
pub(crate) fn key_batch(rows: &[(u32, i32)]) -> Result<RecordBatch, ArrowError> {
    let schema = Schema::new(vec![
        Field::new("ts_code_id", DataType::UInt32, false),
        Field::new("trade_date_int", DataType::Int32, false),
    ]);
    let ids: ArrayRef = Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.0)));
    let dates: ArrayRef = Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.1)));
    RecordBatch::try_new(Arc::new(schema), vec![ids, dates])
}

/// An incoming `daily` batch as an upstream client would return it.
pub(crate) fn daily_batch(rows: &[(&str, &str, f64)]) -> Result<RecordBatch, ArrowError> {
    let schema = Schema::new(vec![
        Field::new("ts_code", DataType::Utf8, true),
        Field::new("trade_date", DataType::Utf8, true),
        Field::new("close", DataType::Float64, true),
    ]);
    let codes: ArrayRef = Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.0)));
    let dates: ArrayRef = Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.1)));
    let close: ArrayRef = Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.2)));
    RecordBatch::try_new(Arc::new(schema), vec![codes, dates, close])
}

/// Encode a batch as an in-memory Parquet file.
pub(crate) fn parquet_bytes(batch: &RecordBatch) -> Result<Vec<u8>, ParquetError> {
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buf)
}

/// `daily`-like descriptor: yearly partitions keyed by `ts_code`/`trade_date`.
pub(crate) fn daily_config() -> DataTypeConfig {
    DataTypeConfig {
        granularity: Granularity::Year,
        ..DataTypeConfig::default()
    }
}
