//! Merging partition contents: decode, concatenate, deduplicate on
//! `(entity ID, date)` keeping the newest row, sort, and re-encode.

use arrow::{
    compute::{concat_batches, take_record_batch},
    datatypes::{DataType, Schema, SchemaRef},
    error::ArrowError,
};
use arrow_array::{Array, Int32Array, RecordBatch, UInt32Array};
use bytes::Bytes;
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Compression,
    errors::ParquetError,
    file::properties::WriterProperties,
};

use crate::writer::normalize::relax;

/// Decode every row of a partition file, in file order.
pub(crate) fn decode_partition(data: Bytes) -> Result<(SchemaRef, Vec<RecordBatch>), ParquetError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| ParquetError::ArrowError(e.to_string()))?);
    }
    Ok((schema, batches))
}

/// Two schemas store the same columns in the same order with the same types.
///
/// Nullability and metadata are ignored.
pub(crate) fn same_columns(a: &Schema, b: &Schema) -> bool {
    a.fields().len() == b.fields().len()
        && a
            .fields()
            .iter()
            .zip(b.fields())
            .all(|(x, y)| x.name() == y.name() && x.data_type() == y.data_type())
}

/// Render a schema as `name:type, ...` for error messages.
pub(crate) fn describe_schema(schema: &Schema) -> String {
    schema
        .fields()
        .iter()
        .map(|f| format!("{}:{}", f.name(), f.data_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_column<'a, T: 'static>(
    batch: &'a RecordBatch,
    name: &str,
    expected: DataType,
) -> Result<&'a T, ArrowError> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("missing key column {name}")))?;
    if *col.data_type() != expected {
        return Err(ArrowError::SchemaError(format!(
            "key column {name} has type {}, expected {expected}",
            col.data_type()
        )));
    }
    col.as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ArrowError::SchemaError(format!("key column {name} has unexpected type")))
}

/// Concatenate `parts` in order, then keep only the last row of every
/// `(entity ID, date)` pair and sort by that pair.
///
/// Later parts win over earlier ones, and later rows within a part win over
/// earlier rows. With `entity_id_column == None` the key is the date alone.
pub(crate) fn merge_dedup_sort(
    parts: &[RecordBatch],
    entity_id_column: Option<&str>,
    date_int_column: &str,
) -> Result<RecordBatch, ArrowError> {
    let Some(first) = parts.first() else {
        return Err(ArrowError::InvalidArgumentError(
            "nothing to merge".to_string(),
        ));
    };
    let relaxed: Vec<RecordBatch> = parts.iter().map(relax).collect::<Result<_, _>>()?;
    let schema = relax(first)?.schema();
    let all = concat_batches(&schema, &relaxed)?;

    let dates: &Int32Array = key_column(&all, date_int_column, DataType::Int32)?;
    let ids: Option<&UInt32Array> = match entity_id_column {
        Some(col) => Some(key_column(&all, col, DataType::UInt32)?),
        None => None,
    };

    let mut keyed: Vec<(u32, i32, u32)> = (0..all.num_rows())
        .map(|row| {
            let id = ids.map_or(0, |ids| ids.value(row));
            (id, dates.value(row), row as u32)
        })
        .collect();
    keyed.sort_unstable();

    let mut keep: Vec<u32> = Vec::with_capacity(keyed.len());
    for (i, (id, date, row)) in keyed.iter().enumerate() {
        let last_of_group = keyed
            .get(i + 1)
            .is_none_or(|(next_id, next_date, _)| (next_id, next_date) != (id, date));
        if last_of_group {
            keep.push(*row);
        }
    }

    take_record_batch(&all, &UInt32Array::from(keep))
}

/// Encode a batch as a single Parquet file.
pub(crate) fn encode_partition(batch: &RecordBatch) -> Result<Vec<u8>, ParquetError> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buf)
}
