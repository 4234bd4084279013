//! Conversion of incoming batches into the stored layout: parse the date
//! column, read entity codes, and append the `<entity>_id` / `<date>_int`
//! key columns.

use std::sync::Arc;

use arrow::{
    compute::cast,
    datatypes::{DataType, Field, Schema, SchemaRef},
    error::ArrowError,
};
use arrow_array::{
    Array, ArrayRef, Date32Array, Int32Array, Int64Array, RecordBatch, StringArray, UInt32Array,
};

use crate::{date::TradeDate, writer::RejectReason};

/// Parse every row of the date column. `None` marks a null or unparsable
/// value.
pub(crate) fn parse_dates(
    column: &str,
    array: &ArrayRef,
) -> Result<Vec<Option<TradeDate>>, RejectReason> {
    let n = array.len();
    let unsupported = || RejectReason::UnsupportedDateType {
        column: column.to_string(),
        datatype: array.data_type().to_string(),
    };

    let out = match array.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
            let strings = cast(array, &DataType::Utf8).map_err(|_| unsupported())?;
            let strings = strings
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(unsupported)?;
            (0..n)
                .map(|i| {
                    (!strings.is_null(i))
                        .then(|| strings.value(i).parse::<TradeDate>().ok())
                        .flatten()
                })
                .collect()
        }
        DataType::Int32 => {
            let ints = array
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(unsupported)?;
            (0..n)
                .map(|i| {
                    (!ints.is_null(i))
                        .then(|| TradeDate::from_yyyymmdd(ints.value(i) as i64).ok())
                        .flatten()
                })
                .collect()
        }
        DataType::Int64 => {
            let ints = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(unsupported)?;
            (0..n)
                .map(|i| {
                    (!ints.is_null(i))
                        .then(|| TradeDate::from_yyyymmdd(ints.value(i)).ok())
                        .flatten()
                })
                .collect()
        }
        DataType::Date32 => {
            let days = array
                .as_any()
                .downcast_ref::<Date32Array>()
                .ok_or_else(unsupported)?;
            (0..n)
                .map(|i| {
                    if days.is_null(i) || days.value(i) < 0 {
                        None
                    } else {
                        TradeDate::from_day_number(days.value(i) as u32).ok()
                    }
                })
                .collect()
        }
        _ => return Err(unsupported()),
    };
    Ok(out)
}

/// Read the entity code column as strings. `None` marks a null code.
pub(crate) fn entity_codes(
    column: &str,
    array: &ArrayRef,
) -> Result<Vec<Option<String>>, RejectReason> {
    let unsupported = || RejectReason::UnsupportedEntityType {
        column: column.to_string(),
        datatype: array.data_type().to_string(),
    };
    if !matches!(
        array.data_type(),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View
    ) {
        return Err(unsupported());
    }
    let strings = cast(array, &DataType::Utf8).map_err(|_| unsupported())?;
    let strings = strings
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(unsupported)?;
    // Empty codes count as missing.
    Ok((0..strings.len())
        .map(|i| {
            (!strings.is_null(i) && !strings.value(i).is_empty())
                .then(|| strings.value(i).to_string())
        })
        .collect())
}

/// Schema with every field nullable and no metadata.
///
/// Stored partitions use this form so files written from batches with
/// different nullability declarations still compare and concatenate.
pub(crate) fn relaxed_schema(schema: &Schema) -> SchemaRef {
    Arc::new(Schema::new(
        schema
            .fields()
            .iter()
            .map(|f| Field::new(f.name(), f.data_type().clone(), true))
            .collect::<Vec<_>>(),
    ))
}

/// Re-wrap `batch` under the relaxed form of its schema.
pub(crate) fn relax(batch: &RecordBatch) -> Result<RecordBatch, ArrowError> {
    RecordBatch::try_new(relaxed_schema(&batch.schema()), batch.columns().to_vec())
}

/// Append (or replace) the stored key columns.
pub(crate) fn with_key_columns(
    batch: &RecordBatch,
    entity_ids: Option<(&str, Vec<u32>)>,
    date_int: (&str, Vec<i32>),
) -> Result<RecordBatch, ArrowError> {
    let schema = batch.schema();
    let key_names: Vec<&str> = entity_ids
        .as_ref()
        .map(|(name, _)| *name)
        .into_iter()
        .chain(std::iter::once(date_int.0))
        .collect();

    let mut fields: Vec<Field> = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        if key_names.contains(&field.name().as_str()) {
            continue;
        }
        fields.push(Field::new(field.name(), field.data_type().clone(), true));
        columns.push(Arc::clone(column));
    }

    if let Some((name, ids)) = entity_ids {
        fields.push(Field::new(name, DataType::UInt32, true));
        columns.push(Arc::new(UInt32Array::from(ids)));
    }
    fields.push(Field::new(date_int.0, DataType::Int32, true));
    columns.push(Arc::new(Int32Array::from(date_int.1)));

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}
