use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use tickstore_core::{date::DateError, registry::RegistryError, store::StoreError};

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("{source}"))]
    Store {
        #[snafu(source(from(StoreError, Box::new)))]
        source: Box<StoreError>,
    },

    #[snafu(display("Registry error: {source}"))]
    Registry { source: RegistryError },

    #[snafu(display("Invalid date '{value}': {source}"))]
    InvalidDate { value: String, source: DateError },

    #[snafu(display("Calendar file not found or not accessible: {path}"))]
    ReadCalendar {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Calendar file {path} is malformed: {source}"))]
    ParseCalendar { path: String, source: DateError },

    #[snafu(display("Parquet file not found or not accessible: {path}"))]
    ParquetMissing {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to read parquet {path}: {source}"))]
    ReadParquet { path: String, source: ParquetError },

    #[snafu(display("Failed to combine batches of {path}: {source}"))]
    CombineBatches { path: String, source: ArrowError },

    #[snafu(display(
        "Refusing to overwrite existing file: {path}. \
         Pass --force to replace it."
    ))]
    ConfigExists { path: String },

    #[snafu(display("Failed to write {path}"))]
    WriteConfig {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to render output: {source}"))]
    Render { source: serde_json::Error },

    #[snafu(display("{problems} partition(s) of {data_type} were not written"))]
    IncompleteWrite { data_type: String, problems: usize },
}
