//! Incremental-build storage engine for partitioned market data.
//!
//! This crate holds everything an ingestion orchestrator needs to keep a
//! Parquet store of daily market data complete without re-downloading what
//! it already has:
//!
//! - permanent integer IDs for entity codes, journaled per namespace
//!   (`registry` module);
//! - coverage scans that read only the key columns of each partition and
//!   report covered spans and calendar gaps (`scan` module, built on the
//!   RoaringBitmap helpers of `coverage`);
//! - a pure decision engine turning a requested date range into the
//!   smallest list of fetches (`decision` module);
//! - lease-based locks per data type and target (`lock` module);
//! - an atomic, deduplicating partition writer (`writer` module) and the
//!   compaction that keeps partition sizes near target (`compaction`);
//! - a build pass tying these together behind a `Fetcher` trait (`build`).
//!
//! [`store::Store`] is the entry point; the other modules are usable on
//! their own.
#![deny(missing_docs)]
pub mod build;
pub mod calendar;
pub mod compaction;
pub mod config;
pub mod coverage;
pub mod date;
pub mod decision;
pub mod layout;
pub mod lock;
pub mod registry;
pub mod scan;
pub mod storage;
pub mod store;
pub mod writer;

#[cfg(test)]
mod test_support;
