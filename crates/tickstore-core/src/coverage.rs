//! Presence sets over `u32` buckets.
//!
//! The scanner keeps one [`Coverage`] per subject with
//! [`crate::date::TradeDate::day_number`] buckets, and builds a second one in
//! calendar-index space (bucket `i` = the `i`-th expected trading date) to
//! find gaps with [`Coverage::missing_runs`].
//!
//! ```
//! use roaring::RoaringBitmap;
//! use tickstore_core::coverage::Coverage;
//!
//! let expected: RoaringBitmap = (0u32..10).collect();
//! let cov: Coverage = (0u32..10).filter(|b| *b != 5).collect();
//!
//! assert_eq!(cov.missing_runs(&expected), vec![5..=5]);
//! assert_eq!(cov.cardinality(), 9);
//! ```

use std::ops::RangeInclusive;

use roaring::RoaringBitmap;

/// Bucket ids used by [`Coverage`].
pub type Bucket = u32;

/// Presence set over `u32` buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Coverage {
    bitmap: RoaringBitmap,
}

impl Coverage {
    /// Mark one bucket present. Returns false if it already was.
    pub fn insert(&mut self, bucket: Bucket) -> bool {
        self.bitmap.insert(bucket)
    }

    /// True if `bucket` is present.
    pub fn contains(&self, bucket: Bucket) -> bool {
        self.bitmap.contains(bucket)
    }

    /// Add every bucket of `other`.
    pub fn union_inplace(&mut self, other: &Coverage) {
        self.bitmap |= &other.bitmap;
    }

    /// Number of present buckets.
    pub fn cardinality(&self) -> u64 {
        self.bitmap.len()
    }

    /// Smallest present bucket.
    pub fn first(&self) -> Option<Bucket> {
        self.bitmap.min()
    }

    /// Largest present bucket.
    pub fn last(&self) -> Option<Bucket> {
        self.bitmap.max()
    }

    /// Buckets of `expected` that are absent, as ascending inclusive runs.
    pub fn missing_runs(&self, expected: &RoaringBitmap) -> Vec<RangeInclusive<Bucket>> {
        let missing = expected - &self.bitmap;
        contiguous_runs(missing.iter())
    }
}

impl FromIterator<Bucket> for Coverage {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Bucket>,
    {
        Self {
            bitmap: iter.into_iter().collect(),
        }
    }
}

/// Group an ascending bucket sequence into maximal runs.
fn contiguous_runs(buckets: impl Iterator<Item = Bucket>) -> Vec<RangeInclusive<Bucket>> {
    let mut runs: Vec<RangeInclusive<Bucket>> = Vec::new();
    for b in buckets {
        match runs.last_mut() {
            Some(run) if run.end().checked_add(1) == Some(b) => *run = *run.start()..=b,
            _ => runs.push(b..=b),
        }
    }
    runs
}
