//! Per-file presence cache keyed by file fingerprint.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{scan::partition_reader::FilePresence, storage::FileFingerprint};

type FileEntries = HashMap<PathBuf, (FileFingerprint, Arc<FilePresence>)>;

/// Decoded presence per partition file, grouped by data type.
///
/// An entry is served only while the file's fingerprint is unchanged; the
/// writer additionally drops a data type's entries after every committed
/// replacement.
#[derive(Debug, Default)]
pub(crate) struct ScanCache {
    by_data_type: Mutex<HashMap<String, FileEntries>>,
}

impl ScanCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, FileEntries>> {
        // A poisoned cache is still a valid cache: entries are only ever
        // inserted whole.
        self.by_data_type
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn get(
        &self,
        data_type: &str,
        rel_path: &Path,
        fingerprint: FileFingerprint,
    ) -> Option<Arc<FilePresence>> {
        let guard = self.lock();
        let (fp, presence) = guard.get(data_type)?.get(rel_path)?;
        (*fp == fingerprint).then(|| Arc::clone(presence))
    }

    pub(crate) fn put(
        &self,
        data_type: &str,
        rel_path: PathBuf,
        fingerprint: FileFingerprint,
        presence: Arc<FilePresence>,
    ) {
        self.lock()
            .entry(data_type.to_string())
            .or_default()
            .insert(rel_path, (fingerprint, presence));
    }

    /// Drop entries for files that no longer exist.
    pub(crate) fn retain_paths(&self, data_type: &str, live: &[PathBuf]) {
        if let Some(entries) = self.lock().get_mut(data_type) {
            entries.retain(|path, _| live.contains(path));
        }
    }

    pub(crate) fn invalidate(&self, data_type: &str) {
        self.lock().remove(data_type);
    }

    #[cfg(test)]
    pub(crate) fn len(&self, data_type: &str) -> usize {
        self.lock().get(data_type).map_or(0, HashMap::len)
    }
}
