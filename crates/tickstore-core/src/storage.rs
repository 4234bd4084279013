//! Filesystem access for a store root.
//!
//! Every byte that the engine persists goes through this module. It maps a
//! store root plus a relative path onto the local filesystem and provides the
//! primitives the higher layers are built on:
//!
//! - atomic replacement (write to a temporary sibling, fsync, rename), split
//!   into a *stage* and a *commit* step so callers can abandon a staged write
//!   and leave the previous file untouched;
//! - create-new writes for files that must be created exactly once;
//! - durable appends for the identifier registry journal;
//! - directory listing and cheap file fingerprints for the coverage scanner.
//!
//! Only the local filesystem is supported, but callers always go through
//! [`StoreLocation`] so another backend can be added without touching them.

mod error;

pub use error::{BackendError, StorageError};
pub(crate) use error::{AlreadyExistsSnafu, OtherIoSnafu};

use std::{
    io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use snafu::{Backtrace, prelude::*};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Location of a store root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    /// A store rooted at a local filesystem path.
    Local(PathBuf),
}

impl StoreLocation {
    /// Creates a new `StoreLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StoreLocation::Local(root.into())
    }

    /// Resolve `rel` under this root into an absolute local path.
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        match self {
            StoreLocation::Local(root) => root.join(rel),
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        match self {
            StoreLocation::Local(root) => root,
        }
    }
}

fn classify(path: &Path, e: io::Error) -> StorageError {
    let path = path.display().to_string();
    let backend = BackendError::Local(e);
    if backend.is_not_found() {
        StorageError::NotFound {
            path,
            source: backend,
            backtrace: Backtrace::capture(),
        }
    } else {
        StorageError::OtherIo {
            path,
            source: backend,
            backtrace: Backtrace::capture(),
        }
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best effort; we are usually already unwinding another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Suffix used for temporary files of staged writes.
pub const TEMP_EXTENSION: &str = "tmp";

fn temp_path_for(abs: &Path) -> PathBuf {
    abs.with_extension(TEMP_EXTENSION)
}

/// A fully written and synced temporary file that has not yet replaced its
/// target.
///
/// Dropping a `StagedWrite` without calling [`StagedWrite::commit`] removes
/// the temporary file and leaves the target exactly as it was.
pub struct StagedWrite {
    tmp_path: PathBuf,
    target: PathBuf,
    guard: TempFileGuard,
}

impl std::fmt::Debug for StagedWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedWrite")
            .field("tmp_path", &self.tmp_path)
            .field("target", &self.target)
            .finish()
    }
}

impl StagedWrite {
    /// Absolute path of the file this write will replace.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Atomically move the staged file over its target.
    pub async fn commit(mut self) -> StorageResult<()> {
        fs::rename(&self.tmp_path, &self.target)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.target.display().to_string(),
            })?;
        self.guard.disarm();
        Ok(())
    }
}

/// Write `contents` to a temporary sibling of `rel_path` and fsync it,
/// without touching `rel_path` itself.
pub async fn stage_atomic(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<StagedWrite> {
    let abs = location.resolve(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = temp_path_for(&abs);
    let guard = TempFileGuard::new(tmp_path.clone());

    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: tmp_path.display().to_string(),
        })?;

    file.write_all(contents)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: tmp_path.display().to_string(),
        })?;

    file.sync_all()
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: tmp_path.display().to_string(),
        })?;

    Ok(StagedWrite {
        tmp_path,
        target: abs,
        guard,
    })
}

/// Write `contents` to `rel_path` using write-then-rename.
///
/// Readers observe either the previous contents or the new ones, never a
/// partially written file.
pub async fn write_atomic(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    stage_atomic(location, rel_path, contents)
        .await?
        .commit()
        .await
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if the file already exists.
pub async fn write_new(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    create_parent_dir(&abs).await?;

    let path_str = abs.display().to_string();

    let open_result = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await;

    let mut file = match open_result {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(BackendError::Local(e)).context(AlreadyExistsSnafu { path: path_str });
        }
        Err(e) => return Err(BackendError::Local(e)).context(OtherIoSnafu { path: path_str }),
    };

    file.write_all(contents)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: path_str.clone(),
        })?;

    file.sync_all()
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu { path: path_str })?;

    Ok(())
}

/// Append `contents` to `rel_path` (creating it if needed) and flush the
/// data to stable storage before returning.
pub async fn append_durable(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    create_parent_dir(&abs).await?;
    let path_str = abs.display().to_string();

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&abs)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: path_str.clone(),
        })?;

    file.write_all(contents)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: path_str.clone(),
        })?;

    file.sync_data()
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu { path: path_str })?;

    Ok(())
}

/// Read the file at `rel_path` as UTF-8.
pub async fn read_to_string(location: &StoreLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.resolve(rel_path);
    fs::read_to_string(&abs).await.map_err(|e| classify(&abs, e))
}

/// Read the full contents of the file at `rel_path`.
pub async fn read_all_bytes(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.resolve(rel_path);
    fs::read(&abs).await.map_err(|e| classify(&abs, e))
}

/// True if `rel_path` exists (file or directory).
pub async fn exists(location: &StoreLocation, rel_path: &Path) -> StorageResult<bool> {
    let abs = location.resolve(rel_path);
    match fs::metadata(&abs).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(classify(&abs, e)),
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    /// File or directory name (not a path).
    pub name: String,
    /// True for directories.
    pub is_dir: bool,
}

/// List the direct children of `rel_dir`, sorted by name.
///
/// Names that are not valid UTF-8 are skipped; the store never creates them.
pub async fn list_dir(location: &StoreLocation, rel_dir: &Path) -> StorageResult<Vec<DirEntryInfo>> {
    let abs = location.resolve(rel_dir);
    let mut rd = fs::read_dir(&abs).await.map_err(|e| classify(&abs, e))?;

    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await.map_err(|e| classify(&abs, e))? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let file_type = entry.file_type().await.map_err(|e| classify(&abs, e))?;
        out.push(DirEntryInfo {
            name,
            is_dir: file_type.is_dir(),
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Cheap identity of a file's contents: its length and modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileFingerprint {
    /// Length of the file in bytes.
    pub len: u64,
    /// Modification time in nanoseconds since the Unix epoch (0 if unknown).
    pub modified_nanos: u128,
}

/// Stat the file at `rel_path`.
pub async fn fingerprint(
    location: &StoreLocation,
    rel_path: &Path,
) -> StorageResult<FileFingerprint> {
    let abs = location.resolve(rel_path);
    let meta = fs::metadata(&abs).await.map_err(|e| classify(&abs, e))?;
    let modified_nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(FileFingerprint {
        len: meta.len(),
        modified_nanos,
    })
}

/// Remove a directory and everything beneath it. Missing directories are
/// not an error.
pub async fn remove_dir_all(location: &StoreLocation, rel_dir: &Path) -> StorageResult<()> {
    let abs = location.resolve(rel_dir);
    match fs::remove_dir_all(&abs).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(&abs, e)),
    }
}

/// Remove a single file. A missing file is not an error.
pub async fn remove_file(location: &StoreLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    match fs::remove_file(&abs).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(&abs, e)),
    }
}
