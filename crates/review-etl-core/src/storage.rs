//! Local filesystem primitives used by the on-disk store.
//!
//! Everything here resolves a relative path against a [`StoreLocation`] root
//! and maps I/O failures into [`StorageError`] with the offending path, so the
//! store layer never handles raw `io::Error`s. The helpers that matter for
//! the snapshot protocol are:
//!
//! - [`write_atomic`]: write-then-rename, used to swap the `CURRENT` pointer.
//! - [`write_new`]: create-only-if-absent, used for the build lock file.
//! - [`remove_dir_all`]: cleanup of discarded or pruned snapshots.

use snafu::{Backtrace, IntoError, prelude::*};
use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root of a store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    /// A store rooted at a local directory.
    Local(PathBuf),
}

impl StoreLocation {
    /// A store rooted at a local directory.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StoreLocation::Local(root.into())
    }

    /// Absolute path of `rel` under this root.
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        match self {
            StoreLocation::Local(root) => root.join(rel),
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::Local(root) => write!(f, "{}", root.display()),
        }
    }
}

/// Backend-specific error wrapped by [`StorageError`].
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors from filesystem operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The path does not exist.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// Missing path.
        path: String,
        /// Underlying backend error.
        source: BackendError,
        /// Backtrace at the failure point.
        backtrace: Backtrace,
    },

    /// The path already exists and create-new semantics were requested.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// Existing path.
        path: String,
        /// Underlying backend error.
        source: BackendError,
        /// Backtrace at the failure point.
        backtrace: Backtrace,
    },

    /// Any other I/O failure.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// Path being accessed.
        path: String,
        /// Underlying backend error.
        source: BackendError,
        /// Backtrace at the failure point.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Path the failing operation touched.
    pub fn path(&self) -> &str {
        match self {
            StorageError::NotFound { path, .. }
            | StorageError::AlreadyExists { path, .. }
            | StorageError::OtherIo { path, .. } => path,
        }
    }
}

fn classify(path: &Path, e: io::Error) -> StorageError {
    let path = path.display().to_string();
    match e.kind() {
        io::ErrorKind::NotFound => NotFoundSnafu { path }.into_error(BackendError::Local(e)),
        io::ErrorKind::AlreadyExists => {
            AlreadyExistsSnafu { path }.into_error(BackendError::Local(e))
        }
        _ => OtherIoSnafu { path }.into_error(BackendError::Local(e)),
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| classify(parent, e))?;
    }
    Ok(())
}

/// Removes a temporary file on drop unless disarmed.
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
            // Best effort; the caller is already returning an error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` by writing a sibling temp file, syncing it,
/// and renaming it over the target. Readers see either the old or the new
/// contents, never a mix.
pub async fn write_atomic(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = abs.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| classify(&tmp_path, e))?;
        file.write_all(contents)
            .await
            .map_err(|e| classify(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| classify(&tmp_path, e))?;
    }

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(|e| classify(&abs, e))?;
    guard.disarm();
    Ok(())
}

/// Create a new file at `rel_path` with `contents`, failing with
/// [`StorageError::AlreadyExists`] if it is already there.
pub async fn write_new(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    create_parent_dir(&abs).await?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await
        .map_err(|e| classify(&abs, e))?;

    file.write_all(contents)
        .await
        .map_err(|e| classify(&abs, e))?;
    file.sync_all().await.map_err(|e| classify(&abs, e))?;
    Ok(())
}

/// Write `contents` to `rel_path`, replacing any existing file. Used for
/// files inside a staging directory that no reader can see yet.
pub async fn write_file(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    create_parent_dir(&abs).await?;

    let mut file = fs::File::create(&abs)
        .await
        .map_err(|e| classify(&abs, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| classify(&abs, e))?;
    file.sync_all().await.map_err(|e| classify(&abs, e))?;
    Ok(())
}

/// Read a UTF-8 file.
pub async fn read_to_string(location: &StoreLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.resolve(rel_path);
    fs::read_to_string(&abs)
        .await
        .map_err(|e| classify(&abs, e))
}

/// Read a file's bytes.
pub async fn read_all_bytes(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.resolve(rel_path);
    fs::read(&abs).await.map_err(|e| classify(&abs, e))
}

/// Create a directory and its parents.
pub async fn create_dir_all(location: &StoreLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    fs::create_dir_all(&abs)
        .await
        .map_err(|e| classify(&abs, e))
}

/// Rename `from` to `to`, both relative to the root.
pub async fn rename(location: &StoreLocation, from: &Path, to: &Path) -> StorageResult<()> {
    let abs_from = location.resolve(from);
    let abs_to = location.resolve(to);
    fs::rename(&abs_from, &abs_to)
        .await
        .map_err(|e| classify(&abs_to, e))
}

/// Remove a directory tree. A missing directory is not an error.
pub async fn remove_dir_all(location: &StoreLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = location.resolve(rel_path);
    match fs::remove_dir_all(&abs).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(&abs, e)),
    }
}

/// Names of the entries directly under `rel_path`. A missing directory
/// yields an empty list.
pub async fn list_dir(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<String>> {
    let abs = location.resolve(rel_path);
    let mut entries = match fs::read_dir(&abs).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(classify(&abs, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| classify(&abs, e))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_replaces_and_leaves_no_tmp() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel = Path::new("nested/CURRENT");

        write_atomic(&location, rel, b"1\n").await?;
        write_atomic(&location, rel, b"2\n").await?;

        assert_eq!(read_to_string(&location, rel).await?, "2\n");
        assert!(!tmp.path().join("nested/CURRENT.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn write_new_refuses_existing_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel = Path::new("_build.lock");

        write_new(&location, rel, b"first").await?;
        let err = write_new(&location, rel, b"second")
            .await
            .expect_err("second create must fail");

        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(read_to_string(&location, rel).await?, "first");
        Ok(())
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        let err = read_all_bytes(&location, Path::new("missing.parquet"))
            .await
            .expect_err("missing");
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(err.path().ends_with("missing.parquet"));
        Ok(())
    }

    #[tokio::test]
    async fn list_and_remove_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());

        assert!(list_dir(&location, Path::new("snapshots")).await?.is_empty());

        write_file(&location, Path::new("snapshots/0000000002/a"), b"x").await?;
        write_file(&location, Path::new("snapshots/0000000001/a"), b"x").await?;
        assert_eq!(
            list_dir(&location, Path::new("snapshots")).await?,
            vec!["0000000001".to_string(), "0000000002".to_string()]
        );

        remove_dir_all(&location, Path::new("snapshots/0000000001")).await?;
        remove_dir_all(&location, Path::new("snapshots/0000000001")).await?;
        assert_eq!(
            list_dir(&location, Path::new("snapshots")).await?,
            vec!["0000000002".to_string()]
        );
        Ok(())
    }
}
