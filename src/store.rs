//! Shared-root file store
//!
//! Everything the server touches on disk goes through [`FileStore`]: flat
//! listing of the root, name validation, opening files for download and
//! staging uploads as hidden `.<name>.part` files that are renamed into
//! place on commit.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::protocol::part_name;

/// A file in the shared root and its size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
}

/// Check a client-supplied filename before it reaches the filesystem.
///
/// Only bare names directly inside the root are accepted: no `..`, no path
/// separators, no NUL, and no leading `.` (that namespace holds in-flight
/// uploads).
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.starts_with('.');
    if bad {
        return Err(StoreError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Whether a directory entry name should appear in a listing.
fn listable(name: &str) -> bool {
    !name.starts_with('.') && !name.contains('\n')
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Regular files directly inside the root, sorted by name.
    pub async fn list(&self) -> Result<Vec<FileRecord>, StoreError> {
        let mut rd = fs::read_dir(&self.root).await.map_err(StoreError::ListDir)?;
        let mut records = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(StoreError::ListDir)? {
            // file_type() does not follow symlinks, so links are skipped
            match entry.file_type().await {
                Ok(ft) if ft.is_file() => {}
                _ => continue,
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !listable(&name) {
                continue;
            }
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            records.push(FileRecord { name, size });
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Size of an existing regular file.
    pub async fn stat(&self, name: &str) -> Result<FileRecord, StoreError> {
        validate_name(name)?;
        match fs::metadata(self.path_of(name)).await {
            Ok(meta) if meta.is_file() => Ok(FileRecord {
                name: name.to_string(),
                size: meta.len(),
            }),
            _ => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Open a file for streaming. The returned size comes from the open
    /// handle, so it always matches the bytes that can be read from it.
    pub async fn open_read(&self, name: &str) -> Result<(File, FileRecord), StoreError> {
        validate_name(name)?;
        let open_err = |source| StoreError::Open {
            name: name.to_string(),
            source,
        };
        let file = File::open(self.path_of(name)).await.map_err(open_err)?;
        let meta = file.metadata().await.map_err(open_err)?;
        if !meta.is_file() {
            return Err(StoreError::NotFound {
                name: name.to_string(),
            });
        }
        Ok((
            file,
            FileRecord {
                name: name.to_string(),
                size: meta.len(),
            },
        ))
    }

    /// Create (or truncate) the temp file an upload of `name` is staged in.
    ///
    /// The caller must hold the registry lock for `name`; the temp path is
    /// shared by every upload of the same name.
    pub async fn begin_upload(&self, name: &str, declared: u64) -> Result<UploadSession, StoreError> {
        validate_name(name)?;
        let temp_path = self.path_of(&part_name(name));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|source| StoreError::Create {
                name: name.to_string(),
                source,
            })?;
        debug!(file = name, temp = %temp_path.display(), declared, "upload staged");
        Ok(UploadSession {
            name: name.to_string(),
            declared,
            received: 0,
            final_path: self.path_of(name),
            temp_path,
            file: Some(file),
            settled: false,
        })
    }
}

/// State of one in-flight upload.
///
/// Must end in [`commit`](Self::commit) or [`abort`](Self::abort). If it is
/// dropped without either (task cancelled, early return) the temp file is
/// removed synchronously.
#[derive(Debug)]
pub struct UploadSession {
    name: String,
    declared: u64,
    received: u64,
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
    settled: bool,
}

impl UploadSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared(&self) -> u64 {
        self.declared
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn remaining(&self) -> u64 {
        self.declared.saturating_sub(self.received)
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), StoreError> {
        let Some(file) = self.file.as_mut() else {
            return Err(self.write_err(std::io::Error::other("upload already closed")));
        };
        if let Err(e) = file.write_all(data).await {
            return Err(self.write_err(e));
        }
        self.received += data.len() as u64;
        Ok(())
    }

    fn write_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Write {
            name: self.name.clone(),
            source,
        }
    }

    /// Flush the temp file and rename it over the final name.
    ///
    /// On rename failure the temp file is left in place for inspection.
    pub async fn commit(mut self) -> Result<FileRecord, StoreError> {
        if let Some(mut file) = self.file.take() {
            let flushed = match file.flush().await {
                Ok(()) => file.sync_all().await,
                Err(e) => Err(e),
            };
            if let Err(e) = flushed {
                let err = self.write_err(e);
                drop(file);
                self.abort().await;
                return Err(err);
            }
        }
        self.settled = true;
        fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(|source| StoreError::Rename {
                name: self.name.clone(),
                source,
            })?;
        Ok(FileRecord {
            name: self.name.clone(),
            size: self.received,
        })
    }

    /// Discard the temp file. Failure to delete is logged, never returned.
    pub async fn abort(mut self) {
        self.settled = true;
        drop(self.file.take());
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            warn!(file = %self.name, temp = %self.temp_path.display(), error = %e, "failed to remove partial upload");
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        drop(self.file.take());
        if let Err(e) = std::fs::remove_file(&self.temp_path) {
            warn!(file = %self.name, error = %e, "failed to remove abandoned upload");
        }
    }
}
