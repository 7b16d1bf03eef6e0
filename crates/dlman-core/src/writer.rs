//! Shared output file (§4.C).
//!
//! Segments write directly into their final offsets in one sparse
//! preallocated file rather than into per-segment temp files that get
//! copied together afterwards — there is nothing left to merge once every
//! segment has finished, just an fsync and a rename.

use crate::error::DlmanError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

const FSYNC_INTERVAL_BYTES: u64 = 16 * 1024 * 1024;

/// A single `.part` file shared by every segment of one download. Each
/// write is a seek-then-write critical section guarded by a mutex so
/// concurrent segments never interleave their positional writes.
pub struct SharedWriter {
    file: Mutex<File>,
    part_path: PathBuf,
    bytes_since_fsync: AtomicU64,
}

impl SharedWriter {
    /// Open (for resume) or create-and-preallocate (fresh download) the
    /// `.part` file for `final_path`. `total_size` of `None` leaves the file
    /// un-preallocated — used for single-segment downloads of unknown size.
    pub async fn open(final_path: &Path, total_size: Option<u64>) -> Result<Self, DlmanError> {
        let part_path = part_path_for(final_path);
        if let Some(parent) = part_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DlmanError::io(parent.display().to_string(), e))?;
        }

        let file = if part_path.exists() {
            OpenOptions::new()
                .write(true)
                .read(true)
                .open(&part_path)
                .await
                .map_err(|e| DlmanError::io(part_path.display().to_string(), e))?
        } else {
            let file = File::create(&part_path)
                .await
                .map_err(|e| DlmanError::io(part_path.display().to_string(), e))?;
            if let Some(size) = total_size {
                file.set_len(size)
                    .await
                    .map_err(|e| DlmanError::io(part_path.display().to_string(), e))?;
            }
            file
        };

        Ok(Self {
            file: Mutex::new(file),
            part_path,
            bytes_since_fsync: AtomicU64::new(0),
        })
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Write `data` at absolute offset `offset`. Periodically fsyncs so a
    /// crash loses at most `FSYNC_INTERVAL_BYTES` of unflushed writes per
    /// segment.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DlmanError> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| DlmanError::io(self.part_path.display().to_string(), e))?;
        file.write_all(data)
            .await
            .map_err(|e| DlmanError::io(self.part_path.display().to_string(), e))?;

        let total = self
            .bytes_since_fsync
            .fetch_add(data.len() as u64, Ordering::Relaxed)
            + data.len() as u64;
        if total >= FSYNC_INTERVAL_BYTES {
            file.sync_data()
                .await
                .map_err(|e| DlmanError::io(self.part_path.display().to_string(), e))?;
            self.bytes_since_fsync.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Extend the file to `size` bytes. Used when a single open-ended
    /// segment finally learns its true size.
    pub async fn set_len(&self, size: u64) -> Result<(), DlmanError> {
        let file = self.file.lock().await;
        file.set_len(size)
            .await
            .map_err(|e| DlmanError::io(self.part_path.display().to_string(), e))
    }

    /// Force every write to disk. Called on pause, cancel, and before
    /// finalizing a completed download.
    pub async fn fsync(&self) -> Result<(), DlmanError> {
        let file = self.file.lock().await;
        file.sync_data()
            .await
            .map_err(|e| DlmanError::io(self.part_path.display().to_string(), e))
    }

    /// fsync, drop the open handle, and atomically rename `.part` to its
    /// final resting place, suffixing " (N)" if a file with that name
    /// already exists.
    pub async fn finalize(self, destination_dir: &Path, filename: &str) -> Result<PathBuf, DlmanError> {
        self.fsync().await?;
        drop(self.file.into_inner());

        let final_path = unique_destination(destination_dir, filename).await;
        tokio::fs::rename(&self.part_path, &final_path)
            .await
            .map_err(|e| DlmanError::io(final_path.display().to_string(), e))?;
        Ok(final_path)
    }

    /// Remove the `.part` file. Called on cancel/delete.
    pub async fn discard(self) -> Result<(), DlmanError> {
        drop(self.file.into_inner());
        match tokio::fs::remove_file(&self.part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DlmanError::io(self.part_path.display().to_string(), e)),
        }
    }
}

fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

/// Find a filename in `dir` that doesn't collide with an existing file,
/// appending " (1)", " (2)", ... before the extension as needed.
async fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    for n in 1u32.. {
        let candidate_name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(&candidate_name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("ran out of u32 suffixes")
}

/// Shared handle type used by segment workers.
pub type SharedWriterHandle = Arc<SharedWriter>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn preallocates_and_writes_at_offset() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("file.bin");
        let writer = SharedWriter::open(&final_path, Some(10)).await.unwrap();
        writer.write_at(5, b"hello").await.unwrap();
        writer.fsync().await.unwrap();

        let contents = tokio::fs::read(writer.part_path()).await.unwrap();
        assert_eq!(contents.len(), 10);
        assert_eq!(&contents[5..10], b"hello");
    }

    #[tokio::test]
    async fn finalize_renames_and_dedupes() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("report.pdf");
        tokio::fs::write(&final_path, b"existing").await.unwrap();

        let writer = SharedWriter::open(&final_path, Some(4)).await.unwrap();
        writer.write_at(0, b"data").await.unwrap();
        let result = writer.finalize(dir.path(), "report.pdf").await.unwrap();

        assert_eq!(result, dir.path().join("report (1).pdf"));
        assert_eq!(tokio::fs::read(&result).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn discard_removes_part_file() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("file.bin");
        let writer = SharedWriter::open(&final_path, Some(4)).await.unwrap();
        let part_path = writer.part_path().to_path_buf();
        writer.discard().await.unwrap();
        assert!(!part_path.exists());
    }
}
