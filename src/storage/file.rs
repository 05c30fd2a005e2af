//! File storage module
//!
//! Maps torrent byte ranges onto the files under the output directory.
//! Every read and write acquires its file handle for the duration of
//! that one operation and flushes before releasing it, so no handle is
//! held between operations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::piece::verify_piece;
use crate::torrent::TorrentInfo;

/// Counts a file handle while it is alive
struct HandleGuard(Arc<AtomicUsize>);

impl HandleGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// File storage for torrent data
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// Output directory the layout is rooted at
    root: PathBuf,
    /// Torrent information
    info: Arc<TorrentInfo>,
    /// Handles currently open
    open_handles: Arc<AtomicUsize>,
}

impl FileStorage {
    /// Create storage for `info` rooted at `root`
    pub fn new(root: impl Into<PathBuf>, info: Arc<TorrentInfo>) -> Self {
        Self::with_handle_counter(root, info, Arc::new(AtomicUsize::new(0)))
    }

    /// Create storage that reports open handles through `counter`
    pub fn with_handle_counter(root: impl Into<PathBuf>, info: Arc<TorrentInfo>, counter: Arc<AtomicUsize>) -> Self {
        Self {
            root: root.into(),
            info,
            open_handles: counter,
        }
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    /// Number of file handles currently open
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Shared handle counter, readable after the storage moves elsewhere
    pub fn handle_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_handles)
    }

    /// Create the directory structure and any zero-length files.
    /// Existing files are left untouched so earlier progress survives.
    pub async fn prepare(&self) -> Result<()> {
        info!("Preparing file layout for '{}' under {}", self.info.name, self.root.display());

        for (index, file) in self.info.files.iter().enumerate() {
            let path = self.root.join(file.relative_path());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::io_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }

            if file.length == 0 && fs::metadata(&path).await.is_err() {
                debug!("Creating empty file {} ({})", index, path.display());
                let _guard = HandleGuard::acquire(&self.open_handles);
                let mut handle = fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .await
                    .map_err(|e| {
                        error!("Failed to create file '{}': {}", path.display(), e);
                        TorrentError::io_error_full("Failed to create file", path.display().to_string(), e.to_string())
                    })?;
                handle.flush().await?;
            }
        }

        Ok(())
    }

    /// Write `data` at `offset` within one file of the layout
    pub async fn write_at(&self, file_index: usize, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.checked_path(file_index, offset, data.len() as u64)?;
        trace!("Writing {} bytes to {} at offset {}", data.len(), path.display(), offset);

        let _guard = HandleGuard::acquire(&self.open_handles);
        let mut handle = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| {
                error!("Failed to open file '{}': {}", path.display(), e);
                TorrentError::io_error_full("Failed to open file for writing", path.display().to_string(), e.to_string())
            })?;

        handle.seek(std::io::SeekFrom::Start(offset)).await.map_err(|e| {
            error!("Failed to seek in file '{}': {}", path.display(), e);
            TorrentError::io_error_full("Failed to seek in file", path.display().to_string(), e.to_string())
        })?;
        handle.write_all(data).await.map_err(|e| {
            error!("Failed to write to file '{}': {}", path.display(), e);
            TorrentError::io_error_full("Failed to write to file", path.display().to_string(), e.to_string())
        })?;
        handle.flush().await.map_err(|e| {
            error!("Failed to flush file '{}': {}", path.display(), e);
            TorrentError::io_error_full("Failed to flush file", path.display().to_string(), e.to_string())
        })?;

        Ok(())
    }

    /// Read `length` bytes at `offset` within one file. Returns `None`
    /// when the file is missing or too short.
    pub async fn read_at(&self, file_index: usize, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let path = self.checked_path(file_index, offset, length)?;

        let _guard = HandleGuard::acquire(&self.open_handles);
        let mut handle = match fs::File::open(&path).await {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TorrentError::io_error_full("Failed to open file for reading", path.display().to_string(), e.to_string()).into())
            }
        };

        let size = handle.metadata().await?.len();
        if size < offset + length {
            return Ok(None);
        }

        handle.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut chunk = vec![0u8; length as usize];
        handle.read_exact(&mut chunk).await.map_err(|e| {
            TorrentError::io_error_full("Failed to read from file", path.display().to_string(), e.to_string())
        })?;
        Ok(Some(chunk))
    }

    /// Read a whole piece from disk, or `None` if any part is absent
    pub async fn read_piece(&self, index: u32) -> Result<Option<Vec<u8>>> {
        let Some((start, end)) = self.info.piece_range(index) else {
            return Err(TorrentError::io_error(format!("Piece {} out of range", index)).into());
        };

        let mut data = Vec::with_capacity((end - start) as usize);
        for slice in self.info.file_slices(start, end - start) {
            match self.read_at(slice.file_index, slice.file_offset, slice.length).await? {
                Some(chunk) => data.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
        Ok(Some(data))
    }

    /// Hash every piece already on disk and return the ones that match.
    /// Missing or short files simply contribute no pieces.
    pub async fn verify_existing(&self) -> Result<Vec<u32>> {
        let mut present = Vec::new();
        for index in 0..self.info.piece_count() as u32 {
            let Some(data) = self.read_piece(index).await? else { continue };
            if verify_piece(data, self.info.piece_hash(index)).await.0 {
                present.push(index);
            }
        }

        if !present.is_empty() {
            info!("Found {}/{} verified pieces on disk", present.len(), self.info.piece_count());
        }
        Ok(present)
    }

    /// Resolve a file path, refusing ranges outside the file
    fn checked_path(&self, file_index: usize, offset: u64, length: u64) -> Result<PathBuf> {
        let file = self.info.files.get(file_index).ok_or_else(|| {
            TorrentError::io_error(format!("File index {} out of range", file_index))
        })?;
        if offset + length > file.length {
            return Err(TorrentError::io_error_with_path(
                format!("Range {}+{} exceeds file length {}", offset, length, file.length),
                file.relative_path().display().to_string(),
            ).into());
        }
        Ok(self.root.join(file.relative_path()))
    }
}
