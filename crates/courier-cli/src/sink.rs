//! [`ChunkSink`] writing to a partial file with an ETag sidecar.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use courier_client::download::{ChunkSink, ResetReason, TransferState};
use courier_client::SinkError;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub struct FileSink {
    file: File,
    etag_path: PathBuf,
    written: u64,
    /// ETag reported by the downloader but not yet on disk.
    pending_etag: Option<String>,
    stored_etag: Option<String>,
    last_logged_percent: Option<u8>,
}

impl FileSink {
    /// Open `part_path` for appending. Existing bytes are kept and count as
    /// the resume offset.
    pub async fn open(part_path: &Path, etag_path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = part_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(part_path)
            .await?;
        let written = file.metadata().await?.len();

        let stored_etag = match fs::read_to_string(etag_path).await {
            Ok(raw) => Some(raw.trim().to_string()).filter(|e| !e.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        debug!(path = %part_path.display(), written, etag = ?stored_etag, "partial file opened");
        Ok(Self {
            file,
            etag_path: etag_path.to_path_buf(),
            written,
            pending_etag: None,
            stored_etag,
            last_logged_percent: None,
        })
    }

    /// Bytes already in the partial file.
    pub fn offset(&self) -> u64 {
        self.written
    }

    /// Validator of the bytes already in the partial file. Without one the
    /// resume is unconditional.
    pub fn etag(&self) -> Option<&str> {
        self.stored_etag.as_deref()
    }

    async fn store_etag(&mut self) -> Result<(), SinkError> {
        let Some(etag) = self.pending_etag.take() else {
            return Ok(());
        };
        if self.stored_etag.as_deref() != Some(etag.as_str()) {
            fs::write(&self.etag_path, etag.as_bytes()).await?;
            self.stored_etag = Some(etag);
        }
        Ok(())
    }

    /// Flush buffered data to disk. Call before dropping the sink.
    pub async fn close(mut self) -> Result<(), SinkError> {
        self.store_etag().await?;
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    pub async fn discard_etag(&self) -> Result<(), SinkError> {
        remove_etag_file(&self.etag_path).await
    }
}

/// Remove an ETag sidecar; a missing file is fine.
pub async fn remove_etag_file(path: &Path) -> Result<(), SinkError> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.store_etag().await?;
        self.file.write_all(&chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn reset(&mut self, reason: ResetReason) -> Result<(), SinkError> {
        warn!(%reason, discarded = self.written, "discarding partial file");
        self.file.flush().await?;
        self.file.set_len(0).await?;
        self.written = 0;
        self.stored_etag = None;
        self.pending_etag = None;
        self.discard_etag().await
    }

    fn progress(&mut self, state: &TransferState) {
        if state.etag.is_some() && state.etag != self.stored_etag {
            self.pending_etag = state.etag.clone();
        }

        let Some(percent) = state.percent() else {
            return;
        };
        let step = percent / 10;
        if self.last_logged_percent.map(|p| p / 10) != Some(step) {
            self.last_logged_percent = Some(percent);
            info!(received = state.received, total = ?state.total, "{percent}%");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        (dir.path().join("a.bin.part"), dir.path().join("a.bin.part.etag"))
    }

    fn state(received: u64, etag: &str) -> TransferState {
        TransferState {
            received,
            total: Some(6),
            etag: Some(etag.to_string()),
            url_refresh_count: 0,
        }
    }

    #[tokio::test]
    async fn resumes_from_existing_bytes_and_etag() {
        let dir = tempfile::tempdir().unwrap();
        let (part, etag) = paths(&dir);

        let mut sink = FileSink::open(&part, &etag).await.unwrap();
        assert_eq!(sink.offset(), 0);
        assert_eq!(sink.etag(), None);
        sink.progress(&state(0, "6-1"));
        sink.write_chunk(Bytes::from_static(b"ab")).await.unwrap();
        sink.close().await.unwrap();

        let sink = FileSink::open(&part, &etag).await.unwrap();
        assert_eq!(sink.offset(), 2);
        assert_eq!(sink.etag(), Some("6-1"));
        assert_eq!(std::fs::read(&part).unwrap(), b"ab");
    }

    #[tokio::test]
    async fn reset_truncates_and_drops_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let (part, etag) = paths(&dir);
        std::fs::write(&part, b"stale").unwrap();
        std::fs::write(&etag, b"6-1").unwrap();

        let mut sink = FileSink::open(&part, &etag).await.unwrap();
        assert_eq!(sink.offset(), 5);
        sink.reset(ResetReason::RangeIgnored).await.unwrap();
        assert!(!etag.exists());

        sink.progress(&state(0, "6-2"));
        sink.write_chunk(Bytes::from_static(b"abcdef")).await.unwrap();
        assert_eq!(sink.offset(), 6);
        sink.close().await.unwrap();

        assert_eq!(std::fs::read(&part).unwrap(), b"abcdef");
        assert_eq!(std::fs::read_to_string(&etag).unwrap(), "6-2");
    }

    #[tokio::test]
    async fn discard_etag_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (part, etag) = paths(&dir);
        let sink = FileSink::open(&part, &etag).await.unwrap();
        sink.discard_etag().await.unwrap();
        remove_etag_file(&etag).await.unwrap();
    }
}
