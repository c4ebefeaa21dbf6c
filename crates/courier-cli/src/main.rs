//! # courier-fetch
//!
//! Resumable file download from the command line.
//!
//! The file is written to `<output>.part` and renamed on success. If the
//! download is interrupted (network loss, Ctrl+C) running the same command
//! again resumes from the bytes already on disk, validated by the ETag kept
//! in `<output>.part.etag`. The outcome is recorded in the transfer history
//! of the local SQLite database.

mod config;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use courier_client::download::{CancelHandle, DownloadRequest, Downloader, HttpFetcher};
use courier_client::transfers::{TransferMeta, TransferTracker};
use courier_client::{ClientConfig, DownloadError};
use courier_shared::PeerId;
use courier_store::Database;
use tracing::{error, info, warn};

use crate::config::CliConfig;
use crate::sink::FileSink;

const DEFAULT_FILTER: &str = "info,courier_cli=debug,courier_client=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    courier_client::logging::init_tracing_with(DEFAULT_FILTER);

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = CliConfig::parse();
    let client_config = ClientConfig::from_env();
    info!(url = %config.url, output = %config.output.display(), "Starting download");

    // -----------------------------------------------------------------------
    // 3. Open the history database and the partial file
    // -----------------------------------------------------------------------
    let db = match &config.db {
        Some(path) => Database::open_at(path),
        None => Database::new(),
    }
    .context("opening the history database")?;
    let mut tracker = TransferTracker::load(&db, &config.user)?;

    let part_path = config.part_path();
    let mut sink = FileSink::open(&part_path, &config.etag_path())
        .await
        .with_context(|| format!("opening {}", part_path.display()))?;
    if sink.offset() > 0 {
        info!(offset = sink.offset(), etag = ?sink.etag(), "Resuming partial download");
    }

    let transfer_id = format!("fetch-{}", chrono::Utc::now().timestamp_millis());
    tracker.begin_download(
        TransferMeta {
            id: transfer_id.clone(),
            local_id: None,
            name: config.display_name(),
            size: config.expected_size.unwrap_or(0),
            peer: PeerId::new(config.peer.clone()),
            room: None,
        },
        config.url.clone(),
    );

    // -----------------------------------------------------------------------
    // 4. Cancel on Ctrl+C
    // -----------------------------------------------------------------------
    let cancel = CancelHandle::new();
    let signal = cancel.signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, stopping download");
            cancel.cancel();
        }
    });

    // -----------------------------------------------------------------------
    // 5. Download
    // -----------------------------------------------------------------------
    let fetcher = HttpFetcher::new(Some(Duration::from_secs(config.connect_timeout_secs)))?;
    let downloader = Downloader::new(Arc::new(fetcher)).with_options(client_config.download_options());

    let mut request = DownloadRequest::new(config.url.clone())
        .resume_from(sink.offset(), sink.etag().map(str::to_string));
    if let Some(size) = config.expected_size {
        request = request.with_expected_size(size);
    }

    let result = downloader.download(request, &mut sink, Some(signal)).await;
    sink.close().await?;
    if result.is_ok() {
        sink::remove_etag_file(&config.etag_path()).await?;
    }

    // -----------------------------------------------------------------------
    // 6. Finalize and record the outcome
    // -----------------------------------------------------------------------
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(DownloadError::Cancelled) => {
            info!(part = %part_path.display(), "Download cancelled, partial data kept for resume");
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "Download failed");
            tracker.finish(&transfer_id, Err(e.to_string()));
            tracker.save(&db, &config.user)?;
            return Err(e.into());
        }
    };

    tokio::fs::rename(&part_path, &config.output)
        .await
        .with_context(|| format!("moving download to {}", config.output.display()))?;

    if let Some(total) = outcome.total {
        tracker.set_size(&transfer_id, total);
    }
    tracker.update_progress(&transfer_id, outcome.received);
    tracker.finish(&transfer_id, Ok(()));
    tracker.save(&db, &config.user)?;

    info!(
        bytes = outcome.received,
        mime = outcome.mime.as_deref().unwrap_or("-"),
        url_refreshes = outcome.url_refresh_count,
        output = %config.output.display(),
        "Download complete"
    );
    Ok(())
}
