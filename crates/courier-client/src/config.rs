//! Client tunables loaded from environment variables.
//!
//! Every setting has a default, so an embedding app can start with zero
//! configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::download::DownloadOptions;
use crate::drain::DrainPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Maximum sends issued by one drain pass.
    /// Env: `COURIER_DRAIN_MAX`
    /// Default: `12`
    pub drain_max: usize,

    /// First retry delay for a failed send; doubles per attempt.
    /// Env: `COURIER_RETRY_BASE_MS`
    /// Default: `900`
    pub retry_base_ms: u64,

    /// Upper bound of the send retry delay.
    /// Env: `COURIER_RETRY_MAX_MS`
    /// Default: `60000`
    pub retry_max_ms: u64,

    /// Retryable failures tolerated before an entry is marked `Error`.
    /// Env: `COURIER_MAX_SEND_ATTEMPTS`
    /// Default: `8`
    pub max_send_attempts: u32,

    /// Scheduled entries due within this window are sent early.
    /// Env: `COURIER_SCHEDULE_GRACE_MS`
    /// Default: `1200`
    pub schedule_grace_ms: i64,

    /// A send without a server answer for this long is re-queued.
    /// Env: `COURIER_SENDING_TIMEOUT_MS`
    /// Default: `30000`
    pub sending_timeout_ms: i64,

    /// Env: `COURIER_DOWNLOAD_BASE_DELAY_MS`
    /// Default: `400`
    pub download_base_delay_ms: u64,

    /// Env: `COURIER_DOWNLOAD_MAX_DELAY_MS`
    /// Default: `8000`
    pub download_max_delay_ms: u64,

    /// Env: `COURIER_DOWNLOAD_MAX_RETRIES`
    /// Default: `6`
    pub download_max_retries: u32,

    /// Signed URL refreshes allowed per download.
    /// Env: `COURIER_MAX_URL_REFRESHES`
    /// Default: `2`
    pub max_url_refreshes: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            drain_max: 12,
            retry_base_ms: 900,
            retry_max_ms: 60_000,
            max_send_attempts: 8,
            schedule_grace_ms: 1_200,
            sending_timeout_ms: 30_000,
            download_base_delay_ms: 400,
            download_max_delay_ms: 8_000,
            download_max_retries: 6,
            max_url_refreshes: 2,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_override("COURIER_DRAIN_MAX", &mut config.drain_max);
        env_override("COURIER_RETRY_BASE_MS", &mut config.retry_base_ms);
        env_override("COURIER_RETRY_MAX_MS", &mut config.retry_max_ms);
        env_override("COURIER_MAX_SEND_ATTEMPTS", &mut config.max_send_attempts);
        env_override("COURIER_SCHEDULE_GRACE_MS", &mut config.schedule_grace_ms);
        env_override("COURIER_SENDING_TIMEOUT_MS", &mut config.sending_timeout_ms);
        env_override(
            "COURIER_DOWNLOAD_BASE_DELAY_MS",
            &mut config.download_base_delay_ms,
        );
        env_override(
            "COURIER_DOWNLOAD_MAX_DELAY_MS",
            &mut config.download_max_delay_ms,
        );
        env_override(
            "COURIER_DOWNLOAD_MAX_RETRIES",
            &mut config.download_max_retries,
        );
        env_override("COURIER_MAX_URL_REFRESHES", &mut config.max_url_refreshes);

        config
    }

    pub fn drain_policy(&self) -> DrainPolicy {
        DrainPolicy {
            drain_max: self.drain_max.max(1),
            schedule_grace_ms: self.schedule_grace_ms.max(0),
            retry: Backoff::new(
                Duration::from_millis(self.retry_base_ms),
                Duration::from_millis(self.retry_max_ms),
            ),
            max_attempts: self.max_send_attempts.max(1),
            sending_timeout_ms: self.sending_timeout_ms.max(0),
        }
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            max_retries: self.download_max_retries,
            backoff: Backoff::new(
                Duration::from_millis(self.download_base_delay_ms),
                Duration::from_millis(self.download_max_delay_ms),
            ),
            max_url_refreshes: self.max_url_refreshes,
            ..DownloadOptions::default()
        }
    }
}

fn env_override<T: FromStr>(name: &str, target: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Invalid value, using default");
        }
    }
}
