//! [`Fetcher`] backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;

use super::{FetchResponse, Fetcher};
use crate::error::FetchError;

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a client; `connect_timeout` bounds connection setup only, since
    /// bodies may legitimately stream for a long time.
    pub fn new(connect_timeout: Option<Duration>) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, headers: HeaderMap) -> Result<FetchResponse, FetchError> {
        let response = self.client.get(url).headers(headers).send().await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        tracing::debug!(status, url, "download response");

        let body = response.bytes_stream().map_err(FetchError::from).boxed();
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}
