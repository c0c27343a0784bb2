//! Remote channel descriptor fetch.
//!
//! A channel server answers "what is the latest bundle for this channel
//! and app version" with a small JSON descriptor. The wire format is
//! consumed, not defined, here; keep the client small and resilient so a
//! misbehaving server degrades to "no update" semantics at the caller.

use crate::config::DownloadConfig;
use crate::error::{Result, UpdateError};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Latest-bundle descriptor published on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelDescriptor {
    /// Opaque versioned bundle identifier.
    pub bundle_id: String,
    /// SHA-256 hex digest of the payload.
    pub checksum: String,
    /// Where to fetch the payload.
    pub download_url: String,
    /// Payload size in bytes, when the server knows it.
    #[serde(default)]
    pub size: Option<u64>,
}

/// HTTP client for the channel server.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    client: reqwest::Client,
    endpoint: String,
    app_version: String,
}

impl ChannelClient {
    /// Build a client for `endpoint`, scoped to one app version.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::NetworkFailure`] if the underlying HTTP
    /// client cannot be constructed.
    pub fn new(endpoint: &str, app_version: &str, config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| UpdateError::NetworkFailure {
                attempts: 0,
                reason: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            app_version: app_version.to_owned(),
        })
    }

    /// The HTTP client, shared with the payload downloader so both reuse
    /// one connection pool.
    #[must_use]
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetch the latest descriptor for `channel`, single attempt.
    ///
    /// `Ok(None)` means the channel has nothing published (HTTP 204 or a
    /// `null` body). Retry policy belongs to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::NetworkFailure`] with `attempts: 1` on any
    /// transport or status failure; the downloader folds these into its
    /// backoff loop.
    pub async fn latest(&self, channel: &str) -> Result<Option<ChannelDescriptor>> {
        let url = format!("{}/{}/{}", self.endpoint, channel, self.app_version);
        debug!(%url, "fetching channel descriptor");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| network_failure(format!("descriptor request failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(network_failure(format!(
                "descriptor request returned {}",
                resp.status()
            )));
        }

        resp.json::<Option<ChannelDescriptor>>()
            .await
            .map_err(|e| network_failure(format!("malformed descriptor: {e}")))
    }
}

fn network_failure(reason: String) -> UpdateError {
    UpdateError::NetworkFailure { attempts: 1, reason }
}
