//! Candidate bundle download.
//!
//! Streams a payload from the channel's download URL to a uniquely named
//! temp file under the storage root, reporting per-chunk progress.
//! Transient network failures are retried with capped exponential
//! backoff; a checksum mismatch on a *completed* download is surfaced
//! once as an integrity failure and never blindly retried — hammering a
//! consistently corrupt artifact only burns bandwidth and battery.
//!
//! All side effects stay inside the temp directory. Instance state is
//! only touched later, by the installer.

use crate::channel::{ChannelClient, ChannelDescriptor};
use crate::config::DownloadConfig;
use crate::error::{Result, UpdateError};
use crate::integrity;
use crate::progress::{ProgressEmitter, ProgressPhase};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A downloaded, checksum-verified candidate awaiting install.
///
/// Ephemeral: created per update check and consumed by the installer or
/// discarded. Never persisted.
#[derive(Debug)]
pub struct DownloadTask {
    /// Bundle the payload belongs to.
    pub bundle_id: String,
    /// URL the payload was fetched from.
    pub source_url: String,
    /// Temp file holding the verified payload.
    pub staged_path: PathBuf,
    /// SHA-256 hex digest the channel promised (and the payload matched).
    pub expected_checksum: String,
    /// Bytes actually received.
    pub bytes_received: u64,
    /// Total payload size, when known (0 otherwise).
    pub bytes_total: u64,
    /// Download attempts it took.
    pub attempts: u32,
}

/// Fetches candidate bundles from a channel.
pub struct UpdateDownloader {
    channel: ChannelClient,
    config: DownloadConfig,
    tmp_dir: PathBuf,
}

impl UpdateDownloader {
    /// Create a downloader writing temp files under `storage_root`.
    #[must_use]
    pub fn new(channel: ChannelClient, config: DownloadConfig, storage_root: &Path) -> Self {
        Self {
            channel,
            config,
            tmp_dir: storage_root.join("tmp"),
        }
    }

    /// Fetch the latest descriptor for `channel_name`, retrying transient
    /// failures per the backoff policy.
    ///
    /// # Errors
    ///
    /// [`UpdateError::NetworkFailure`] once attempts are exhausted,
    /// [`UpdateError::Cancelled`] if the token fires first.
    pub async fn latest_descriptor(
        &self,
        channel_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ChannelDescriptor>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }

            match self.channel.latest(channel_name).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(UpdateError::NetworkFailure { reason, .. }) => {
                    if attempt >= self.config.max_attempts {
                        return Err(UpdateError::NetworkFailure { attempts: attempt, reason });
                    }
                    warn!(attempt, %reason, "descriptor fetch failed, backing off");
                    self.backoff(attempt, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Download and verify the payload `descriptor` points at.
    ///
    /// Emits `Downloading` progress per chunk, then verifies the full
    /// content checksum before returning. Cancellation discards the temp
    /// file; no installer-visible state changes.
    ///
    /// # Errors
    ///
    /// [`UpdateError::NetworkFailure`] after exhausted retries,
    /// [`UpdateError::IntegrityFailure`] on a checksum mismatch (temp file
    /// discarded, not retried), [`UpdateError::Cancelled`].
    pub async fn fetch_payload(
        &self,
        descriptor: &ChannelDescriptor,
        instance_id: &str,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<DownloadTask> {
        std::fs::create_dir_all(&self.tmp_dir)?;

        let mut attempt = 0u32;
        let (staged_path, bytes_received, bytes_total) = loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }

            match self.stream_once(descriptor, instance_id, emitter, cancel).await {
                Ok(done) => break done,
                Err(UpdateError::NetworkFailure { reason, .. }) => {
                    if attempt >= self.config.max_attempts {
                        return Err(UpdateError::NetworkFailure { attempts: attempt, reason });
                    }
                    warn!(attempt, %reason, "payload download failed, backing off");
                    self.backoff(attempt, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        };

        emitter.emit(instance_id, ProgressPhase::Verifying, bytes_received, bytes_total);
        let actual = hash_file(&staged_path).await?;
        if !actual.eq_ignore_ascii_case(&descriptor.checksum) {
            let _ = std::fs::remove_file(&staged_path);
            return Err(UpdateError::IntegrityFailure {
                expected: descriptor.checksum.clone(),
                actual,
            });
        }

        info!(
            bundle_id = %descriptor.bundle_id,
            bytes = bytes_received,
            attempts = attempt,
            "payload downloaded and verified"
        );
        Ok(DownloadTask {
            bundle_id: descriptor.bundle_id.clone(),
            source_url: descriptor.download_url.clone(),
            staged_path,
            expected_checksum: descriptor.checksum.clone(),
            bytes_received,
            bytes_total,
            attempts: attempt,
        })
    }

    /// One streaming attempt. Any failure removes the partial temp file.
    async fn stream_once(
        &self,
        descriptor: &ChannelDescriptor,
        instance_id: &str,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, u64, u64)> {
        let dest = self.tmp_dir.join(format!("{}.part", Uuid::new_v4()));

        let resp = self
            .channel
            .http()
            .get(&descriptor.download_url)
            .send()
            .await
            .map_err(|e| transient(format!("payload request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(transient(format!("payload request returned {}", resp.status())));
        }

        let bytes_total = descriptor.size.or(resp.content_length()).unwrap_or(0);
        debug!(url = %descriptor.download_url, bytes_total, dest = %dest.display(), "streaming payload");

        let mut file = tokio::fs::File::create(&dest).await?;
        let mut stream = resp.bytes_stream();
        let mut bytes_received = 0u64;
        emitter.emit(instance_id, ProgressPhase::Downloading, 0, bytes_total);

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                drop(file);
                let _ = std::fs::remove_file(&dest);
                return Err(UpdateError::Cancelled);
            }
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    drop(file);
                    let _ = std::fs::remove_file(&dest);
                    return Err(transient(format!("payload stream interrupted: {e}")));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = std::fs::remove_file(&dest);
                return Err(UpdateError::Io(e));
            }
            bytes_received += chunk.len() as u64;
            emitter.emit(instance_id, ProgressPhase::Downloading, bytes_received, bytes_total);
        }
        file.flush().await?;

        Ok((dest, bytes_received, bytes_total))
    }

    /// Sleep out the capped exponential backoff, or bail on cancellation.
    async fn backoff(&self, completed_attempts: u32, cancel: &CancellationToken) -> Result<()> {
        let delay = backoff_delay(&self.config, completed_attempts);
        tokio::select! {
            _ = cancel.cancelled() => Err(UpdateError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Backoff before retry number `completed_attempts + 1`: doubles from the
/// configured initial delay, capped at the configured ceiling.
fn backoff_delay(config: &DownloadConfig, completed_attempts: u32) -> Duration {
    let exp = completed_attempts.saturating_sub(1).min(16);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(1u64 << exp)
        .min(config.max_backoff_ms);
    Duration::from_millis(ms)
}

fn transient(reason: String) -> UpdateError {
    UpdateError::NetworkFailure { attempts: 1, reason }
}

/// SHA-256 of a file, off the async workers.
async fn hash_file(path: &Path) -> Result<String> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || integrity::sha256_hex(&path))
        .await
        .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?
        .map_err(UpdateError::Io)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::ProgressConfig;
    use crate::integrity::sha256_hex_bytes;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAYLOAD: &[u8] = b"new bundle payload bytes";

    fn fast_config() -> DownloadConfig {
        DownloadConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..DownloadConfig::default()
        }
    }

    fn downloader(server: &MockServer, root: &Path) -> UpdateDownloader {
        let config = fast_config();
        let channel = ChannelClient::new(&server.uri(), "1.0.0", &config).unwrap();
        UpdateDownloader::new(channel, config, root)
    }

    fn descriptor(server: &MockServer, checksum: &str) -> ChannelDescriptor {
        ChannelDescriptor {
            bundle_id: "b2".to_owned(),
            checksum: checksum.to_owned(),
            download_url: format!("{}/payload/b2", server.uri()),
            size: Some(PAYLOAD.len() as u64),
        }
    }

    fn emitter() -> ProgressEmitter {
        ProgressEmitter::new(&ProgressConfig::default()).0
    }

    #[tokio::test]
    async fn downloads_and_verifies_payload() {
        let server = MockServer::start().await;
        let root = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/payload/b2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PAYLOAD))
            .mount(&server)
            .await;

        let dl = downloader(&server, root.path());
        let desc = descriptor(&server, &sha256_hex_bytes(PAYLOAD));
        let task = dl
            .fetch_payload(&desc, "default", &emitter(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(task.bytes_received, PAYLOAD.len() as u64);
        assert_eq!(task.attempts, 1);
        assert_eq!(std::fs::read(&task.staged_path).unwrap(), PAYLOAD);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let server = MockServer::start().await;
        let root = TempDir::new().unwrap();
        // First attempt hits a 503, the retry succeeds.
        Mock::given(method("GET"))
            .and(path("/payload/b2"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/payload/b2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PAYLOAD))
            .mount(&server)
            .await;

        let dl = downloader(&server, root.path());
        let desc = descriptor(&server, &sha256_hex_bytes(PAYLOAD));
        let task = dl
            .fetch_payload(&desc, "default", &emitter(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_network_failure() {
        let server = MockServer::start().await;
        let root = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/payload/b2"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let dl = downloader(&server, root.path());
        let desc = descriptor(&server, &sha256_hex_bytes(PAYLOAD));
        let err = dl
            .fetch_payload(&desc, "default", &emitter(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::NetworkFailure { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn checksum_mismatch_is_not_retried() {
        let server = MockServer::start().await;
        let root = TempDir::new().unwrap();
        // The payload downloads fine every time but never matches the
        // promised checksum; exactly one fetch must happen.
        Mock::given(method("GET"))
            .and(path("/payload/b2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"corrupted artifact"))
            .expect(1)
            .mount(&server)
            .await;

        let dl = downloader(&server, root.path());
        let desc = descriptor(&server, &sha256_hex_bytes(PAYLOAD));
        let err = dl
            .fetch_payload(&desc, "default", &emitter(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::IntegrityFailure { .. }));

        // The corrupt temp file was discarded.
        let leftovers: Vec<_> = std::fs::read_dir(root.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn cancellation_discards_temp_file() {
        let server = MockServer::start().await;
        let root = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/payload/b2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PAYLOAD))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let dl = downloader(&server, root.path());
        let desc = descriptor(&server, &sha256_hex_bytes(PAYLOAD));
        let err = dl
            .fetch_payload(&desc, "default", &emitter(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled));

        let tmp = root.path().join("tmp");
        let leftovers: Vec<_> = std::fs::read_dir(&tmp).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn descriptor_fetch_retries_then_succeeds() {
        let server = MockServer::start().await;
        let root = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/production/1.0.0"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/production/1.0.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bundle_id": "b2",
                "checksum": "cc".repeat(32),
                "download_url": "https://cdn.example.com/b2"
            })))
            .mount(&server)
            .await;

        let dl = downloader(&server, root.path());
        let desc = dl
            .latest_descriptor("production", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(desc.unwrap().bundle_id, "b2");
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let config = DownloadConfig {
            initial_backoff_ms: 500,
            max_backoff_ms: 3_000,
            ..DownloadConfig::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(2_000));
        // Capped from here on.
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(3_000));
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(3_000));
    }
}
