//! Configuration types for the bundle update client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for an [`crate::updater::Updater`].
///
/// The host supplies the pieces it owns: the channel endpoint, its own
/// version string (used to namespace preferences so state from an
/// incompatible build is never reused), the embedded fallback bundle
/// shipped inside the app package, and a writable storage root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Base URL of the channel server, e.g. `https://updates.example.com/api`.
    pub endpoint: String,
    /// Host application version; part of the preference isolation key.
    pub app_version: String,
    /// Path to the bundle embedded in the app package. Always usable;
    /// resolution falls back to it whenever update state is missing or bad.
    pub fallback_bundle: PathBuf,
    /// Writable directory the client owns. Preferences, staged downloads,
    /// and installed bundles all live under this root.
    pub storage_root: PathBuf,
    /// Channel an instance subscribes to until it picks its own.
    #[serde(default = "default_channel")]
    pub default_channel: String,
    /// Download retry and timeout policy.
    #[serde(default)]
    pub download: DownloadConfig,
    /// Progress event throttling.
    #[serde(default)]
    pub progress: ProgressConfig,
}

impl UpdateConfig {
    /// Build a configuration with default download/progress policy.
    pub fn new(
        endpoint: impl Into<String>,
        app_version: impl Into<String>,
        fallback_bundle: impl Into<PathBuf>,
        storage_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            app_version: app_version.into(),
            fallback_bundle: fallback_bundle.into(),
            storage_root: storage_root.into(),
            default_channel: default_channel(),
            download: DownloadConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

fn default_channel() -> String {
    "production".to_owned()
}

/// Download retry and timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum attempts per network operation, first try included.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff_ms: u64,
    /// Ceiling for the exponential backoff.
    pub max_backoff_ms: u64,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds. Generous: payloads can be large
    /// and mobile links slow.
    pub request_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            connect_timeout_secs: 15,
            request_timeout_secs: 300,
        }
    }
}

/// Progress event throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum interval between `Downloading` events for one instance.
    /// Phase transitions are exempt and always emitted.
    pub min_emit_interval_ms: u64,
    /// Capacity of the event channel. When a slow consumer fills it,
    /// `Downloading` ticks are dropped rather than blocking the download.
    pub event_buffer: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_emit_interval_ms: 100,
            event_buffer: 64,
        }
    }
}
