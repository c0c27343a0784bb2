//! Host-facing update orchestration.
//!
//! Ties the components together behind the small surface the host binding
//! layer calls: resolve the active bundle, check a channel for something
//! newer, stream progress, switch channels, roll back. Each operation is
//! scoped to an instance; the default instance covers the common
//! single-bundle application.

use crate::channel::ChannelClient;
use crate::config::UpdateConfig;
use crate::download::UpdateDownloader;
use crate::error::Result;
use crate::prefs::PreferenceStore;
use crate::progress::{ProgressEmitter, ProgressEvent, ProgressPhase};
use crate::registry::{InstanceRegistry, UpdaterInstance};
use crate::resolver::{BundleLocation, BundleRecord};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of an update check. "Nothing newer" is a normal result, not an
/// error; failures are reported through [`crate::UpdateError`].
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// The channel has nothing newer than what is running.
    NoUpdate,
    /// A newer bundle was installed and committed. The host should reload
    /// into it at the next safe point.
    Updated(BundleRecord),
}

/// The bundle update client.
pub struct Updater {
    config: UpdateConfig,
    registry: InstanceRegistry,
    downloader: UpdateDownloader,
    emitter: ProgressEmitter,
    events: Mutex<Option<ReceiverStream<ProgressEvent>>>,
}

impl Updater {
    /// Build an updater from host-supplied configuration.
    ///
    /// # Errors
    ///
    /// [`crate::UpdateError::StoreUnavailable`] if the preference medium
    /// cannot be opened, [`crate::UpdateError::NetworkFailure`] if the
    /// HTTP client cannot be constructed. A host that cannot build an
    /// updater should load its embedded bundle directly.
    pub fn new(config: UpdateConfig) -> Result<Self> {
        let store = PreferenceStore::open(&config.storage_root, &config.app_version)?;
        let channel_client = ChannelClient::new(&config.endpoint, &config.app_version, &config.download)?;
        let downloader =
            UpdateDownloader::new(channel_client, config.download.clone(), &config.storage_root);
        let (emitter, events) = ProgressEmitter::new(&config.progress);
        let registry = InstanceRegistry::new(
            store,
            config.storage_root.clone(),
            config.fallback_bundle.clone(),
            config.default_channel.clone(),
        );

        Ok(Self {
            config,
            registry,
            downloader,
            emitter,
            events: Mutex::new(Some(events)),
        })
    }

    /// The configuration this updater was built with.
    #[must_use]
    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// The instance behind `instance_id` (`None` = default), created
    /// lazily on first access.
    pub fn instance(&self, instance_id: Option<&str>) -> Arc<UpdaterInstance> {
        self.registry.get_or_create(instance_id)
    }

    /// Resolve the currently active bundle for an instance. Infallible and
    /// cheap enough for every cold start: local disk and persisted
    /// metadata only, self-healing on anything invalid.
    pub fn active_bundle(&self, instance_id: Option<&str>) -> BundleLocation {
        self.instance(instance_id).resolver().resolve()
    }

    /// Path the host should load its bundle from right now.
    pub fn bundle_path(&self, instance_id: Option<&str>) -> PathBuf {
        self.active_bundle(instance_id).path().to_path_buf()
    }

    /// The progress event stream. Single consumer; the first call takes
    /// it, later calls return `None`.
    pub fn progress_events(&self) -> Option<ReceiverStream<ProgressEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// The channel an instance subscribes to.
    #[must_use]
    pub fn channel(&self, instance_id: Option<&str>) -> String {
        self.instance(instance_id).channel()
    }

    /// Subscribe an instance to `channel` for subsequent checks.
    ///
    /// # Errors
    ///
    /// [`crate::UpdateError::StoreUnavailable`] if the preference write
    /// fails.
    pub fn set_channel(&self, instance_id: Option<&str>, channel: &str) -> Result<()> {
        self.instance(instance_id).set_channel(channel)
    }

    /// Roll an instance back to the embedded fallback bundle.
    ///
    /// # Errors
    ///
    /// [`crate::UpdateError::InstallInProgress`] while an install is in
    /// flight, [`crate::UpdateError::StoreUnavailable`] if the record
    /// cannot be cleared.
    pub async fn reset(&self, instance_id: Option<&str>) -> Result<()> {
        self.instance(instance_id).installer().reset().await
    }

    /// Check the instance's channel for a newer bundle and install it.
    ///
    /// `channel` overrides (and persists) the instance's subscription;
    /// `None` keeps the current one. The whole check is guarded by the
    /// instance's install gate, so concurrent checks on one instance are
    /// rejected with `InstallInProgress` rather than racing on the
    /// "which is newer" decision. Distinct instances proceed
    /// independently.
    ///
    /// Cancellation is honored during network suspension points; once
    /// installation begins it runs to completion or failure.
    ///
    /// # Errors
    ///
    /// Any [`crate::UpdateError`]; the instance's active bundle is
    /// unchanged unless `Ok(CheckOutcome::Updated)` is returned.
    pub async fn check_for_update(
        &self,
        instance_id: Option<&str>,
        channel: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome> {
        let inst = self.instance(instance_id);
        let permit = inst.installer().try_begin()?;

        let channel_name = match channel {
            Some(c) if !c.trim().is_empty() => {
                if inst.channel() != c {
                    inst.set_channel(c)?;
                }
                c.to_owned()
            }
            _ => inst.channel(),
        };
        inst.mark_checked();

        let Some(descriptor) = self.downloader.latest_descriptor(&channel_name, cancel).await?
        else {
            return Ok(CheckOutcome::NoUpdate);
        };

        if inst.resolver().active_bundle_id().as_deref() == Some(descriptor.bundle_id.as_str()) {
            info!(
                instance_id = %inst.key(),
                bundle_id = %descriptor.bundle_id,
                "already running the latest bundle"
            );
            return Ok(CheckOutcome::NoUpdate);
        }

        // A payload from an earlier install (or an interrupted check) may
        // already be on disk; re-activating it skips the download.
        if let Some(record) = inst
            .installer()
            .reactivate(&permit, &descriptor, &channel_name)
            .await?
        {
            self.emitter.emit(inst.key(), ProgressPhase::Done, 0, 0);
            return Ok(CheckOutcome::Updated(record));
        }

        let task = match self
            .downloader
            .fetch_payload(&descriptor, inst.key(), &self.emitter, cancel)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                self.emitter.emit(inst.key(), ProgressPhase::Failed, 0, 0);
                return Err(e);
            }
        };

        let (received, total) = (task.bytes_received, task.bytes_total);
        match inst
            .installer()
            .install(&permit, task, &channel_name, &self.emitter)
            .await
        {
            Ok(record) => {
                self.emitter.emit(inst.key(), ProgressPhase::Done, received, total);
                Ok(CheckOutcome::Updated(record))
            }
            Err(e) => {
                self.emitter.emit(inst.key(), ProgressPhase::Failed, received, total);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use tempfile::TempDir;

    fn updater(dir: &TempDir) -> Updater {
        let fallback = dir.path().join("embedded.bundle");
        std::fs::write(&fallback, b"embedded").unwrap();
        let config = UpdateConfig::new(
            "https://updates.example.com",
            "1.0.0",
            fallback,
            dir.path().join("storage"),
        );
        Updater::new(config).unwrap()
    }

    #[test]
    fn fresh_updater_resolves_to_embedded() {
        let dir = TempDir::new().unwrap();
        let up = updater(&dir);
        let location = up.active_bundle(None);
        assert!(matches!(location, BundleLocation::Embedded(_)));
        assert_eq!(up.bundle_path(None), dir.path().join("embedded.bundle"));
    }

    #[test]
    fn progress_events_single_consumer() {
        let dir = TempDir::new().unwrap();
        let up = updater(&dir);
        assert!(up.progress_events().is_some());
        assert!(up.progress_events().is_none());
    }

    #[test]
    fn channel_override_persists_per_instance() {
        let dir = TempDir::new().unwrap();
        let up = updater(&dir);
        assert_eq!(up.channel(None), "production");
        up.set_channel(Some("payments"), "staging").unwrap();
        assert_eq!(up.channel(Some("payments")), "staging");
        assert_eq!(up.channel(None), "production");
    }
}
