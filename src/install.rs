//! Transactional bundle installation.
//!
//! The correctness-critical path. An install takes a verified download,
//! moves it into versioned storage with an atomic same-parent rename,
//! then flips the instance's active record through the preference store's
//! all-or-nothing write. The preference write is the commit point: a
//! crash before it leaves the old bundle fully usable, a crash after it
//! leaves the new one. Old storage is deleted only after the commit, and
//! only best-effort.
//!
//! At most one install may be in flight per instance. Interleaving two
//! installs could race on the "which is newer" decision, so a concurrent
//! request is rejected, not queued.

use crate::channel::ChannelDescriptor;
use crate::download::DownloadTask;
use crate::error::{Result, UpdateError};
use crate::integrity::{self, IntegrityCheck};
use crate::prefs::{PrefsView, sanitize};
use crate::progress::{ProgressEmitter, ProgressPhase};
use crate::resolver::{ACTIVE_BUNDLE_KEY, BundleRecord};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File name of the payload inside a versioned bundle directory.
const PAYLOAD_FILE: &str = "payload.bundle";

/// Per-instance install-in-flight flag.
///
/// Holding an [`InstallPermit`] is required to install; the permit is the
/// compile-time witness that the guard was acquired.
#[derive(Debug, Default)]
pub struct InstallGate {
    busy: AtomicBool,
}

impl InstallGate {
    /// Claim the gate.
    ///
    /// # Errors
    ///
    /// [`UpdateError::InstallInProgress`] if another install holds it.
    pub fn acquire(self: &Arc<Self>) -> Result<InstallPermit> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
        {
            Ok(InstallPermit {
                gate: Arc::clone(self),
            })
        } else {
            Err(UpdateError::InstallInProgress)
        }
    }
}

/// Witness that the per-instance install gate is held. Released on drop.
#[derive(Debug)]
pub struct InstallPermit {
    gate: Arc<InstallGate>,
}

impl Drop for InstallPermit {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

/// Installs verified payloads for one instance.
#[derive(Debug, Clone)]
pub struct BundleInstaller {
    instance_id: String,
    prefs: PrefsView,
    store_dir: PathBuf,
    gate: Arc<InstallGate>,
}

impl BundleInstaller {
    /// Create an installer whose bundle store lives under `storage_root`,
    /// isolated per instance.
    #[must_use]
    pub fn new(instance_id: &str, prefs: PrefsView, storage_root: &Path) -> Self {
        Self {
            instance_id: instance_id.to_owned(),
            prefs,
            store_dir: storage_root.join("bundles").join(sanitize(instance_id)),
            gate: Arc::new(InstallGate::default()),
        }
    }

    /// Claim this instance's install gate.
    ///
    /// # Errors
    ///
    /// [`UpdateError::InstallInProgress`] if an install is already in
    /// flight for the instance.
    pub fn try_begin(&self) -> Result<InstallPermit> {
        self.gate.acquire()
    }

    /// Install a downloaded candidate and make it the active bundle.
    ///
    /// Cancellation is not consulted here: once placement begins the
    /// install runs to completion or failure. An abort half-way cannot
    /// be made safe.
    ///
    /// # Errors
    ///
    /// [`UpdateError::IntegrityFailure`] if the payload no longer matches
    /// its checksum, [`UpdateError::InstallFailed`] for any placement
    /// failure before the commit point (instance state untouched),
    /// [`UpdateError::StoreUnavailable`] if the commit write fails.
    pub async fn install(
        &self,
        _permit: &InstallPermit,
        task: DownloadTask,
        channel: &str,
        emitter: &ProgressEmitter,
    ) -> Result<BundleRecord> {
        emitter.emit(
            &self.instance_id,
            ProgressPhase::Installing,
            task.bytes_received,
            task.bytes_total,
        );

        // Step 1: re-verify at install time. Defends against corruption or
        // tamper between download and install.
        let actual = hash_blocking(task.staged_path.clone()).await?;
        if !actual.eq_ignore_ascii_case(&task.expected_checksum) {
            let _ = std::fs::remove_file(&task.staged_path);
            return Err(UpdateError::IntegrityFailure {
                expected: task.expected_checksum,
                actual,
            });
        }

        // The record to garbage-collect, read before the flip.
        let previous = BundleRecord::load(&self.prefs);

        // Step 2: atomic placement into versioned storage.
        let store_dir = self.store_dir.clone();
        let bundle_id = task.bundle_id.clone();
        let staged = task.staged_path.clone();
        let payload_path = tokio::task::spawn_blocking(move || place_payload(&store_dir, &bundle_id, &staged))
            .await
            .map_err(|e| UpdateError::InstallFailed(format!("placement task failed: {e}")))?
            .map_err(|e| UpdateError::InstallFailed(e.to_string()))?;

        // Step 3: commit. The preference write is all-or-nothing; after it
        // returns, resolution sees the new bundle.
        let record = BundleRecord {
            bundle_id: task.bundle_id,
            channel: channel.to_owned(),
            storage_path: payload_path.clone(),
            installed_at: Utc::now(),
            checksum: task.expected_checksum,
        };
        if let Err(e) = record.store(&self.prefs) {
            // Pre-commit failure: the old record still rules. The freshly
            // placed directory is an orphan; remove it best-effort.
            if let Some(dir) = payload_path.parent() {
                let _ = std::fs::remove_dir_all(dir);
            }
            return Err(e);
        }

        info!(
            instance_id = %self.instance_id,
            bundle_id = %record.bundle_id,
            path = %record.storage_path.display(),
            "bundle install committed"
        );

        // Step 4: only after the commit, retire the superseded storage.
        if let Some(prev) = previous
            && prev.bundle_id != record.bundle_id
        {
            self.retire(prev.storage_path);
        }

        Ok(record)
    }

    /// Re-activate an already-installed payload matching `descriptor`,
    /// skipping the download entirely.
    ///
    /// Returns `Ok(None)` when no verified payload for that bundle id is
    /// present, in which case the caller proceeds to download.
    ///
    /// # Errors
    ///
    /// [`UpdateError::StoreUnavailable`] if the commit write fails.
    pub async fn reactivate(
        &self,
        _permit: &InstallPermit,
        descriptor: &ChannelDescriptor,
        channel: &str,
    ) -> Result<Option<BundleRecord>> {
        let payload_path = self
            .store_dir
            .join(sanitize(&descriptor.bundle_id))
            .join(PAYLOAD_FILE);

        let expected = descriptor.checksum.clone();
        let check_path = payload_path.clone();
        let check = tokio::task::spawn_blocking(move || integrity::verify(&check_path, &expected))
            .await
            .map_err(|e| UpdateError::InstallFailed(format!("verify task failed: {e}")))?;
        if check != IntegrityCheck::Valid {
            return Ok(None);
        }

        let previous = BundleRecord::load(&self.prefs);
        let record = BundleRecord {
            bundle_id: descriptor.bundle_id.clone(),
            channel: channel.to_owned(),
            storage_path: payload_path,
            installed_at: Utc::now(),
            checksum: descriptor.checksum.clone(),
        };
        record.store(&self.prefs)?;
        debug!(bundle_id = %record.bundle_id, "re-activated cached bundle");

        if let Some(prev) = previous
            && prev.bundle_id != record.bundle_id
        {
            self.retire(prev.storage_path);
        }

        Ok(Some(record))
    }

    /// Roll the instance back to the embedded fallback: clear the active
    /// record, then drop installed payloads.
    ///
    /// # Errors
    ///
    /// [`UpdateError::InstallInProgress`] if an install is in flight,
    /// [`UpdateError::StoreUnavailable`] if the record cannot be cleared.
    pub async fn reset(&self) -> Result<()> {
        let _permit = self.gate.acquire()?;

        // Clear first, delete after: the delete-before-commit order could
        // strand a record pointing at nothing.
        self.prefs.set(ACTIVE_BUNDLE_KEY, None)?;

        let dir = self.store_dir.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = std::fs::remove_dir_all(&dir)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(dir = %dir.display(), error = %e, "could not remove bundle store");
            }
        })
        .await
        .map_err(|e| UpdateError::InstallFailed(format!("cleanup task failed: {e}")))?;

        info!(instance_id = %self.instance_id, "instance reset to embedded bundle");
        Ok(())
    }

    /// Best-effort, non-blocking removal of a superseded bundle directory.
    fn retire(&self, payload_path: PathBuf) {
        let Some(dir) = payload_path.parent().map(Path::to_path_buf) else {
            return;
        };
        // Refuse anything that is not a versioned directory of our store.
        if !dir.starts_with(&self.store_dir) || dir == self.store_dir {
            return;
        }
        tokio::task::spawn_blocking(move || {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(dir = %dir.display(), "retired superseded bundle"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(dir = %dir.display(), error = %e, "could not retire bundle"),
            }
        });
    }
}

/// Move a verified temp payload into `store_dir/<bundle_id>/payload.bundle`.
///
/// The payload lands in a staging directory first; the staging directory
/// is renamed to its final name last, so the final path only ever exists
/// fully written. Rename falls back to copy for storage roots that span
/// file systems.
fn place_payload(store_dir: &Path, bundle_id: &str, staged: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(store_dir)?;

    let staging_dir = store_dir.join(format!(".staging-{}", Uuid::new_v4()));
    let result = (|| {
        std::fs::create_dir_all(&staging_dir)?;
        let staged_payload = staging_dir.join(PAYLOAD_FILE);
        if std::fs::rename(staged, &staged_payload).is_err() {
            std::fs::copy(staged, &staged_payload)?;
            let _ = std::fs::remove_file(staged);
        }

        let final_dir = store_dir.join(sanitize(bundle_id));
        if final_dir.exists() {
            // Leftover from an interrupted earlier install of the same id.
            std::fs::remove_dir_all(&final_dir)?;
        }
        std::fs::rename(&staging_dir, &final_dir)?;
        Ok(final_dir.join(PAYLOAD_FILE))
    })();

    if result.is_err() {
        let _ = std::fs::remove_dir_all(&staging_dir);
    }
    result
}

async fn hash_blocking(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || integrity::sha256_hex(&path))
        .await
        .map_err(|e| UpdateError::InstallFailed(format!("hash task failed: {e}")))?
        .map_err(|e| UpdateError::InstallFailed(format!("cannot hash staged payload: {e}")))
}
