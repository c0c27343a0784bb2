//! Active-bundle resolution.
//!
//! Answers "which bundle should the host load right now" from persisted
//! metadata alone; no network. Resolution never fails: missing state, a
//! payload deleted out from under us, or a checksum mismatch all heal back
//! to the embedded fallback, clearing the stale record so the next caller
//! does not trip over it again. The check runs on every call because
//! update storage can vanish between calls (OS cleanup, users clearing
//! app data).

use crate::error::Result;
use crate::integrity::{self, IntegrityCheck};
use crate::prefs::PrefsView;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Preference key holding the active [`BundleRecord`] as JSON.
pub(crate) const ACTIVE_BUNDLE_KEY: &str = "active_bundle";

/// A successfully installed bundle, as persisted through the preference
/// store. Records are superseded by the next install, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRecord {
    /// Opaque versioned identifier assigned by the channel.
    pub bundle_id: String,
    /// Channel the bundle was published to.
    pub channel: String,
    /// Path to the fully written, checksum-verified payload.
    pub storage_path: PathBuf,
    /// When the install committed.
    pub installed_at: DateTime<Utc>,
    /// SHA-256 hex digest of the payload.
    pub checksum: String,
}

impl BundleRecord {
    /// Load the active record from an instance's preferences. Unparseable
    /// records read as absent; the resolver heals them.
    pub(crate) fn load(prefs: &PrefsView) -> Option<Self> {
        let json = prefs.get(ACTIVE_BUNDLE_KEY).ok().flatten()?;
        match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "unparseable active-bundle record");
                None
            }
        }
    }

    /// Persist this record as the instance's active bundle. This is the
    /// install commit point; the preference write is all-or-nothing.
    pub(crate) fn store(&self, prefs: &PrefsView) -> Result<()> {
        let json = serde_json::to_string(self).map_err(|e| {
            crate::error::UpdateError::StoreUnavailable(format!("cannot serialize record: {e}"))
        })?;
        prefs.set(ACTIVE_BUNDLE_KEY, Some(&json))
    }
}

/// Where the host should load its bundle from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleLocation {
    /// The fallback bundle embedded in the app package.
    Embedded(PathBuf),
    /// An installed update.
    Installed {
        /// Identifier of the installed bundle.
        bundle_id: String,
        /// Path to its verified payload.
        path: PathBuf,
    },
}

impl BundleLocation {
    /// The filesystem path to load.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Embedded(p) => p,
            Self::Installed { path, .. } => path,
        }
    }

    /// Bundle id, if this is an installed update.
    #[must_use]
    pub fn bundle_id(&self) -> Option<&str> {
        match self {
            Self::Embedded(_) => None,
            Self::Installed { bundle_id, .. } => Some(bundle_id),
        }
    }
}

/// Resolves the active bundle for one instance.
#[derive(Debug, Clone)]
pub struct BundleResolver {
    prefs: PrefsView,
    fallback: PathBuf,
}

impl BundleResolver {
    /// Create a resolver over an instance's preferences and the embedded
    /// fallback location.
    #[must_use]
    pub fn new(prefs: PrefsView, fallback: PathBuf) -> Self {
        Self { prefs, fallback }
    }

    /// Resolve the currently active bundle. Infallible: any invalid state
    /// is cleared and the embedded fallback returned instead.
    pub fn resolve(&self) -> BundleLocation {
        let Some(record) = BundleRecord::load(&self.prefs) else {
            return BundleLocation::Embedded(self.fallback.clone());
        };

        match integrity::verify(&record.storage_path, &record.checksum) {
            IntegrityCheck::Valid => {
                debug!(bundle_id = %record.bundle_id, "resolved installed bundle");
                BundleLocation::Installed {
                    bundle_id: record.bundle_id,
                    path: record.storage_path,
                }
            }
            check => {
                warn!(
                    bundle_id = %record.bundle_id,
                    path = %record.storage_path.display(),
                    ?check,
                    "active bundle failed sanity check, healing to fallback"
                );
                self.clear_active();
                BundleLocation::Embedded(self.fallback.clone())
            }
        }
    }

    /// The bundle id the instance is currently running, if any. Shares the
    /// sanity check with [`resolve`](Self::resolve) so a dangling record is
    /// never reported as current.
    pub fn active_bundle_id(&self) -> Option<String> {
        match self.resolve() {
            BundleLocation::Installed { bundle_id, .. } => Some(bundle_id),
            BundleLocation::Embedded(_) => None,
        }
    }

    /// Best-effort removal of a stale active record. Failure to clear is
    /// tolerable; the record will fail the same check next time.
    fn clear_active(&self) {
        if let Err(e) = self.prefs.set(ACTIVE_BUNDLE_KEY, None) {
            warn!(error = %e, "could not clear stale bundle record");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::integrity::sha256_hex_bytes;
    use crate::prefs::PreferenceStore;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> (PrefsView, BundleResolver) {
        let prefs = PreferenceStore::open(dir.path(), "1.0.0")
            .unwrap()
            .scoped("default");
        let fallback = dir.path().join("embedded.bundle");
        std::fs::write(&fallback, b"embedded").unwrap();
        let resolver = BundleResolver::new(prefs.clone(), fallback);
        (prefs, resolver)
    }

    fn install_payload(dir: &TempDir, prefs: &PrefsView, bundle_id: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(format!("{bundle_id}.payload"));
        std::fs::write(&path, content).unwrap();
        let record = BundleRecord {
            bundle_id: bundle_id.to_owned(),
            channel: "production".to_owned(),
            storage_path: path.clone(),
            installed_at: Utc::now(),
            checksum: sha256_hex_bytes(content),
        };
        record.store(prefs).unwrap();
        path
    }

    #[test]
    fn no_record_resolves_to_embedded() {
        let dir = TempDir::new().unwrap();
        let (_, resolver) = fixture(&dir);
        let location = resolver.resolve();
        assert!(matches!(location, BundleLocation::Embedded(_)));
        assert!(location.bundle_id().is_none());
    }

    #[test]
    fn valid_record_resolves_to_installed() {
        let dir = TempDir::new().unwrap();
        let (prefs, resolver) = fixture(&dir);
        let path = install_payload(&dir, &prefs, "b1", b"payload one");
        assert_eq!(
            resolver.resolve(),
            BundleLocation::Installed {
                bundle_id: "b1".to_owned(),
                path,
            }
        );
    }

    #[test]
    fn deleted_payload_heals_to_embedded_and_clears_record() {
        let dir = TempDir::new().unwrap();
        let (prefs, resolver) = fixture(&dir);
        let path = install_payload(&dir, &prefs, "b1", b"payload one");
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(resolver.resolve(), BundleLocation::Embedded(_)));
        // Self-healed: the stale record is gone.
        assert!(prefs.get(ACTIVE_BUNDLE_KEY).unwrap().is_none());
    }

    #[test]
    fn corrupted_payload_heals_to_embedded() {
        let dir = TempDir::new().unwrap();
        let (prefs, resolver) = fixture(&dir);
        let path = install_payload(&dir, &prefs, "b1", b"payload one");
        std::fs::write(&path, b"tampered").unwrap();

        assert!(matches!(resolver.resolve(), BundleLocation::Embedded(_)));
        assert!(prefs.get(ACTIVE_BUNDLE_KEY).unwrap().is_none());
    }

    #[test]
    fn unparseable_record_resolves_to_embedded() {
        let dir = TempDir::new().unwrap();
        let (prefs, resolver) = fixture(&dir);
        prefs.set(ACTIVE_BUNDLE_KEY, Some("not json")).unwrap();
        assert!(matches!(resolver.resolve(), BundleLocation::Embedded(_)));
    }

    #[test]
    fn heal_is_rechecked_every_resolution() {
        let dir = TempDir::new().unwrap();
        let (prefs, resolver) = fixture(&dir);

        // First install is fine.
        install_payload(&dir, &prefs, "b1", b"payload one");
        assert!(matches!(resolver.resolve(), BundleLocation::Installed { .. }));

        // Storage vanishes between calls; the next resolution notices.
        let path = install_payload(&dir, &prefs, "b2", b"payload two");
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(resolver.resolve(), BundleLocation::Embedded(_)));
    }

    #[test]
    fn active_bundle_id_matches_resolution() {
        let dir = TempDir::new().unwrap();
        let (prefs, resolver) = fixture(&dir);
        assert!(resolver.active_bundle_id().is_none());
        install_payload(&dir, &prefs, "b7", b"payload seven");
        assert_eq!(resolver.active_bundle_id().as_deref(), Some("b7"));
    }

    #[test]
    fn record_round_trips_through_prefs() {
        let dir = TempDir::new().unwrap();
        let (prefs, _) = fixture(&dir);
        let record = BundleRecord {
            bundle_id: "b9".to_owned(),
            channel: "staging".to_owned(),
            storage_path: PathBuf::from("/data/bundles/b9/payload.bundle"),
            installed_at: Utc::now(),
            checksum: "ab".repeat(32),
        };
        record.store(&prefs).unwrap();
        let loaded = BundleRecord::load(&prefs).unwrap();
        assert_eq!(loaded, record);
    }
}
