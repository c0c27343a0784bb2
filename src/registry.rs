//! Instance registry.
//!
//! One process can host several isolated update domains ("instances"),
//! each with its own preferences, resolver, and installer. The registry
//! maps an opaque identifier to that triple, creating entries lazily and
//! keeping them for the process lifetime — instances are few and
//! long-lived, not a cache needing eviction. No lock is held across
//! instances beyond the map itself; install serialization is per
//! instance, inside the installer's gate.

use crate::install::BundleInstaller;
use crate::prefs::{PreferenceStore, PrefsView};
use crate::resolver::BundleResolver;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Identifier of the default, singleton instance.
pub const DEFAULT_INSTANCE: &str = "default";

/// Normalize a caller-supplied instance identifier. `None` and the empty
/// string both denote the default instance.
#[must_use]
pub fn instance_key(raw: Option<&str>) -> String {
    match raw {
        Some(id) if !id.trim().is_empty() => id.trim().to_owned(),
        _ => DEFAULT_INSTANCE.to_owned(),
    }
}

/// Preference keys owned by an instance.
pub(crate) const CHANNEL_KEY: &str = "channel";
pub(crate) const LAST_CHECK_KEY: &str = "last_check";

/// One instance's isolated component triple.
#[derive(Debug)]
pub struct UpdaterInstance {
    key: String,
    prefs: PrefsView,
    resolver: BundleResolver,
    installer: BundleInstaller,
    default_channel: String,
}

impl UpdaterInstance {
    /// Normalized instance key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// This instance's preference view.
    #[must_use]
    pub fn prefs(&self) -> &PrefsView {
        &self.prefs
    }

    /// This instance's resolver.
    #[must_use]
    pub fn resolver(&self) -> &BundleResolver {
        &self.resolver
    }

    /// This instance's installer.
    #[must_use]
    pub fn installer(&self) -> &BundleInstaller {
        &self.installer
    }

    /// The channel this instance subscribes to. Falls back to the
    /// configured default when nothing is persisted (or the store is
    /// unreadable — channel choice is not worth failing an update over).
    #[must_use]
    pub fn channel(&self) -> String {
        self.prefs
            .get(CHANNEL_KEY)
            .ok()
            .flatten()
            .unwrap_or_else(|| self.default_channel.clone())
    }

    /// Subscribe this instance to `channel`.
    ///
    /// # Errors
    ///
    /// [`crate::UpdateError::StoreUnavailable`] if the preference write
    /// fails.
    pub fn set_channel(&self, channel: &str) -> crate::error::Result<()> {
        self.prefs.set(CHANNEL_KEY, Some(channel))
    }

    /// Record that an update check ran now. Best-effort bookkeeping.
    pub fn mark_checked(&self) {
        let now = chrono::Utc::now().timestamp().to_string();
        let _ = self.prefs.set(LAST_CHECK_KEY, Some(&now));
    }
}

/// Process-wide map of instance id → isolated component triple.
pub struct InstanceRegistry {
    store: PreferenceStore,
    storage_root: PathBuf,
    fallback_bundle: PathBuf,
    default_channel: String,
    entries: Mutex<HashMap<String, Arc<UpdaterInstance>>>,
}

impl InstanceRegistry {
    /// Create an empty registry over one preference store and storage root.
    #[must_use]
    pub fn new(
        store: PreferenceStore,
        storage_root: PathBuf,
        fallback_bundle: PathBuf,
        default_channel: String,
    ) -> Self {
        Self {
            store,
            storage_root,
            fallback_bundle,
            default_channel,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get or lazily create the instance for `raw_id`. `None` or empty
    /// denotes the default instance. Entries are never evicted.
    pub fn get_or_create(&self, raw_id: Option<&str>) -> Arc<UpdaterInstance> {
        let key = instance_key(raw_id);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(entries.entry(key.clone()).or_insert_with(|| {
            debug!(instance_id = %key, "creating update instance");
            let prefs = self.store.scoped(&key);
            Arc::new(UpdaterInstance {
                resolver: BundleResolver::new(prefs.clone(), self.fallback_bundle.clone()),
                installer: BundleInstaller::new(&key, prefs.clone(), &self.storage_root),
                default_channel: self.default_channel.clone(),
                prefs,
                key,
            })
        }))
    }
}
