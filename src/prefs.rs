//! Durable per-instance preference storage.
//!
//! Each instance owns one small JSON document of string keys (channel,
//! active-bundle record, last-check timestamp). Documents are namespaced
//! by the host application version so preferences written by an
//! incompatible build are never reused, and by instance so identical keys
//! under different instances cannot collide.
//!
//! Writes are crash-consistent: the whole document is rewritten to a temp
//! file and renamed over the old one, so a reader sees either the prior
//! document or the new one, never a torn write.

use crate::error::{Result, UpdateError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Store root for all instances of one app build.
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    dir: PathBuf,
}

impl PreferenceStore {
    /// Open (creating if necessary) the store under `storage_root`,
    /// namespaced by the host application version.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StoreUnavailable`] if the directory cannot be
    /// created; callers should fall back to the embedded bundle.
    pub fn open(storage_root: &Path, app_version: &str) -> Result<Self> {
        let dir = storage_root
            .join("prefs")
            .join(sanitize(&format!("v{app_version}")));
        std::fs::create_dir_all(&dir)
            .map_err(|e| UpdateError::StoreUnavailable(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// A view scoped to one instance's isolated key namespace.
    #[must_use]
    pub fn scoped(&self, instance_key: &str) -> PrefsView {
        PrefsView {
            doc_path: self.dir.join(format!("{}.json", sanitize(instance_key))),
        }
    }
}

/// Per-instance view over the store. Cheap to clone; no shared state
/// beyond the document file itself.
#[derive(Debug, Clone)]
pub struct PrefsView {
    doc_path: PathBuf,
}

impl PrefsView {
    /// Read one key. A missing document or missing key is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StoreUnavailable`] if the document exists but
    /// cannot be read.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    /// Write one key, or remove it when `value` is `None`.
    ///
    /// The set either fully lands or leaves the prior document intact.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::StoreUnavailable`] if the document cannot be
    /// rewritten.
    pub fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut doc = self.load()?;
        match value {
            Some(v) => {
                doc.insert(key.to_owned(), v.to_owned());
            }
            None => {
                doc.remove(key);
            }
        }
        self.commit(&doc)?;
        debug!(doc = %self.doc_path.display(), key, set = value.is_some(), "preference updated");
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        let bytes = match std::fs::read(&self.doc_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(UpdateError::StoreUnavailable(format!(
                    "cannot read {}: {e}",
                    self.doc_path.display()
                )));
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                // A corrupt document is healed by treating it as empty; the
                // resolver re-validates anything read out of it anyway.
                warn!(doc = %self.doc_path.display(), error = %e, "corrupt preference document, starting fresh");
                Ok(BTreeMap::new())
            }
        }
    }

    fn commit(&self, doc: &BTreeMap<String, String>) -> Result<()> {
        let parent = self.doc_path.parent().ok_or_else(|| {
            UpdateError::StoreUnavailable(format!("no parent for {}", self.doc_path.display()))
        })?;
        std::fs::create_dir_all(parent).map_err(|e| {
            UpdateError::StoreUnavailable(format!("cannot create {}: {e}", parent.display()))
        })?;

        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| UpdateError::StoreUnavailable(format!("cannot serialize preferences: {e}")))?;

        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        std::fs::write(&tmp, json).map_err(|e| {
            UpdateError::StoreUnavailable(format!("cannot write {}: {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.doc_path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            UpdateError::StoreUnavailable(format!("cannot commit {}: {e}", self.doc_path.display()))
        })
    }
}

/// Make an identifier safe to use as a file name component.
pub(crate) fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
