use crate::store::{expiry_after, CacheEntry, CacheStore};
use chrono::{DateTime, Utc};
use report_cache_controller_core::{CacheKey, CacheValue};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::Path,
    sync::Arc,
};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("no cache file configured")]
    NoPath,

    #[error("failed to encode cache snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write cache snapshot: {0}")]
    Io(#[from] io::Error),

    #[error("failed to replace cache snapshot: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Describes the outcome of loading a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub reports: usize,
    pub expired: usize,
    pub invalid: usize,
    /// Set when the file could not be parsed at all and the store started
    /// empty.
    pub corrupt: bool,
}

/// Describes the outcome of writing a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub saved: usize,
    pub expired: usize,
}

/// The on-disk form of a single entry.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedEntry<V> {
    value: V,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

// === impl CacheStore ===

impl CacheStore {
    /// Writes a snapshot of the authoritative map to the configured path.
    ///
    /// Expired cluster and namespace entries are omitted. The snapshot is
    /// written to a temporary file in the target directory, synced, and then
    /// renamed over the previous snapshot so that a crash never leaves a
    /// partially written file in place.
    pub fn save_to_file(&self) -> Result<SaveSummary, PersistError> {
        let path = self.config().path.clone().ok_or(PersistError::NoPath)?;
        let res = self.save_to(&path);
        self.metrics().saved(res.is_ok());
        if res.is_ok() {
            self.inner().write().last_saved = Some(Utc::now());
        }
        res
    }

    fn save_to(&self, path: &Path) -> Result<SaveSummary, PersistError> {
        let now = Utc::now();
        let entries = self
            .inner()
            .read()
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect::<Vec<_>>();

        let mut summary = SaveSummary::default();
        let mut snapshot = BTreeMap::new();
        for (key, entry) in entries.iter() {
            if entry.is_expired(now) {
                summary.expired += 1;
                continue;
            }
            snapshot.insert(
                key.as_str(),
                PersistedEntry {
                    value: &entry.value,
                    expiration: entry.expires_at,
                    updated_at: Some(entry.updated_at),
                },
            );
        }
        summary.saved = snapshot.len();

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".cache-snapshot")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        {
            let mut writer = io::BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &snapshot)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;

        // Sync the directory so the rename itself is durable. Not every
        // platform supports opening directories, so failures are ignored.
        if let Ok(dir) = std::fs::File::open(dir) {
            let _ = dir.sync_all();
        }

        debug!(path = %path.display(), saved = summary.saved, "Saved cache snapshot");
        Ok(summary)
    }

    /// Replaces the store's contents with the snapshot at the configured
    /// path.
    ///
    /// A missing file leaves the store empty. A file that cannot be parsed is
    /// logged and the store starts empty. Expired cluster and namespace
    /// entries are dropped; report entries are kept with a renewed expiry and
    /// detail entries keep their recorded expiry so that stale details are
    /// refreshed on their next read.
    pub fn load_from_file(&self) -> Result<LoadSummary, PersistError> {
        let path = self.config().path.clone().ok_or(PersistError::NoPath)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot found");
                return Ok(LoadSummary::default());
            }
            Err(error) => return Err(error.into()),
        };

        let raw = match serde_json::from_slice::<BTreeMap<String, serde_json::Value>>(&bytes) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(path = %path.display(), %error, "Ignoring corrupt cache snapshot");
                self.inner().write().replace(std::iter::empty());
                self.clear_hot();
                return Ok(LoadSummary {
                    corrupt: true,
                    ..Default::default()
                });
            }
        };

        let now = Utc::now();
        let report_expiry = expiry_after(now, self.config().report_ttl);
        let mut summary = LoadSummary::default();
        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let Some(persisted) = decode_entry(&key, value) else {
                summary.invalid += 1;
                continue;
            };
            let parsed = CacheKey::parse(&key);
            let updated_at = persisted.updated_at.unwrap_or(now);
            let expires_at = match &parsed {
                CacheKey::Report(_) => report_expiry,
                CacheKey::Detail(_) => persisted.expiration,
                _ => match persisted.expiration {
                    Some(at) if at <= now => {
                        summary.expired += 1;
                        continue;
                    }
                    expiration => expiration,
                },
            };
            if matches!(parsed, CacheKey::Report(_)) {
                summary.reports += 1;
            }
            let entry = CacheEntry::new(parsed, persisted.value, expires_at, updated_at);
            entries.push((key, Arc::new(entry)));
        }
        summary.loaded = entries.len();

        self.inner().write().replace(entries);
        self.clear_hot();

        info!(
            path = %path.display(),
            loaded = summary.loaded,
            reports = summary.reports,
            expired = summary.expired,
            invalid = summary.invalid,
            "Loaded cache snapshot"
        );
        Ok(summary)
    }
}

/// Decodes a persisted entry, accepting values that do not match the typed
/// representation as opaque JSON.
fn decode_entry(key: &str, raw: serde_json::Value) -> Option<PersistedEntry<CacheValue>> {
    let entry = match serde_json::from_value::<PersistedEntry<serde_json::Value>>(raw) {
        Ok(entry) => entry,
        Err(error) => {
            warn!(%key, %error, "Skipping malformed cache entry");
            return None;
        }
    };
    let value = serde_json::from_value::<CacheValue>(entry.value.clone())
        .unwrap_or(CacheValue::Json(entry.value));
    Some(PersistedEntry {
        value,
        expiration: entry.expiration,
        updated_at: entry.updated_at,
    })
}
