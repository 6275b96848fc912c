use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::types::ReplicantIdentity;
use crate::ReplicantError;

/// On-disk form: one JSON blob per persistent `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedBlob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    pub revision: u64,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PersistEntry {
    interval: Duration,
    last_write: Option<Instant>,
    dirty: Option<PersistedBlob>,
}

/// Per-key debounced writer over the store directory. Within one
/// `persistence_interval` window the latest blob wins; writes go through a
/// sibling temp file and an atomic rename so a crash never leaves a
/// truncated blob readable.
#[derive(Debug)]
pub(crate) struct PersistenceManager {
    root: PathBuf,
    entries: HashMap<ReplicantIdentity, PersistEntry>,
}

impl PersistenceManager {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            entries: HashMap::new(),
        }
    }

    pub fn load(
        &self,
        identity: &ReplicantIdentity,
    ) -> Result<Option<PersistedBlob>, ReplicantError> {
        let path = self.blob_path(identity);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ReplicantError::persistence(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        let blob = serde_json::from_str(&raw).map_err(|err| {
            ReplicantError::persistence(format!(
                "persisted blob at {} is not valid JSON: {err}",
                path.display()
            ))
        })?;
        Ok(Some(blob))
    }

    pub fn mark_dirty(
        &mut self,
        identity: &ReplicantIdentity,
        blob: PersistedBlob,
        interval: Duration,
    ) {
        let entry = self
            .entries
            .entry(identity.clone())
            .or_insert_with(|| PersistEntry {
                interval,
                last_write: None,
                dirty: None,
            });
        entry.interval = interval;
        entry.dirty = Some(blob);
    }

    /// Writes every dirty entry whose debounce window has elapsed. Failed
    /// writes stay dirty and are retried on the next tick.
    pub fn tick(&mut self, now: Instant) {
        let root = self.root.clone();
        for (identity, entry) in &mut self.entries {
            if entry.dirty.is_none() {
                continue;
            }
            let due = match entry.last_write {
                None => true,
                Some(last) => now.saturating_duration_since(last) >= entry.interval,
            };
            if !due {
                continue;
            }
            write_entry(&root, identity, entry, Some(now));
        }
    }

    /// Force-writes everything dirty, ignoring debounce windows. Shutdown path.
    pub fn persist_all(&mut self) {
        let root = self.root.clone();
        for (identity, entry) in &mut self.entries {
            if entry.dirty.is_none() {
                continue;
            }
            write_entry(&root, identity, entry, None);
        }
    }

    pub fn blob_path(&self, identity: &ReplicantIdentity) -> PathBuf {
        self.root
            .join(encode_component(&identity.namespace))
            .join(format!("{}.json", encode_component(&identity.name)))
    }
}

fn write_entry(
    root: &Path,
    identity: &ReplicantIdentity,
    entry: &mut PersistEntry,
    now: Option<Instant>,
) {
    let Some(blob) = entry.dirty.as_ref() else {
        return;
    };
    let path = root
        .join(encode_component(&identity.namespace))
        .join(format!("{}.json", encode_component(&identity.name)));
    match write_blob(&path, blob) {
        Ok(()) => {
            entry.dirty = None;
            entry.last_write = now.or_else(|| Some(Instant::now()));
            tracing::debug!(replicant = %identity, path = %path.display(), "persisted");
        }
        Err(err) => {
            tracing::warn!(replicant = %identity, error = %err, "persistence write failed; will retry");
        }
    }
}

fn write_blob(path: &Path, blob: &PersistedBlob) -> Result<(), ReplicantError> {
    let parent = path.parent().ok_or_else(|| {
        ReplicantError::persistence(format!("blob path {} has no parent", path.display()))
    })?;
    std::fs::create_dir_all(parent).map_err(|err| {
        ReplicantError::persistence(format!("failed to create {}: {err}", parent.display()))
    })?;

    let serialized = serde_json::to_vec(blob)
        .map_err(|err| ReplicantError::persistence(format!("failed to serialize blob: {err}")))?;

    let tmp_path = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp_path).map_err(|err| {
        ReplicantError::persistence(format!("failed to create {}: {err}", tmp_path.display()))
    })?;
    file.write_all(&serialized).map_err(|err| {
        ReplicantError::persistence(format!("failed to write {}: {err}", tmp_path.display()))
    })?;
    file.sync_all().map_err(|err| {
        ReplicantError::persistence(format!("failed to sync {}: {err}", tmp_path.display()))
    })?;
    drop(file);

    std::fs::rename(&tmp_path, path).map_err(|err| {
        ReplicantError::persistence(format!(
            "failed to move {} into place: {err}",
            tmp_path.display()
        ))
    })
}

/// Percent-encodes anything outside `[A-Za-z0-9._-]` so namespaces and names
/// map to safe file names.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blob(revision: u64) -> PersistedBlob {
        PersistedBlob {
            value: Some(json!({"n": revision})),
            revision,
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn first_write_is_immediate_then_debounced() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PersistenceManager::new(dir.path().to_path_buf());
        let identity = ReplicantIdentity::new("bundle", "state");
        let interval = Duration::from_millis(100);

        let start = Instant::now();
        manager.mark_dirty(&identity, blob(1), interval);
        manager.tick(start);
        let loaded = manager.load(&identity).unwrap().unwrap();
        assert_eq!(loaded.revision, 1);

        // Within the window the write is deferred; after it, it lands.
        manager.mark_dirty(&identity, blob(2), interval);
        manager.tick(start + Duration::from_millis(10));
        assert_eq!(manager.load(&identity).unwrap().unwrap().revision, 1);
        manager.tick(start + interval);
        assert_eq!(manager.load(&identity).unwrap().unwrap().revision, 2);
    }

    #[test]
    fn latest_write_wins_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PersistenceManager::new(dir.path().to_path_buf());
        let identity = ReplicantIdentity::new("bundle", "state");
        let interval = Duration::from_millis(100);

        let start = Instant::now();
        manager.mark_dirty(&identity, blob(1), interval);
        manager.tick(start);
        manager.mark_dirty(&identity, blob(2), interval);
        manager.mark_dirty(&identity, blob(3), interval);
        manager.tick(start + interval);
        assert_eq!(manager.load(&identity).unwrap().unwrap().revision, 3);
    }

    #[test]
    fn persist_all_ignores_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PersistenceManager::new(dir.path().to_path_buf());
        let identity = ReplicantIdentity::new("bundle", "state");

        let start = Instant::now();
        manager.mark_dirty(&identity, blob(1), Duration::from_secs(3600));
        manager.tick(start);
        manager.mark_dirty(&identity, blob(2), Duration::from_secs(3600));
        manager.persist_all();
        assert_eq!(manager.load(&identity).unwrap().unwrap().revision, 2);
    }

    #[test]
    fn missing_blob_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path().to_path_buf());
        let identity = ReplicantIdentity::new("bundle", "absent");
        assert!(manager.load(&identity).unwrap().is_none());
    }

    #[test]
    fn component_encoding_keeps_names_path_safe() {
        assert_eq!(encode_component("sound-cues"), "sound-cues");
        assert_eq!(encode_component("a/b"), "a%2Fb");
        assert_eq!(encode_component("x y"), "x%20y");
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PersistenceManager::new(dir.path().to_path_buf());
        let identity = ReplicantIdentity::new("bundle", "state");
        manager.mark_dirty(&identity, blob(1), Duration::from_millis(1));
        manager.tick(Instant::now());

        let namespace_dir = dir.path().join("bundle");
        let leftovers: Vec<_> = std::fs::read_dir(&namespace_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
