//! Best-effort local snapshot store: one JSON file per `(service, kind)`,
//! written atomically via temp + rename, loaded at startup as a cold-start
//! fallback only.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mesh_registry_core::{DataKind, RegistryError, Result, ReturnCode, ServiceKey};

use crate::snapshot::SnapshotPayload;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
    namespace: String,
    name: String,
    revision: String,
    payload: SnapshotPayload,
}

/// Directory-backed snapshot store.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| io_error(&dir, err))?;
        Ok(Self { dir })
    }

    fn file_path(&self, key: &ServiceKey, kind: DataKind) -> PathBuf {
        self.dir
            .join(format!("{}#{}#{}", key.namespace, key.name, kind.tag()))
    }

    /// Atomic write: serialize into a temp file in the same directory, then
    /// rename over the target.
    pub fn save(
        &self,
        key: &ServiceKey,
        kind: DataKind,
        revision: &str,
        payload: &SnapshotPayload,
    ) -> Result<()> {
        let file = SnapshotFile {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            revision: revision.to_string(),
            payload: payload.clone(),
        };
        let body = serde_json::to_vec_pretty(&file)
            .map_err(|err| RegistryError::with_detail(ReturnCode::UnknownError, err.to_string()))?;
        let mut temp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|err| io_error(&self.dir, err))?;
        temp.write_all(&body)
            .map_err(|err| io_error(temp.path(), err))?;
        let target = self.file_path(key, kind);
        temp.persist(&target)
            .map_err(|err| io_error(&target, err.error))?;
        Ok(())
    }

    pub fn remove(&self, key: &ServiceKey, kind: DataKind) {
        let target = self.file_path(key, kind);
        if let Err(err) = fs::remove_file(&target) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %target.display(), error = %err, "failed to remove snapshot");
            }
        }
    }

    /// Loads every parseable snapshot in the directory. Unreadable files are
    /// skipped with a warning; a corrupt cache must not block startup.
    pub fn load_all(&self) -> Vec<(ServiceKey, DataKind, String, SnapshotPayload)> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), error = %err, "cannot read snapshot dir");
                return out;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match Self::load_file(&path) {
                Ok(Some(loaded)) => out.push(loaded),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping bad snapshot");
                }
            }
        }
        out
    }

    fn load_file(path: &Path) -> Result<Option<(ServiceKey, DataKind, String, SnapshotPayload)>> {
        let body = fs::read(path).map_err(|err| io_error(path, err))?;
        let file: SnapshotFile = serde_json::from_slice(&body)
            .map_err(|err| RegistryError::with_detail(ReturnCode::UnknownError, err.to_string()))?;
        let key = ServiceKey::new(file.namespace, file.name);
        if key.validate().is_err() {
            return Ok(None);
        }
        let kind = file.payload.kind();
        Ok(Some((key, kind, file.revision, file.payload)))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> RegistryError {
    RegistryError::with_detail(
        ReturnCode::UnknownError,
        format!("{}: {err}", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::InstanceRecord;

    fn sample_payload() -> SnapshotPayload {
        SnapshotPayload::Instances {
            metadata: Default::default(),
            instances: vec![InstanceRecord::new("a", "10.1.0.1", 8001)],
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let key = ServiceKey::new("Test", "echo");
        store
            .save(&key, DataKind::Instances, "rev-7", &sample_payload())
            .unwrap();

        let loaded = store.load_all();
        assert_eq!(loaded.len(), 1);
        let (loaded_key, kind, revision, payload) = &loaded[0];
        assert_eq!(loaded_key, &key);
        assert_eq!(*kind, DataKind::Instances);
        assert_eq!(revision, "rev-7");
        match payload {
            SnapshotPayload::Instances { instances, .. } => assert_eq!(instances.len(), 1),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn file_name_uses_key_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let key = ServiceKey::new("Test", "echo");
        store
            .save(&key, DataKind::RouteRule, "r1", &sample_payload())
            .unwrap();
        // Payload kind wins over the requested kind on reload; the file
        // name is only a directory-listing convenience.
        assert!(dir.path().join("Test#echo#routing").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let key = ServiceKey::new("Test", "echo");
        store.remove(&key, DataKind::Instances);
        store
            .save(&key, DataKind::Instances, "r", &sample_payload())
            .unwrap();
        store.remove(&key, DataKind::Instances);
        assert!(store.load_all().is_empty());
    }

    #[test]
    fn corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("Test#bad#instances"), b"{not json").unwrap();
        let key = ServiceKey::new("Test", "good");
        store
            .save(&key, DataKind::Instances, "r", &sample_payload())
            .unwrap();
        assert_eq!(store.load_all().len(), 1);
    }
}
