//! Local persistence for the local-only deployment variant.
//!
//! Everything is stored as UTF-8 JSON in a key/value store namespaced by
//! record kind and user identity. Missing or corrupt data yields an empty
//! state rather than failing login; write failures (quota) surface as
//! [`StorageError`] so shells can show them instead of crashing.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::{Image, Project, User};
use crate::{AppError, ErrorKind, MIGRATED_PROJECT_NAME};

pub const CURRENT_USER_KEY: &str = "studio-current-user";
pub const USERS_KEY: &str = "studio-users";

/// Per-user project graph, current format.
#[must_use]
pub fn projects_key(user: &User) -> String {
    format!("projects-for-user-{}", user.id)
}

/// Pre-project flat image list, migrated and deleted on first load.
#[must_use]
pub fn legacy_images_key(user: &User) -> String {
    format!("images-for-user-{}", user.email)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage quota exceeded writing '{key}' ({size} bytes)")]
    QuotaExceeded { key: String, size: usize },

    #[error("storage I/O failure: {0}")]
    Io(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        let kind = match &e {
            StorageError::Serialization(_) => ErrorKind::Serialization,
            _ => ErrorKind::Storage,
        };
        AppError::new(kind, e.to_string())
    }
}

/// The on-device byte store contract. Implemented over browser local
/// storage, an app-data directory, or memory depending on the shell.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory store with an optional byte quota. The quota exists so tests
/// and constrained shells exercise the degraded write path.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    quota_bytes: Option<usize>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn used_bytes(entries: &HashMap<String, Vec<u8>>) -> usize {
        entries.values().map(Vec::len).sum()
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Io("lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut entries =
            self.entries.lock().map_err(|_| StorageError::Io("lock poisoned".into()))?;
        if let Some(quota) = self.quota_bytes {
            let existing = entries.get(key).map_or(0, Vec::len);
            let projected = Self::used_bytes(&entries) - existing + value.len();
            if projected > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    size: value.len(),
                });
            }
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries =
            self.entries.lock().map_err(|_| StorageError::Io("lock poisoned".into()))?;
        entries.remove(key);
        Ok(())
    }
}

/// One file per key under a root directory. Writes go through a temp file
/// and an atomic rename so a crash never leaves a half-written record.
pub struct DirKv {
    root: PathBuf,
}

const TMP_SUFFIX: &str = ".__tmp";

impl DirKv {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.len() > 255 {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        // Keys embed emails and ids; map anything outside a safe set.
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        // The temp-file suffix is reserved; a key carrying it could be
        // clobbered by another key's in-flight write.
        if safe.starts_with('.') || safe.ends_with(TMP_SUFFIX) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(safe))
    }

    fn write_atomic(path: &Path, value: &[u8]) -> std::io::Result<()> {
        // Appended, not swapped in as an extension: keys embed dots (emails),
        // so `with_extension` would collide keys sharing a stem.
        let tmp_path = match path.file_name() {
            Some(name) => {
                let mut tmp = name.to_os_string();
                tmp.push(TMP_SUFFIX);
                path.with_file_name(tmp)
            }
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "empty file name",
                ))
            }
        };
        let mut file = File::create(&tmp_path)?;
        file.write_all(value)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

impl KeyValueStore for DirKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        Self::write_atomic(&path, value).map_err(|e| match e.kind() {
            std::io::ErrorKind::StorageFull => StorageError::QuotaExceeded {
                key: key.to_string(),
                size: value.len(),
            },
            _ => StorageError::Io(e.to_string()),
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }
}

/// Typed access to the session records kept on-device: the current user and
/// the per-user project graph, plus the legacy flat-list migration.
#[derive(Clone)]
pub struct SessionCache {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionCache {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.kv.get(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "local read failed; treating as empty");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                // Corrupt data never fails login; drop it and start clean.
                warn!(key, error = %e, "corrupt local record; discarding");
                let _ = self.kv.remove(key);
                None
            }
        }
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.kv.set(key, &bytes)
    }

    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.read_json(CURRENT_USER_KEY)
    }

    pub fn set_current_user(&self, user: &User) -> Result<(), StorageError> {
        self.write_json(CURRENT_USER_KEY, user)
    }

    pub fn clear_current_user(&self) -> Result<(), StorageError> {
        self.kv.remove(CURRENT_USER_KEY)
    }

    pub fn save_raw(&self, key: &str, value: &impl Serialize) -> Result<(), StorageError> {
        self.write_json(key, value)
    }

    #[must_use]
    pub fn load_raw<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.read_json(key)
    }

    /// Loads the user's project graph. A legacy flat image list is migrated
    /// into a single synthesized project and the legacy key is deleted.
    #[must_use]
    pub fn load_projects(&self, user: &User) -> Vec<Project> {
        if let Some(projects) = self.read_json::<Vec<Project>>(&projects_key(user)) {
            return projects;
        }

        let legacy_key = legacy_images_key(user);
        let Some(images) = self.read_json::<Vec<Image>>(&legacy_key) else {
            return Vec::new();
        };

        if images.is_empty() {
            let _ = self.kv.remove(&legacy_key);
            return Vec::new();
        }

        let mut project = Project::new(MIGRATED_PROJECT_NAME, crate::get_current_time_ms());
        project.images = images;
        let projects = vec![project];
        // The legacy record is deleted only once the new format is safely
        // on disk; a failed save keeps it so the next load retries.
        match self.save_projects(user, &projects) {
            Ok(()) => {
                let _ = self.kv.remove(&legacy_key);
            }
            Err(e) => {
                warn!(error = %e, "failed to persist migrated project graph; keeping legacy record");
            }
        }
        projects
    }

    pub fn save_projects(&self, user: &User, projects: &[Project]) -> Result<(), StorageError> {
        self.write_json(&projects_key(user), &projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AspectRatio, UserId};

    fn test_user() -> User {
        User {
            id: UserId::new("u-1"),
            username: "ada".into(),
            email: "ada@example.com".into(),
            photo_url: String::new(),
        }
    }

    fn cache() -> SessionCache {
        SessionCache::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn current_user_roundtrip() {
        let cache = cache();
        assert!(cache.current_user().is_none());

        let user = test_user();
        cache.set_current_user(&user).unwrap();
        assert_eq!(cache.current_user(), Some(user));

        cache.clear_current_user().unwrap();
        assert!(cache.current_user().is_none());
    }

    #[test]
    fn corrupt_current_user_yields_none_and_clears_key() {
        let kv = Arc::new(MemoryKv::new());
        kv.set(CURRENT_USER_KEY, b"{not json").unwrap();
        let cache = SessionCache::new(kv.clone());

        assert!(cache.current_user().is_none());
        assert_eq!(kv.get(CURRENT_USER_KEY).unwrap(), None);
    }

    #[test]
    fn missing_projects_load_empty() {
        assert!(cache().load_projects(&test_user()).is_empty());
    }

    #[test]
    fn corrupt_projects_load_empty() {
        let kv = Arc::new(MemoryKv::new());
        let user = test_user();
        kv.set(&projects_key(&user), b"\xff\xfe").unwrap();

        let cache = SessionCache::new(kv);
        assert!(cache.load_projects(&user).is_empty());
    }

    #[test]
    fn legacy_flat_list_migrates_into_one_project() {
        let kv = Arc::new(MemoryKv::new());
        let user = test_user();

        let images = vec![
            Image::new("data:a".into(), "first".into(), AspectRatio::Square, 1),
            Image::new("data:b".into(), "second".into(), AspectRatio::Landscape, 2),
        ];
        kv.set(
            &legacy_images_key(&user),
            &serde_json::to_vec(&images).unwrap(),
        )
        .unwrap();

        let cache = SessionCache::new(kv.clone());
        let projects = cache.load_projects(&user);

        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, MIGRATED_PROJECT_NAME);
        assert_eq!(projects[0].images.len(), 2);
        // Legacy key is gone; the new format is persisted.
        assert_eq!(kv.get(&legacy_images_key(&user)).unwrap(), None);
        assert!(kv.get(&projects_key(&user)).unwrap().is_some());

        // Second load comes from the new format.
        let again = cache.load_projects(&user);
        assert_eq!(again, projects);
    }

    #[test]
    fn failed_migration_save_keeps_the_legacy_record() {
        let user = test_user();
        let images = vec![Image::new(
            "data:a".into(),
            "first".into(),
            AspectRatio::Square,
            1,
        )];
        let legacy = serde_json::to_vec(&images).unwrap();

        // Room for the legacy record but not for the larger migrated graph.
        let kv = Arc::new(MemoryKv::with_quota(legacy.len() + 8));
        kv.set(&legacy_images_key(&user), &legacy).unwrap();

        let cache = SessionCache::new(kv.clone());
        let projects = cache.load_projects(&user);
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].images.len(), 1);

        // The library is still on disk under the legacy key, so the next
        // session retries the migration instead of starting empty.
        assert!(kv.get(&legacy_images_key(&user)).unwrap().is_some());
        assert!(kv.get(&projects_key(&user)).unwrap().is_none());

        let again = cache.load_projects(&user);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].images.len(), 1);
    }

    #[test]
    fn empty_legacy_list_migrates_to_nothing() {
        let kv = Arc::new(MemoryKv::new());
        let user = test_user();
        kv.set(&legacy_images_key(&user), b"[]").unwrap();

        let cache = SessionCache::new(kv.clone());
        assert!(cache.load_projects(&user).is_empty());
        assert_eq!(kv.get(&legacy_images_key(&user)).unwrap(), None);
    }

    #[test]
    fn quota_exceeded_surfaces_as_error() {
        let kv = Arc::new(MemoryKv::with_quota(16));
        let cache = SessionCache::new(kv);
        let user = test_user();

        let mut project = Project::new("My First Project", 1);
        project.images.push(Image::new(
            "data:image/png;base64,AAAA".into(),
            "a very long prompt".into(),
            AspectRatio::Square,
            2,
        ));

        let err = cache.save_projects(&user, &[project]).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        let app: AppError = err.into();
        assert_eq!(app.kind, ErrorKind::Storage);
    }

    #[test]
    fn dir_kv_roundtrip_and_atomicity() {
        let dir = tempfile::tempdir().unwrap();
        let kv = DirKv::new(dir.path()).unwrap();

        kv.set("projects-for-user-u1", b"[1,2,3]").unwrap();
        assert_eq!(kv.get("projects-for-user-u1").unwrap().unwrap(), b"[1,2,3]");

        // No temp file is left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(TMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());

        kv.remove("projects-for-user-u1").unwrap();
        assert_eq!(kv.get("projects-for-user-u1").unwrap(), None);
        // Removing twice is fine.
        kv.remove("projects-for-user-u1").unwrap();
    }

    #[test]
    fn dir_kv_dotted_keys_do_not_share_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let kv = DirKv::new(dir.path()).unwrap();

        // Keys differing only after their last dot must stay independent,
        // including a key that looks like another key's old temp name.
        kv.set("images-for-user-a@b.com", b"com").unwrap();
        kv.set("images-for-user-a@b.org", b"org").unwrap();
        kv.set("projects.tmp", b"keep").unwrap();
        kv.set("projects", b"other").unwrap();

        assert_eq!(kv.get("images-for-user-a@b.com").unwrap().unwrap(), b"com");
        assert_eq!(kv.get("images-for-user-a@b.org").unwrap().unwrap(), b"org");
        assert_eq!(kv.get("projects.tmp").unwrap().unwrap(), b"keep");
        assert_eq!(kv.get("projects").unwrap().unwrap(), b"other");

        // The in-flight suffix itself is reserved.
        assert!(matches!(
            kv.set("projects.__tmp", b"x"),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn dir_kv_sanitizes_hostile_keys() {
        let dir = tempfile::tempdir().unwrap();
        let kv = DirKv::new(dir.path()).unwrap();

        kv.set("images-for-user-a/b@example.com", b"x").unwrap();
        assert_eq!(
            kv.get("images-for-user-a/b@example.com").unwrap().unwrap(),
            b"x"
        );
        assert!(kv.set("", b"x").is_err());
        assert!(matches!(
            kv.get("../../etc/passwd"),
            Err(StorageError::InvalidKey(_)) | Ok(None)
        ));
    }
}
