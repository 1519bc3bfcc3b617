use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skyvault_protocol::ContentRef;
use tracing::{debug, info};

use crate::TransferError;
use crate::store::ObjectStore;

/// Stored bytes identified by `(digest, size)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentObject {
    pub digest: String,
    pub size: u64,
    pub location: String,
    pub registered_at: DateTime<Utc>,
}

impl ContentObject {
    pub fn to_ref(&self) -> ContentRef {
        ContentRef {
            digest: self.digest.clone(),
            size: self.size,
            location: self.location.clone(),
            registered_at: self.registered_at,
        }
    }
}

/// Result of [`ContentIndex::register_or_reuse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The staged bytes became a new object.
    Created(ContentObject),
    /// Identical content was already stored; the staged bytes were dropped.
    Reused(ContentObject),
}

impl RegisterOutcome {
    pub fn object(&self) -> &ContentObject {
        match self {
            RegisterOutcome::Created(o) | RegisterOutcome::Reused(o) => o,
        }
    }

    pub fn into_object(self) -> ContentObject {
        match self {
            RegisterOutcome::Created(o) | RegisterOutcome::Reused(o) => o,
        }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, RegisterOutcome::Reused(_))
    }
}

/// Canonical store location of an object:
/// `objects/<d0d1>/<d2d3>/<digest>-<size>`. Distinct keys never share a
/// location, even when their digests collide.
pub fn object_location(digest: &str, size: u64) -> String {
    let a = digest.get(..2).unwrap_or("00");
    let b = digest.get(2..4).unwrap_or("00");
    format!("objects/{a}/{b}/{digest}-{size}")
}

type ContentKey = (String, u64);

/// Content-addressed index of stored objects.
///
/// Registration is serialized per key; different keys never wait on each
/// other. With a journal path every registration is written through to a
/// JSON file so the index survives restarts.
pub struct ContentIndex {
    store: Arc<dyn ObjectStore>,
    objects: RwLock<HashMap<ContentKey, ContentObject>>,
    key_locks: Mutex<HashMap<ContentKey, Arc<Mutex<()>>>>,
    journal: Option<Mutex<PathBuf>>,
}

impl ContentIndex {
    /// Creates an empty in-memory index.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            objects: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            journal: None,
        }
    }

    /// Opens an index persisted at `journal`, loading it if it exists.
    pub fn open(store: Arc<dyn ObjectStore>, journal: &Path) -> Result<Self, TransferError> {
        let mut objects = HashMap::new();
        if journal.exists() {
            let content = std::fs::read_to_string(journal)?;
            let list: Vec<ContentObject> = serde_json::from_str(&content)?;
            for obj in list {
                objects.insert((obj.digest.clone(), obj.size), obj);
            }
        }
        info!(path = %journal.display(), objects = objects.len(), "content index loaded");

        Ok(Self {
            store,
            objects: RwLock::new(objects),
            key_locks: Mutex::new(HashMap::new()),
            journal: Some(Mutex::new(journal.to_path_buf())),
        })
    }

    /// Returns the object stored under `(digest, size)`, if any.
    pub fn lookup(&self, digest: &str, size: u64) -> Option<ContentObject> {
        let objects = self.objects.read().unwrap();
        objects.get(&(digest.to_string(), size)).cloned()
    }

    pub fn contains(&self, digest: &str, size: u64) -> bool {
        self.lookup(digest, size).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lists every object, oldest first.
    pub fn objects(&self) -> Vec<ContentObject> {
        let mut list: Vec<ContentObject> = self.objects.read().unwrap().values().cloned().collect();
        list.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        list
    }

    /// Turns a verified staging artifact into a stored object, or drops it
    /// in favour of an identical object that is already stored.
    pub fn register_or_reuse(
        &self,
        digest: &str,
        size: u64,
        staging: &str,
    ) -> Result<RegisterOutcome, TransferError> {
        let key: ContentKey = (digest.to_string(), size);
        let key_lock = self.key_lock(&key);
        let result = {
            let _guard = key_lock.lock().unwrap();
            self.register_locked(&key, staging)
        };
        self.release_key_lock(&key, key_lock);
        result
    }

    fn register_locked(
        &self,
        key: &ContentKey,
        staging: &str,
    ) -> Result<RegisterOutcome, TransferError> {
        let (digest, size) = (key.0.as_str(), key.1);

        if let Some(existing) = self.lookup(digest, size) {
            self.store.delete(staging)?;
            debug!(digest, size, "identical content already stored; staging dropped");
            return Ok(RegisterOutcome::Reused(existing));
        }

        let location = object_location(digest, size);
        self.store.rename(staging, &location)?;

        let object = ContentObject {
            digest: digest.to_string(),
            size,
            location,
            registered_at: Utc::now(),
        };
        self.objects
            .write()
            .unwrap()
            .insert(key.clone(), object.clone());
        self.persist()?;

        info!(digest, size, location = %object.location, "content object registered");
        Ok(RegisterOutcome::Created(object))
    }

    fn key_lock(&self, key: &ContentKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Drops the per-key lock once no other registration holds it.
    fn release_key_lock(&self, key: &ContentKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock().unwrap();
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    fn persist(&self) -> Result<(), TransferError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let path = journal.lock().unwrap();
        let content = serde_json::to_string_pretty(&self.objects())?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &*path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::checksum_bytes;
    use crate::store::LocalStore;
    use std::thread;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<dyn ObjectStore>) {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(tmp.path().join("store")).unwrap());
        (tmp, store)
    }

    #[test]
    fn object_location_shards_by_prefix() {
        let digest = checksum_bytes(b"abc");
        let loc = object_location(&digest, 3);
        assert_eq!(
            loc,
            format!("objects/{}/{}/{}-3", &digest[..2], &digest[2..4], digest)
        );
    }

    #[test]
    fn same_digest_with_different_sizes_keeps_both_objects() {
        let (_tmp, store) = setup();
        let index = ContentIndex::new(Arc::clone(&store));
        let digest = "ab".repeat(32);
        store.write_at("staging/a.part", 0, b"aaa").unwrap();
        store.write_at("staging/b.part", 0, b"bbbb").unwrap();

        let a = index.register_or_reuse(&digest, 3, "staging/a.part").unwrap();
        let b = index.register_or_reuse(&digest, 4, "staging/b.part").unwrap();
        assert!(!b.is_reused());
        assert_ne!(a.object().location, b.object().location);

        assert_eq!(store.read_at(&a.object().location, 0, 3).unwrap(), b"aaa");
        assert_eq!(store.read_at(&b.object().location, 0, 4).unwrap(), b"bbbb");
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn register_promotes_staging() {
        let (_tmp, store) = setup();
        let index = ContentIndex::new(Arc::clone(&store));
        let digest = checksum_bytes(b"payload");
        store.write_at("staging/a.part", 0, b"payload").unwrap();

        let outcome = index.register_or_reuse(&digest, 7, "staging/a.part").unwrap();
        assert!(!outcome.is_reused());
        let obj = outcome.into_object();
        assert_eq!(store.size("staging/a.part").unwrap(), None);
        assert_eq!(store.read_at(&obj.location, 0, 7).unwrap(), b"payload");
        assert_eq!(index.lookup(&digest, 7), Some(obj));
    }

    #[test]
    fn lookup_requires_matching_size() {
        let (_tmp, store) = setup();
        let index = ContentIndex::new(Arc::clone(&store));
        let digest = checksum_bytes(b"payload");
        store.write_at("staging/a.part", 0, b"payload").unwrap();
        index.register_or_reuse(&digest, 7, "staging/a.part").unwrap();

        assert!(index.contains(&digest, 7));
        assert!(!index.contains(&digest, 8));
    }

    #[test]
    fn second_register_reuses_and_drops_staging() {
        let (_tmp, store) = setup();
        let index = ContentIndex::new(Arc::clone(&store));
        let digest = checksum_bytes(b"same");
        store.write_at("staging/1.part", 0, b"same").unwrap();
        store.write_at("staging/2.part", 0, b"same").unwrap();

        let first = index.register_or_reuse(&digest, 4, "staging/1.part").unwrap();
        let second = index.register_or_reuse(&digest, 4, "staging/2.part").unwrap();

        assert!(second.is_reused());
        assert_eq!(first.object(), second.object());
        assert_eq!(store.size("staging/2.part").unwrap(), None);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn concurrent_registration_creates_one_object() {
        let (_tmp, store) = setup();
        let index = Arc::new(ContentIndex::new(Arc::clone(&store)));
        let digest = checksum_bytes(b"racing bytes");

        let mut handles = vec![];
        for i in 0..8 {
            let staging = format!("staging/{i}.part");
            store.write_at(&staging, 0, b"racing bytes").unwrap();
            let idx = Arc::clone(&index);
            let d = digest.clone();
            handles.push(thread::spawn(move || {
                idx.register_or_reuse(&d, 12, &staging).unwrap()
            }));
        }

        let outcomes: Vec<RegisterOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let created = outcomes.iter().filter(|o| !o.is_reused()).count();
        assert_eq!(created, 1);
        assert_eq!(index.len(), 1);
        for i in 0..8 {
            assert_eq!(store.size(&format!("staging/{i}.part")).unwrap(), None);
        }
        assert!(index.key_locks.lock().unwrap().is_empty());
    }

    #[test]
    fn journal_survives_reopen() {
        let (tmp, store) = setup();
        let journal = tmp.path().join("content-index.json");
        let digest = checksum_bytes(b"persist me");
        {
            let index = ContentIndex::open(Arc::clone(&store), &journal).unwrap();
            store.write_at("staging/p.part", 0, b"persist me").unwrap();
            index.register_or_reuse(&digest, 10, "staging/p.part").unwrap();
        }

        let reopened = ContentIndex::open(store, &journal).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.contains(&digest, 10));
    }

    #[test]
    fn missing_staging_is_not_found() {
        let (_tmp, store) = setup();
        let index = ContentIndex::new(store);
        let digest = checksum_bytes(b"ghost");
        assert!(matches!(
            index.register_or_reuse(&digest, 5, "staging/ghost.part"),
            Err(TransferError::NotFound(_))
        ));
        assert!(index.is_empty());
    }
}
