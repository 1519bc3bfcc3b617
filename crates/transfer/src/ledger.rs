//! Chunk ledger: bookkeeping for resumable chunked uploads.
//!
//! A session collects the pieces of one upload in a staging artifact.
//! Pieces may arrive in any order and may be re-sent; each is written at
//! `index * chunk_size`. A running digest follows the contiguous prefix of
//! received pieces so completion rarely has to re-read staged bytes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use skyvault_protocol::ChunkAck;
use tracing::{debug, info, warn};

use crate::digest::{DigestEngine, normalize_digest};
use crate::index::{ContentIndex, ContentObject};
use crate::store::ObjectStore;
use crate::validation::validate_file_name;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Number of chunks a file of `size` bytes splits into.
pub fn expected_chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size)
}

/// Derives the session ID for an upload of the given content.
///
/// The same (name, size, digest) always maps to the same session, which is
/// what lets a disconnected client pick up where it left off. `digest` must
/// already be normalized.
pub fn upload_session_id(name: &str, size: u64, digest: &str) -> String {
    let mut engine = DigestEngine::new();
    engine.update(format!("{name}\n{size}\n{digest}").as_bytes());
    let mut id = engine.finalize_hex();
    id.truncate(32);
    id
}

/// Derives the session ID for an upload owned by `owner`.
///
/// Owned sessions never collide with client sessions or with sessions of
/// other owners, even for identical content.
pub fn owned_session_id(owner: &str, name: &str, size: u64, digest: &str) -> String {
    let mut engine = DigestEngine::new();
    engine.update(format!("{owner}\n{name}\n{size}\n{digest}").as_bytes());
    let mut id = engine.finalize_hex();
    id.truncate(32);
    id
}

/// Public view of an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub name: String,
    pub size: u64,
    pub digest: String,
    pub chunk_size: u64,
    pub chunk_count: u32,
    /// Received chunk indices, ascending.
    pub received: Vec<u32>,
}

impl SessionInfo {
    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.chunk_count
    }
}

/// Result of [`ChunkLedger::init_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitUploadOutcome {
    /// A new session was opened.
    Created(SessionInfo),
    /// A session for the same content already existed and was returned unchanged.
    Resumed(SessionInfo),
    /// The content is already stored; no session was opened.
    AlreadySatisfied(ContentObject),
}

/// Result of [`ChunkLedger::complete_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteOutcome {
    pub content: ContentObject,
    /// `true` when an identical object was already stored.
    pub deduplicated: bool,
}

struct UploadSession {
    id: String,
    name: String,
    size: u64,
    digest: String,
    chunk_size: u64,
    chunk_count: u32,
    received: BTreeSet<u32>,
    staging: String,
    hasher: DigestEngine,
    /// Chunks `0..hashed` have been fed to `hasher`.
    hashed: u32,
    last_activity: Instant,
    /// Set once the session is completed, aborted or reclaimed.
    finished: bool,
}

impl UploadSession {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            digest: self.digest.clone(),
            chunk_size: self.chunk_size,
            chunk_count: self.chunk_count,
            received: self.received.iter().copied().collect(),
        }
    }

    fn offset_of(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size
    }

    fn chunk_len(&self, index: u32) -> u64 {
        if index + 1 == self.chunk_count {
            self.size - self.offset_of(index)
        } else {
            self.chunk_size
        }
    }

    /// Feeds newly contiguous chunks to the running digest. `fresh` is the
    /// chunk just written, which saves reading it back.
    fn advance_digest(
        &mut self,
        store: &dyn ObjectStore,
        fresh: Option<(u32, &[u8])>,
    ) -> Result<(), TransferError> {
        while self.hashed < self.chunk_count && self.received.contains(&self.hashed) {
            let index = self.hashed;
            match fresh {
                Some((i, data)) if i == index => self.hasher.update(data),
                _ => {
                    let len = self.chunk_len(index) as usize;
                    let data = store.read_at(&self.staging, self.offset_of(index), len)?;
                    if data.len() != len {
                        return Err(TransferError::Integrity {
                            expected: format!("{len} staged bytes for chunk {index}"),
                            actual: format!("{} bytes", data.len()),
                        });
                    }
                    self.hasher.update(&data);
                }
            }
            self.hashed += 1;
        }
        Ok(())
    }

    fn missing(&self) -> Vec<u32> {
        (0..self.chunk_count)
            .filter(|i| !self.received.contains(i))
            .collect()
    }
}

/// Tracks in-progress chunked uploads.
///
/// Sessions are independent: each sits behind its own mutex, so work on
/// one session never waits for another. The session map lock is never held
/// while a session lock is being acquired.
pub struct ChunkLedger {
    store: Arc<dyn ObjectStore>,
    index: Arc<ContentIndex>,
    chunk_size: u64,
    sessions: RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>,
}

impl ChunkLedger {
    /// Creates a ledger. A `chunk_size` of 0 selects [`DEFAULT_CHUNK_SIZE`].
    pub fn new(store: Arc<dyn ObjectStore>, index: Arc<ContentIndex>, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            store,
            index,
            chunk_size: chunk_size as u64,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Chunk size every session of this ledger uses.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Opens an upload session, reopens an existing one, or reports that the
    /// content is already stored.
    pub fn init_upload(
        &self,
        name: &str,
        size: u64,
        digest: &str,
        chunk_count: u32,
    ) -> Result<InitUploadOutcome, TransferError> {
        self.open_session(None, name, size, digest, chunk_count)
    }

    /// Like [`init_upload`](Self::init_upload), but the session belongs to
    /// `owner` alone. Identical content uploaded by someone else lands in a
    /// separate session and is merged only by the content index.
    pub fn init_owned_upload(
        &self,
        owner: &str,
        name: &str,
        size: u64,
        digest: &str,
        chunk_count: u32,
    ) -> Result<InitUploadOutcome, TransferError> {
        self.open_session(Some(owner), name, size, digest, chunk_count)
    }

    fn open_session(
        &self,
        owner: Option<&str>,
        name: &str,
        size: u64,
        digest: &str,
        chunk_count: u32,
    ) -> Result<InitUploadOutcome, TransferError> {
        validate_file_name(name)?;
        let digest = normalize_digest(digest)?;

        let expected = expected_chunk_count(size, self.chunk_size);
        if chunk_count as u64 != expected {
            return Err(TransferError::InvalidRequest(format!(
                "{size} bytes at chunk size {} need {expected} chunks, got {chunk_count}",
                self.chunk_size
            )));
        }

        if let Some(existing) = self.index.lookup(&digest, size) {
            debug!(digest = %digest, size, "upload already satisfied by stored content");
            return Ok(InitUploadOutcome::AlreadySatisfied(existing));
        }

        let id = match owner {
            Some(owner) => owned_session_id(owner, name, size, &digest),
            None => upload_session_id(name, size, &digest),
        };
        loop {
            if let Some(session) = self.get(&id) {
                let s = session.lock().unwrap();
                if !s.finished {
                    debug!(session = %id, received = s.received.len(), "upload session resumed");
                    return Ok(InitUploadOutcome::Resumed(s.info()));
                }
                // A finished session has already left the map.
            }

            let mut sessions = self.sessions.write().unwrap();
            if sessions.contains_key(&id) {
                // Opened concurrently by another request; resume that one.
                continue;
            }

            let staging = format!("staging/{id}.part");
            self.store.create(&staging)?;
            let session = UploadSession {
                id: id.clone(),
                name: name.to_string(),
                size,
                digest: digest.clone(),
                chunk_size: self.chunk_size,
                chunk_count,
                received: BTreeSet::new(),
                staging,
                hasher: DigestEngine::new(),
                hashed: 0,
                last_activity: Instant::now(),
                finished: false,
            };
            let info = session.info();
            sessions.insert(id.clone(), Arc::new(Mutex::new(session)));

            info!(session = %id, name, size, chunks = chunk_count, "upload session created");
            return Ok(InitUploadOutcome::Created(info));
        }
    }

    /// Stores one chunk. Re-sending an index overwrites the earlier bytes.
    pub fn put_chunk(
        &self,
        session_id: &str,
        index: u32,
        data: &[u8],
    ) -> Result<ChunkAck, TransferError> {
        let session = self.require(session_id)?;
        let mut s = session.lock().unwrap();
        if s.finished {
            return Err(TransferError::NotFound(format!("upload session {session_id}")));
        }

        if index >= s.chunk_count {
            return Err(TransferError::InvalidRequest(format!(
                "chunk index {index} out of range (session has {} chunks)",
                s.chunk_count
            )));
        }
        let expected_len = s.chunk_len(index);
        if data.len() as u64 != expected_len {
            return Err(TransferError::InvalidRequest(format!(
                "chunk {index} must be {expected_len} bytes, got {}",
                data.len()
            )));
        }

        self.store.write_at(&s.staging, s.offset_of(index), data)?;

        if s.received.contains(&index) && index < s.hashed {
            // The digest already covers the old bytes of this chunk.
            debug!(session = %session_id, index, "chunk rewritten; rewinding digest");
            s.hasher = DigestEngine::new();
            s.hashed = 0;
        }
        s.received.insert(index);
        s.last_activity = Instant::now();
        s.advance_digest(self.store.as_ref(), Some((index, data)))?;

        Ok(ChunkAck {
            session_id: session_id.to_string(),
            index,
            received_count: s.received.len() as u32,
            chunk_count: s.chunk_count,
        })
    }

    /// Verifies the assembled upload and registers it with the content index.
    ///
    /// On a digest mismatch the staged bytes and the session are discarded.
    pub fn complete_upload(&self, session_id: &str) -> Result<CompleteOutcome, TransferError> {
        let session = self.require(session_id)?;
        let mut s = session.lock().unwrap();
        if s.finished {
            return Err(TransferError::NotFound(format!("upload session {session_id}")));
        }

        let missing = s.missing();
        if !missing.is_empty() {
            return Err(TransferError::InvalidRequest(format!(
                "upload incomplete, missing chunks {missing:?}"
            )));
        }

        s.advance_digest(self.store.as_ref(), None)?;
        let actual = s.hasher.clone().finalize_hex();
        if actual != s.digest {
            warn!(session = %session_id, expected = %s.digest, actual = %actual, "upload digest mismatch");
            s.finished = true;
            self.forget(session_id);
            self.store.delete(&s.staging)?;
            return Err(TransferError::Integrity {
                expected: s.digest.clone(),
                actual,
            });
        }

        let outcome = self.index.register_or_reuse(&s.digest, s.size, &s.staging)?;
        s.finished = true;
        self.forget(session_id);

        let deduplicated = outcome.is_reused();
        info!(session = %session_id, digest = %s.digest, deduplicated, "upload completed");
        Ok(CompleteOutcome {
            content: outcome.into_object(),
            deduplicated,
        })
    }

    /// Returns the current view of a session.
    pub fn session_info(&self, session_id: &str) -> Result<SessionInfo, TransferError> {
        let session = self.require(session_id)?;
        let s = session.lock().unwrap();
        if s.finished {
            return Err(TransferError::NotFound(format!("upload session {session_id}")));
        }
        Ok(s.info())
    }

    /// Drops a session and its staged bytes.
    pub fn abort_upload(&self, session_id: &str) -> Result<(), TransferError> {
        let session = self.require(session_id)?;
        let mut s = session.lock().unwrap();
        if s.finished {
            return Err(TransferError::NotFound(format!("upload session {session_id}")));
        }
        s.finished = true;
        self.forget(session_id);
        self.store.delete(&s.staging)?;
        info!(session = %session_id, "upload session aborted");
        Ok(())
    }

    /// Drops every session idle for longer than `idle_window` and returns
    /// their IDs. Meant to be called by an external housekeeping job.
    pub fn reclaim_idle(&self, idle_window: Duration) -> Result<Vec<String>, TransferError> {
        let candidates: Vec<(String, Arc<Mutex<UploadSession>>)> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .map(|(id, s)| (id.clone(), Arc::clone(s)))
                .collect()
        };

        let mut reclaimed = Vec::new();
        for (id, session) in candidates {
            let mut s = session.lock().unwrap();
            if s.finished || s.last_activity.elapsed() <= idle_window {
                continue;
            }
            s.finished = true;
            self.forget(&id);
            self.store.delete(&s.staging)?;
            reclaimed.push(id);
        }

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "idle upload sessions reclaimed");
        }
        Ok(reclaimed)
    }

    fn get(&self, session_id: &str) -> Option<Arc<Mutex<UploadSession>>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    fn require(&self, session_id: &str) -> Result<Arc<Mutex<UploadSession>>, TransferError> {
        self.get(session_id)
            .ok_or_else(|| TransferError::NotFound(format!("upload session {session_id}")))
    }

    fn forget(&self, session_id: &str) {
        self.sessions.write().unwrap().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::checksum_bytes;
    use crate::store::LocalStore;
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: Arc<dyn ObjectStore>,
        index: Arc<ContentIndex>,
        ledger: Arc<ChunkLedger>,
    }

    fn fixture(chunk_size: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(tmp.path()).unwrap());
        let index = Arc::new(ContentIndex::new(Arc::clone(&store)));
        let ledger = Arc::new(ChunkLedger::new(
            Arc::clone(&store),
            Arc::clone(&index),
            chunk_size,
        ));
        Fixture {
            _tmp: tmp,
            store,
            index,
            ledger,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn created(outcome: InitUploadOutcome) -> SessionInfo {
        match outcome {
            InitUploadOutcome::Created(info) => info,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(expected_chunk_count(25, 10), 3);
        assert_eq!(expected_chunk_count(30, 10), 3);
        assert_eq!(expected_chunk_count(0, 10), 0);
        assert_eq!(expected_chunk_count(1, 10), 1);
    }

    #[test]
    fn out_of_order_chunks_complete() {
        let f = fixture(10);
        let data = payload(25);
        let digest = checksum_bytes(&data);

        let info = created(f.ledger.init_upload("a.bin", 25, &digest, 3).unwrap());
        assert_eq!(info.chunk_count, 3);

        let sid = &info.session_id;
        f.ledger.put_chunk(sid, 2, &data[20..25]).unwrap();
        f.ledger.put_chunk(sid, 0, &data[0..10]).unwrap();
        let ack = f.ledger.put_chunk(sid, 1, &data[10..20]).unwrap();
        assert_eq!(ack.received_count, 3);

        let done = f.ledger.complete_upload(sid).unwrap();
        assert!(!done.deduplicated);
        assert_eq!(done.content.size, 25);
        assert_eq!(f.index.len(), 1);
        assert_eq!(f.store.read_at(&done.content.location, 0, 25).unwrap(), data);
        assert_eq!(f.ledger.session_count(), 0);
    }

    #[test]
    fn rejects_wrong_chunk_count() {
        let f = fixture(10);
        let digest = checksum_bytes(&payload(25));
        assert!(matches!(
            f.ledger.init_upload("a.bin", 25, &digest, 2),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_bad_name_and_digest() {
        let f = fixture(10);
        let digest = checksum_bytes(b"x");
        assert!(f.ledger.init_upload("../x", 1, &digest, 1).is_err());
        assert!(f.ledger.init_upload("x", 1, "nothex", 1).is_err());
    }

    #[test]
    fn rejects_bad_index_and_length() {
        let f = fixture(10);
        let data = payload(25);
        let info = created(f.ledger.init_upload("a.bin", 25, &checksum_bytes(&data), 3).unwrap());
        let sid = &info.session_id;

        assert!(matches!(
            f.ledger.put_chunk(sid, 3, &data[..5]),
            Err(TransferError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.ledger.put_chunk(sid, 0, &data[..9]),
            Err(TransferError::InvalidRequest(_))
        ));
        // Last chunk must carry exactly the remainder.
        assert!(matches!(
            f.ledger.put_chunk(sid, 2, &data[..10]),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[test]
    fn resent_chunk_last_write_wins() {
        let f = fixture(10);
        let data = payload(25);
        let digest = checksum_bytes(&data);
        let info = created(f.ledger.init_upload("a.bin", 25, &digest, 3).unwrap());
        let sid = &info.session_id;

        // Garbage first, then the real bytes for the same index.
        f.ledger.put_chunk(sid, 0, &[0xAA; 10]).unwrap();
        f.ledger.put_chunk(sid, 1, &data[10..20]).unwrap();
        f.ledger.put_chunk(sid, 0, &data[0..10]).unwrap();
        f.ledger.put_chunk(sid, 2, &data[20..25]).unwrap();

        let done = f.ledger.complete_upload(sid).unwrap();
        assert_eq!(f.store.read_at(&done.content.location, 0, 25).unwrap(), data);
    }

    #[test]
    fn incomplete_upload_reports_missing() {
        let f = fixture(10);
        let data = payload(25);
        let info = created(f.ledger.init_upload("a.bin", 25, &checksum_bytes(&data), 3).unwrap());
        let sid = &info.session_id;
        f.ledger.put_chunk(sid, 1, &data[10..20]).unwrap();

        let err = f.ledger.complete_upload(sid).unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)));
        assert!(err.to_string().contains("[0, 2]"));
        // Session survives so the client can send the rest.
        assert_eq!(f.ledger.session_info(sid).unwrap().received, vec![1]);
    }

    #[test]
    fn digest_mismatch_discards_session() {
        let f = fixture(10);
        let data = payload(25);
        let wrong = checksum_bytes(b"something else");
        let info = created(f.ledger.init_upload("a.bin", 25, &wrong, 3).unwrap());
        let sid = info.session_id.clone();
        for i in 0..3u32 {
            let start = i as usize * 10;
            let end = (start + 10).min(25);
            f.ledger.put_chunk(&sid, i, &data[start..end]).unwrap();
        }

        let err = f.ledger.complete_upload(&sid).unwrap_err();
        assert!(matches!(err, TransferError::Integrity { .. }));
        assert!(f.index.is_empty());
        assert_eq!(f.store.size(&format!("staging/{sid}.part")).unwrap(), None);
        assert!(matches!(
            f.ledger.put_chunk(&sid, 0, &data[..10]),
            Err(TransferError::NotFound(_))
        ));
    }

    #[test]
    fn init_twice_resumes_same_session() {
        let f = fixture(10);
        let data = payload(25);
        let digest = checksum_bytes(&data);
        let info = created(f.ledger.init_upload("a.bin", 25, &digest, 3).unwrap());
        f.ledger.put_chunk(&info.session_id, 0, &data[..10]).unwrap();

        match f.ledger.init_upload("a.bin", 25, &digest, 3).unwrap() {
            InitUploadOutcome::Resumed(again) => {
                assert_eq!(again.session_id, info.session_id);
                assert_eq!(again.received, vec![0]);
            }
            other => panic!("expected Resumed, got {other:?}"),
        }
    }

    #[test]
    fn stored_content_short_circuits_init() {
        let f = fixture(10);
        let data = payload(12);
        let digest = checksum_bytes(&data);
        let info = created(f.ledger.init_upload("a.bin", 12, &digest, 2).unwrap());
        f.ledger.put_chunk(&info.session_id, 0, &data[..10]).unwrap();
        f.ledger.put_chunk(&info.session_id, 1, &data[10..]).unwrap();
        f.ledger.complete_upload(&info.session_id).unwrap();

        // Different name, same content.
        match f.ledger.init_upload("copy.bin", 12, &digest, 2).unwrap() {
            InitUploadOutcome::AlreadySatisfied(obj) => assert_eq!(obj.size, 12),
            other => panic!("expected AlreadySatisfied, got {other:?}"),
        }
        assert_eq!(f.ledger.session_count(), 0);
    }

    #[test]
    fn parallel_sessions_with_same_content_store_once() {
        let f = fixture(10);
        let data = payload(25);
        let digest = checksum_bytes(&data);
        let a = created(f.ledger.init_upload("a.bin", 25, &digest, 3).unwrap());
        let b = created(f.ledger.init_upload("b.bin", 25, &digest, 3).unwrap());
        assert_ne!(a.session_id, b.session_id);

        for sid in [&a.session_id, &b.session_id] {
            f.ledger.put_chunk(sid, 0, &data[0..10]).unwrap();
            f.ledger.put_chunk(sid, 1, &data[10..20]).unwrap();
            f.ledger.put_chunk(sid, 2, &data[20..25]).unwrap();
        }

        let ledger_a = Arc::clone(&f.ledger);
        let ledger_b = Arc::clone(&f.ledger);
        let (sa, sb) = (a.session_id.clone(), b.session_id.clone());
        let ha = thread::spawn(move || ledger_a.complete_upload(&sa).unwrap());
        let hb = thread::spawn(move || ledger_b.complete_upload(&sb).unwrap());
        let (ra, rb) = (ha.join().unwrap(), hb.join().unwrap());

        assert_eq!(ra.content, rb.content);
        assert!(ra.deduplicated != rb.deduplicated);
        assert_eq!(f.index.len(), 1);
        assert_eq!(f.store.size(&format!("staging/{}.part", a.session_id)).unwrap(), None);
        assert_eq!(f.store.size(&format!("staging/{}.part", b.session_id)).unwrap(), None);
    }

    #[test]
    fn empty_upload_creates_empty_object() {
        let f = fixture(10);
        let digest = checksum_bytes(b"");
        let info = created(f.ledger.init_upload("empty.txt", 0, &digest, 0).unwrap());
        let done = f.ledger.complete_upload(&info.session_id).unwrap();
        assert_eq!(done.content.size, 0);
        assert_eq!(f.store.size(&done.content.location).unwrap(), Some(0));
    }

    #[test]
    fn abort_removes_staging() {
        let f = fixture(10);
        let data = payload(15);
        let info = created(f.ledger.init_upload("a.bin", 15, &checksum_bytes(&data), 2).unwrap());
        f.ledger.put_chunk(&info.session_id, 0, &data[..10]).unwrap();

        f.ledger.abort_upload(&info.session_id).unwrap();
        assert_eq!(f.ledger.session_count(), 0);
        assert_eq!(
            f.store.size(&format!("staging/{}.part", info.session_id)).unwrap(),
            None
        );
        assert!(matches!(
            f.ledger.session_info(&info.session_id),
            Err(TransferError::NotFound(_))
        ));
    }

    #[test]
    fn reclaim_only_touches_idle_sessions() {
        let f = fixture(10);
        let digest = checksum_bytes(&payload(5));
        let info = created(f.ledger.init_upload("a.bin", 5, &digest, 1).unwrap());

        assert!(f.ledger.reclaim_idle(Duration::from_secs(3600)).unwrap().is_empty());
        thread::sleep(Duration::from_millis(20));
        let reclaimed = f.ledger.reclaim_idle(Duration::from_millis(5)).unwrap();
        assert_eq!(reclaimed, vec![info.session_id.clone()]);
        assert_eq!(f.ledger.session_count(), 0);
    }

    #[test]
    fn concurrent_chunks_for_one_session() {
        let f = fixture(100);
        let data = Arc::new(payload(1000));
        let digest = checksum_bytes(&data);
        let info = created(f.ledger.init_upload("big.bin", 1000, &digest, 10).unwrap());

        let mut handles = vec![];
        for i in (0..10u32).rev() {
            let ledger = Arc::clone(&f.ledger);
            let d = Arc::clone(&data);
            let sid = info.session_id.clone();
            handles.push(thread::spawn(move || {
                let start = i as usize * 100;
                ledger.put_chunk(&sid, i, &d[start..start + 100]).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let done = f.ledger.complete_upload(&info.session_id).unwrap();
        assert_eq!(done.content.digest, digest);
    }

    #[test]
    fn owned_sessions_are_separate_from_each_other_and_from_clients() {
        let f = fixture(10);
        let data = payload(25);
        let digest = checksum_bytes(&data);

        let client = created(f.ledger.init_upload("a.bin", 25, &digest, 3).unwrap());
        let first = created(
            f.ledger
                .init_owned_upload("task-1", "a.bin", 25, &digest, 3)
                .unwrap(),
        );
        let second = created(
            f.ledger
                .init_owned_upload("task-2", "a.bin", 25, &digest, 3)
                .unwrap(),
        );
        assert_ne!(client.session_id, first.session_id);
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(
            first.session_id,
            owned_session_id("task-1", "a.bin", 25, &digest)
        );

        f.ledger.put_chunk(&first.session_id, 0, &data[..10]).unwrap();
        f.ledger.abort_upload(&first.session_id).unwrap();

        // The other sessions keep their own staging and keep accepting chunks.
        f.ledger.put_chunk(&client.session_id, 0, &data[..10]).unwrap();
        for (i, range) in [(0u32, 0..10), (1, 10..20), (2, 20..25)] {
            f.ledger.put_chunk(&second.session_id, i, &data[range]).unwrap();
        }
        let done = f.ledger.complete_upload(&second.session_id).unwrap();
        assert!(!done.deduplicated);
        assert_eq!(f.ledger.session_count(), 1);

        match f.ledger.init_owned_upload("task-1", "a.bin", 25, &digest, 3).unwrap() {
            InitUploadOutcome::AlreadySatisfied(object) => assert_eq!(object.digest, digest),
            other => panic!("expected AlreadySatisfied, got {other:?}"),
        }
    }
}
