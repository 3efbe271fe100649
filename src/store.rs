//! File-per-unit archive store.
//!
//! Every record lives under one sortable key `YYYYmmdd-HHMMSS_<id>`:
//!
//! - `<key>.meta`   metadata JSON; the record exists iff this file exists
//! - `<key>.body`   payload JSON; the record is populated iff this file exists
//! - `<key>.<name>` caller-owned sidecars
//!
//! The key is the index: a directory scan sorted by file name is a
//! chronological scan. Units are written to a temp file and then published,
//! so readers never see a partial write. Creates are serialized by an
//! advisory lock on `.create.lock`, which makes the id lookup and the publish
//! one step for every handle and process sharing the directory.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{ContentState, Metadata, MessageId, Payload, Record, StateKind, StoreKey};

const META_EXT: &str = "meta";
const BODY_EXT: &str = "body";
const TEMP_MARKER: &str = ".tmp-";
const CREATE_LOCK: &str = ".create.lock";
/// Temp files older than this were abandoned by a killed writer.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub io_timeout: Duration,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            io_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Inclusive lower bound, second precision.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound, second precision.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub newest_first: bool,
    /// Only records that lack this sidecar.
    pub sidecar_missing: Option<String>,
    pub state: Option<StateKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOutcome {
    Populated,
    AlreadyPopulated,
    Overwritten,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: usize,
    pub populated: usize,
    pub pending: usize,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

/// One pass over the archive directory: record keys plus every file name,
/// so state and sidecar checks need no extra syscalls.
struct DirIndex {
    keys: Vec<StoreKey>,
    files: HashSet<String>,
}

impl DirIndex {
    fn is_populated(&self, key: &StoreKey) -> bool {
        self.files.contains(&format!("{key}.{BODY_EXT}"))
    }

    fn has_sidecar(&self, key: &StoreKey, name: &str) -> bool {
        self.files.contains(&format!("{key}.{name}"))
    }
}

#[derive(Clone)]
pub struct EmailStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    io_timeout: Duration,
    /// id -> key. Records are never deleted or re-keyed, so entries never go
    /// stale; a miss falls back to a directory scan.
    keys: RwLock<HashMap<MessageId, StoreKey>>,
}

impl EmailStore {
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.root)
            .await
            .map_err(|source| StoreError::Unreachable {
                path: config.root.clone(),
                source,
            })?;
        sweep_stale_temps(&config.root).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                root: config.root,
                io_timeout: config.io_timeout,
                keys: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Creates a pending record. Fails with `AlreadyExists` if the id is
    /// archived under any key.
    pub async fn create(&self, metadata: Metadata) -> Result<Record, StoreError> {
        let key = StoreKey::for_metadata(&metadata)?;
        self.bounded("create", async {
            if self.cached_key(&metadata.id).is_some() {
                return Err(StoreError::AlreadyExists(metadata.id.clone()));
            }
            let path = self.unit_path(&key, META_EXT);
            let bytes = encode(&path, &metadata)?;

            // Held until the record is published; the same id under another
            // timestamp would otherwise slip past the lookup.
            let _lock = self.lock_creates().await?;
            if self.find_key(&metadata.id).await?.is_some() {
                return Err(StoreError::AlreadyExists(metadata.id.clone()));
            }
            if !self.publish(&path, bytes, true).await? {
                return Err(StoreError::AlreadyExists(metadata.id.clone()));
            }
            self.remember(&key);
            debug!(key = %key, "created record");
            Ok(Record {
                key,
                metadata,
                content: Some(ContentState::Pending),
            })
        })
        .await
    }

    /// Stores the payload for `id`. Without `overwrite`, an already populated
    /// record is left as is and `AlreadyPopulated` is returned.
    pub async fn populate_content(
        &self,
        id: &MessageId,
        payload: &Payload,
        overwrite: bool,
    ) -> Result<PopulateOutcome, StoreError> {
        self.bounded("populate", async {
            let key = self.locate(id).await?;
            let path = self.unit_path(&key, BODY_EXT);
            if !overwrite && exists(&path).await? {
                return Ok(PopulateOutcome::AlreadyPopulated);
            }
            let bytes = encode(&path, payload)?;
            let outcome = if overwrite {
                let existed = exists(&path).await?;
                self.publish(&path, bytes, false).await?;
                if existed {
                    PopulateOutcome::Overwritten
                } else {
                    PopulateOutcome::Populated
                }
            } else if self.publish(&path, bytes, true).await? {
                PopulateOutcome::Populated
            } else {
                PopulateOutcome::AlreadyPopulated
            };
            debug!(key = %key, ?outcome, "stored content");
            Ok(outcome)
        })
        .await
    }

    pub async fn get(&self, id: &MessageId, include_content: bool) -> Result<Record, StoreError> {
        self.bounded("get", async {
            let key = self.locate(id).await?;
            let metadata = self.load_metadata(&key).await?;
            let content = if include_content {
                Some(self.load_content(&key).await?)
            } else {
                None
            };
            Ok(Record {
                key,
                metadata,
                content,
            })
        })
        .await
    }

    pub async fn content_state_of(&self, id: &MessageId) -> Result<StateKind, StoreError> {
        self.bounded("state", async {
            let key = self.locate(id).await?;
            if exists(&self.unit_path(&key, BODY_EXT)).await? {
                Ok(StateKind::Populated)
            } else {
                Ok(StateKind::Pending)
            }
        })
        .await
    }

    /// Keys matching `query`, in key order (reversed for `newest_first`).
    /// Every call re-scans the directory.
    pub async fn list_keys(&self, query: &ListQuery) -> Result<Vec<StoreKey>, StoreError> {
        let index = self.scan().await?;
        let mut keys: Vec<StoreKey> = index
            .keys
            .iter()
            .filter(|key| query.since.is_none_or(|since| key.timestamp() >= since))
            .filter(|key| query.until.is_none_or(|until| key.timestamp() < until))
            .filter(|key| match query.state {
                Some(StateKind::Pending) => !index.is_populated(key),
                Some(StateKind::Populated) => index.is_populated(key),
                None => true,
            })
            .filter(|key| match &query.sidecar_missing {
                Some(name) => !index.has_sidecar(key, name),
                None => true,
            })
            .cloned()
            .collect();
        keys.sort();
        if query.newest_first {
            keys.reverse();
        }
        if let Some(limit) = query.limit {
            keys.truncate(limit);
        }
        Ok(keys)
    }

    /// Lazily loads metadata for every key matching `query`. Content is never
    /// read.
    pub async fn list(
        &self,
        query: &ListQuery,
    ) -> Result<BoxStream<'static, Result<Metadata, StoreError>>, StoreError> {
        let keys = self.list_keys(query).await?;
        let store = self.clone();
        Ok(stream::iter(keys)
            .then(move |key| {
                let store = store.clone();
                async move {
                    store
                        .bounded("read", async { store.load_metadata(&key).await })
                        .await
                }
            })
            .boxed())
    }

    pub async fn known_ids(&self) -> Result<HashSet<MessageId>, StoreError> {
        let index = self.scan().await?;
        Ok(index.keys.into_iter().map(|key| key.id().clone()).collect())
    }

    pub async fn exists(&self, id: &MessageId) -> Result<bool, StoreError> {
        Ok(self.find_key(id).await?.is_some())
    }

    /// Writes a sidecar, replacing any previous sidecar with the same name.
    /// Never touches metadata or content.
    pub async fn attach(&self, id: &MessageId, name: &str, payload: &[u8]) -> Result<(), StoreError> {
        validate_sidecar_name(name)?;
        self.bounded("attach", async {
            let key = self.locate(id).await?;
            let path = self.unit_path(&key, name);
            self.publish(&path, payload.to_vec(), false).await?;
            debug!(key = %key, sidecar = name, "attached sidecar");
            Ok(())
        })
        .await
    }

    pub async fn has_sidecar(&self, id: &MessageId, name: &str) -> Result<bool, StoreError> {
        validate_sidecar_name(name)?;
        let key = self.locate(id).await?;
        exists(&self.unit_path(&key, name)).await
    }

    pub async fn get_sidecar(&self, id: &MessageId, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_sidecar_name(name)?;
        self.bounded("read", async {
            let key = self.locate(id).await?;
            let path = self.unit_path(&key, name);
            match fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(StoreError::io(path, err)),
            }
        })
        .await
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let index = self.scan().await?;
        let populated = index.keys.iter().filter(|k| index.is_populated(k)).count();
        Ok(StoreStats {
            total: index.keys.len(),
            populated,
            pending: index.keys.len() - populated,
            earliest: index.keys.iter().min().map(StoreKey::timestamp),
            latest: index.keys.iter().max().map(StoreKey::timestamp),
        })
    }

    async fn scan(&self) -> Result<DirIndex, StoreError> {
        let root = &self.inner.root;
        let unreachable = |source| StoreError::Unreachable {
            path: root.clone(),
            source,
        };
        self.bounded("scan", async {
            let mut entries = fs::read_dir(root).await.map_err(unreachable)?;
            let mut keys = Vec::new();
            let mut files = HashSet::new();
            while let Some(entry) = entries.next_entry().await.map_err(unreachable)? {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if name.contains(TEMP_MARKER) {
                    continue;
                }
                if let Some(stem) = name.strip_suffix(".meta") {
                    match stem.parse::<StoreKey>() {
                        Ok(key) => keys.push(key),
                        Err(_) => debug!(file = %name, "skipping foreign file"),
                    }
                }
                files.insert(name);
            }
            let mut cache = self.inner.keys.write().unwrap_or_else(|e| e.into_inner());
            for key in &keys {
                cache.insert(key.id().clone(), key.clone());
            }
            Ok(DirIndex { keys, files })
        })
        .await
    }

    async fn find_key(&self, id: &MessageId) -> Result<Option<StoreKey>, StoreError> {
        if let Some(key) = self.cached_key(id) {
            return Ok(Some(key));
        }
        self.scan().await?;
        Ok(self.cached_key(id))
    }

    async fn locate(&self, id: &MessageId) -> Result<StoreKey, StoreError> {
        self.find_key(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn cached_key(&self, id: &MessageId) -> Option<StoreKey> {
        let cache = self.inner.keys.read().unwrap_or_else(|e| e.into_inner());
        cache.get(id).cloned()
    }

    fn remember(&self, key: &StoreKey) {
        let mut cache = self.inner.keys.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(key.id().clone(), key.clone());
    }

    async fn load_metadata(&self, key: &StoreKey) -> Result<Metadata, StoreError> {
        let path = self.unit_path(key, META_EXT);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.id().clone()));
            }
            Err(err) => return Err(StoreError::io(path, err)),
        };
        decode(&path, &bytes)
    }

    async fn load_content(&self, key: &StoreKey) -> Result<ContentState, StoreError> {
        let path = self.unit_path(key, BODY_EXT);
        match fs::read(&path).await {
            Ok(bytes) => Ok(ContentState::Populated(decode(&path, &bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(ContentState::Pending),
            Err(err) => Err(StoreError::io(path, err)),
        }
    }

    fn unit_path(&self, key: &StoreKey, ext: &str) -> PathBuf {
        self.inner.root.join(format!("{key}.{ext}"))
    }

    /// Writes `bytes` to a fresh temp file in the archive directory and moves
    /// it to `target`. An exclusive publish never replaces an existing file
    /// and returns `false` instead, so concurrent writers cannot both win.
    async fn publish(&self, target: &Path, bytes: Vec<u8>, exclusive: bool) -> Result<bool, StoreError> {
        let root = self.inner.root.clone();
        let context = target.to_path_buf();
        let target = target.to_path_buf();
        blocking(&context, move || {
            let mut temp = tempfile::Builder::new()
                .prefix(TEMP_MARKER)
                .tempfile_in(&root)
                .map_err(|err| StoreError::io(&root, err))?;
            temp.write_all(&bytes)
                .and_then(|()| temp.as_file().sync_all())
                .map_err(|err| StoreError::io(temp.path(), err))?;
            let persisted = if exclusive {
                temp.persist_noclobber(&target)
            } else {
                temp.persist(&target)
            };
            match persisted {
                Ok(_) => Ok(true),
                Err(err) if exclusive && err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(err) => Err(StoreError::io(&target, err.error)),
            }
        })
        .await
    }

    /// Exclusive lock on the create lock file, released when the returned
    /// file is dropped.
    async fn lock_creates(&self) -> Result<std::fs::File, StoreError> {
        let context = self.inner.root.join(CREATE_LOCK);
        let path = context.clone();
        blocking(&context, move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|err| StoreError::io(&path, err))?;
            file.lock_exclusive().map_err(|err| StoreError::io(&path, err))?;
            Ok(file)
        })
        .await
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.inner.io_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout { op, timeout })?
    }
}

fn validate_sidecar_name(name: &str) -> Result<(), StoreError> {
    let reserved = name == META_EXT
        || name == BODY_EXT
        || name.ends_with(".meta")
        || name.ends_with(".body")
        || name.contains(TEMP_MARKER);
    let unsafe_chars = name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control());
    if name.is_empty() || name.starts_with('.') || reserved || unsafe_chars {
        return Err(StoreError::InvalidSidecarName(name.to_string()));
    }
    Ok(())
}

async fn exists(path: &Path) -> Result<bool, StoreError> {
    fs::try_exists(path)
        .await
        .map_err(|err| StoreError::io(path, err))
}

async fn blocking<T, F>(path: &Path, work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StoreError::io(path, std::io::Error::other(err)))?
}

/// Removes temp files left behind by writers that died mid-publish. Fresh
/// ones may belong to a live writer and are kept.
async fn sweep_stale_temps(root: &Path) -> Result<(), StoreError> {
    let unreachable = |source| StoreError::Unreachable {
        path: root.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(root).await.map_err(unreachable)?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await.map_err(unreachable)? {
        if !entry.file_name().to_string_lossy().contains(TEMP_MARKER) {
            continue;
        }
        let age = entry
            .metadata()
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| modified.elapsed().ok());
        if age.is_none_or(|age| age < STALE_TEMP_AGE) {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(err) => warn!(file = %entry.path().display(), error = %err, "cannot remove stale temp file"),
        }
    }
    if removed > 0 {
        info!(removed, "removed stale temp files");
    }
    Ok(())
}

fn encode<T: serde::Serialize>(path: &Path, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|err| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    fn id(raw: &str) -> MessageId {
        MessageId::new(raw).unwrap()
    }

    fn meta(raw: &str, day: u32, hour: u32) -> Metadata {
        let mut m = Metadata::new(id(raw), Utc.with_ymd_and_hms(2026, 1, day, hour, 0, 0).unwrap());
        m.subject = Some(format!("subject {raw}"));
        m
    }

    fn payload(text: &str) -> Payload {
        Payload {
            body_text: text.to_string(),
            ..Payload::default()
        }
    }

    async fn open(dir: &Path) -> EmailStore {
        EmailStore::open(StoreConfig::new(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn create_writes_metadata_unit_under_sortable_key() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        let record = store.create(meta("msg_123", 12, 10)).await.unwrap();

        assert_eq!(record.key.to_string(), "20260112-100000_msg_123");
        assert!(dir.path().join("20260112-100000_msg_123.meta").exists());
        assert!(!dir.path().join("20260112-100000_msg_123.body").exists());
        assert_eq!(record.content, Some(ContentState::Pending));
    }

    #[tokio::test]
    async fn create_refuses_known_ids() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create(meta("a", 1, 0)).await.unwrap();

        let same_key = store.create(meta("a", 1, 0)).await;
        assert!(matches!(same_key, Err(StoreError::AlreadyExists(_))));

        let other_time = store.create(meta("a", 2, 0)).await;
        assert!(matches!(other_time, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn create_is_exclusive_across_store_handles() {
        let dir = tempdir().unwrap();
        for round in 0..50 {
            let mut tasks = Vec::new();
            for _ in 0..8 {
                let store = open(dir.path()).await;
                let raw = format!("race{round}");
                tasks.push(tokio::spawn(async move { store.create(meta(&raw, 3, 3)).await }));
            }
            let mut created = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(_) => created += 1,
                    Err(StoreError::AlreadyExists(_)) => {}
                    Err(other) => panic!("round {round}: unexpected error: {other}"),
                }
            }
            assert_eq!(created, 1, "round {round}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_id_under_different_timestamps_is_created_once() {
        let dir = tempdir().unwrap();
        for round in 0..50 {
            let raw = format!("dup{round}");
            let early = open(dir.path()).await;
            let late = open(dir.path()).await;
            let (a, b) = tokio::join!(
                tokio::spawn({
                    let raw = raw.clone();
                    async move { early.create(meta(&raw, 1, 0)).await }
                }),
                tokio::spawn({
                    let raw = raw.clone();
                    async move { late.create(meta(&raw, 2, 0)).await }
                }),
            );
            let outcomes = [a.unwrap(), b.unwrap()];
            assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
            assert!(
                outcomes
                    .iter()
                    .all(|r| r.is_ok() || matches!(r, Err(StoreError::AlreadyExists(_)))),
                "round {round}"
            );

            let suffix = format!("_{raw}.meta");
            let units = std::fs::read_dir(dir.path())
                .unwrap()
                .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(&suffix))
                .count();
            assert_eq!(units, 1, "round {round}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attach_publishes_one_whole_payload() {
        let dir = tempdir().unwrap();
        let setup = open(dir.path()).await;
        setup.create(meta("big", 1, 0)).await.unwrap();
        let a = vec![b'a'; 1 << 20];
        let b = vec![b'b'; 1 << 20];

        for round in 0..20 {
            let first = open(dir.path()).await;
            let second = open(dir.path()).await;
            let (pa, pb) = (a.clone(), b.clone());
            let (ra, rb) = tokio::join!(
                tokio::spawn(async move { first.attach(&id("big"), "x", &pa).await }),
                tokio::spawn(async move { second.attach(&id("big"), "x", &pb).await }),
            );
            ra.unwrap().unwrap();
            rb.unwrap().unwrap();

            let stored = setup.get_sidecar(&id("big"), "x").await.unwrap().unwrap();
            assert!(stored == a || stored == b, "round {round}: torn sidecar");
        }

        let leftovers: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(TEMP_MARKER))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }

    #[tokio::test]
    async fn open_removes_only_stale_temp_files() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join(".tmp-abandoned");
        let fresh = dir.path().join(".tmp-inflight");
        std::fs::write(&stale, b"partial").unwrap();
        std::fs::write(&fresh, b"partial").unwrap();
        let two_hours_ago = std::time::SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(two_hours_ago)
            .unwrap();

        open(dir.path()).await;

        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn get_reports_pending_before_population() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create(meta("p", 1, 0)).await.unwrap();

        let record = store.get(&id("p"), true).await.unwrap();
        assert_eq!(record.content, Some(ContentState::Pending));
        assert_eq!(record.metadata.subject.as_deref(), Some("subject p"));

        let record = store.get(&id("p"), false).await.unwrap();
        assert_eq!(record.content, None);
    }

    #[tokio::test]
    async fn populate_is_idempotent_unless_overwrite_requested() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create(meta("x", 1, 0)).await.unwrap();

        let first = store.populate_content(&id("x"), &payload("v1"), false).await.unwrap();
        let second = store.populate_content(&id("x"), &payload("v2"), false).await.unwrap();
        assert_eq!(first, PopulateOutcome::Populated);
        assert_eq!(second, PopulateOutcome::AlreadyPopulated);

        let record = store.get(&id("x"), true).await.unwrap();
        assert_eq!(record.content, Some(ContentState::Populated(payload("v1"))));

        let third = store.populate_content(&id("x"), &payload("v3"), true).await.unwrap();
        assert_eq!(third, PopulateOutcome::Overwritten);
        let record = store.get(&id("x"), true).await.unwrap();
        assert_eq!(record.content, Some(ContentState::Populated(payload("v3"))));
    }

    #[tokio::test]
    async fn operations_on_unknown_ids_fail_with_not_found() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        let ghost = id("ghost");

        assert!(matches!(
            store.populate_content(&ghost, &payload("x"), false).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.get(&ghost, true).await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.attach(&ghost, "note.txt", b"x").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_is_chronological_regardless_of_write_order() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create(meta("c", 3, 0)).await.unwrap();
        store.create(meta("a", 1, 0)).await.unwrap();
        store.create(meta("b2", 2, 0)).await.unwrap();
        store.create(meta("b1", 2, 0)).await.unwrap();

        let listed: Vec<Metadata> = store
            .list(&ListQuery::default())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b1", "b2", "c"]);

        let newest = store
            .list_keys(&ListQuery {
                newest_first: true,
                limit: Some(2),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = newest.iter().map(|k| k.id().as_str()).collect();
        assert_eq!(ids, ["c", "b2"]);
    }

    #[tokio::test]
    async fn list_filters_by_range_state_and_missing_sidecar() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        for (raw, day) in [("a", 1), ("b", 2), ("c", 3)] {
            store.create(meta(raw, day, 0)).await.unwrap();
        }
        store.populate_content(&id("b"), &payload("b"), false).await.unwrap();
        store.attach(&id("c"), "processed.json", b"{}").await.unwrap();

        let ranged = store
            .list_keys(&ListQuery {
                since: Some(Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap()),
                until: Some(Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap()),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].id().as_str(), "b");

        let pending = store
            .list_keys(&ListQuery {
                state: Some(StateKind::Pending),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = pending.iter().map(|k| k.id().as_str()).collect();
        assert_eq!(ids, ["a", "c"]);

        let unprocessed = store
            .list_keys(&ListQuery {
                sidecar_missing: Some("processed.json".into()),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = unprocessed.iter().map(|k| k.id().as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn attach_overwrites_sidecar_without_touching_record() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create(meta("s", 12, 15)).await.unwrap();
        let before = store.get(&id("s"), true).await.unwrap();

        store.attach(&id("s"), "processed.json", b"{\"v\":1}").await.unwrap();
        store.attach(&id("s"), "processed.json", b"{\"v\":2}").await.unwrap();

        assert!(dir.path().join("20260112-150000_s.processed.json").exists());
        assert_eq!(
            store.get_sidecar(&id("s"), "processed.json").await.unwrap(),
            Some(b"{\"v\":2}".to_vec())
        );
        assert!(store.has_sidecar(&id("s"), "processed.json").await.unwrap());
        assert_eq!(store.get_sidecar(&id("s"), "other.txt").await.unwrap(), None);
        assert_eq!(store.get(&id("s"), true).await.unwrap(), before);
    }

    #[tokio::test]
    async fn reserved_sidecar_names_are_rejected() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create(meta("r", 1, 0)).await.unwrap();
        for bad in ["", "meta", "body", "x.meta", "x.body", "../x", "a/b", ".hidden", "x.tmp-1"] {
            assert!(
                matches!(
                    store.attach(&id("r"), bad, b"x").await,
                    Err(StoreError::InvalidSidecarName(_))
                ),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn scans_ignore_temp_and_foreign_files() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create(meta("real", 1, 0)).await.unwrap();
        std::fs::write(dir.path().join("20260101-000000_half.meta.tmp-1-0"), b"{").unwrap();
        std::fs::write(dir.path().join("notes.meta"), b"hello").unwrap();

        let ids = store.known_ids().await.unwrap();
        assert_eq!(ids, HashSet::from([id("real")]));
    }

    #[tokio::test]
    async fn stats_count_pending_and_populated() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create(meta("a", 1, 0)).await.unwrap();
        store.create(meta("b", 5, 0)).await.unwrap();
        store.populate_content(&id("a"), &payload("a"), false).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.total, stats.populated, stats.pending), (2, 1, 1));
        assert_eq!(stats.earliest, Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        assert_eq!(stats.latest, Some(Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn corrupt_metadata_is_reported_not_panicked() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).await;
        std::fs::write(dir.path().join("20260101-000000_bad.meta"), b"not json").unwrap();

        assert!(matches!(
            store.get(&id("bad"), false).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn records_created_by_another_handle_are_found() {
        let dir = tempdir().unwrap();
        let first = open(dir.path()).await;
        let second = open(dir.path()).await;
        assert!(!second.exists(&id("late")).await.unwrap());

        first.create(meta("late", 1, 0)).await.unwrap();
        assert!(second.exists(&id("late")).await.unwrap());
        second.populate_content(&id("late"), &payload("x"), false).await.unwrap();
        assert_eq!(first.content_state_of(&id("late")).await.unwrap(), StateKind::Populated);
    }
}
