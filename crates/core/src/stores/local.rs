//! File-backed [`VectorStore`]. Each collection is a directory under the
//! persist root holding a snapshot (`collection.json`) and an append-only
//! log of the writes made since that snapshot. A write appends and syncs a
//! single log line; the log is folded into a fresh snapshot once it grows
//! larger than the snapshot itself.

use crate::store::{
    rank, validate_collection_name, CollectionInfo, DistanceMetric, DocumentRecord, ScoredEntry,
};
use crate::traits::VectorStore;
use crate::{IndexEntry, SearchFilter, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{Builder, NamedTempFile};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const FORMAT_VERSION: u32 = 2;
const SNAPSHOT_FILE: &str = "collection.json";
/// Logs below this size are never compacted.
const COMPACT_MIN_BYTES: u64 = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    sequence: u64,
    entry: IndexEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionSnapshot {
    format_version: u32,
    name: String,
    dimension: usize,
    metric: DistanceMetric,
    created_at: DateTime<Utc>,
    /// Selects the log file that continues this snapshot.
    generation: u64,
    next_sequence: u64,
    documents: BTreeMap<String, DocumentRecord>,
    entries: BTreeMap<String, StoredEntry>,
}

/// One logged write. Replaying the log over its snapshot reproduces the
/// collection exactly, sequences included.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Change {
    Upsert {
        entries: Vec<IndexEntry>,
    },
    Delete {
        ids: Vec<String>,
    },
    Replace {
        record: DocumentRecord,
        entries: Vec<IndexEntry>,
    },
    Remove {
        document_id: String,
    },
}

impl CollectionSnapshot {
    fn new(name: &str, dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            name: name.to_string(),
            dimension,
            metric,
            created_at: Utc::now(),
            generation: 0,
            next_sequence: 0,
            documents: BTreeMap::new(),
            entries: BTreeMap::new(),
        }
    }

    fn info(&self) -> CollectionInfo {
        CollectionInfo {
            name: self.name.clone(),
            dimension: self.dimension,
            metric: self.metric,
            entry_count: self.entries.len(),
            document_count: self.documents.len(),
            created_at: self.created_at,
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<(), StoreError> {
        if actual != self.dimension {
            return Err(StoreError::DimensionMismatch {
                collection: self.name.clone(),
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }

    fn validate(&self, change: &Change) -> Result<(), StoreError> {
        match change {
            Change::Upsert { entries } => entries
                .iter()
                .try_for_each(|entry| self.check_dimension(entry.embedding.len())),
            Change::Replace { record, entries } => {
                for entry in entries {
                    self.check_dimension(entry.embedding.len())?;
                    if entry.document_id() != record.document_id {
                        return Err(StoreError::Unavailable(format!(
                            "entry {} belongs to document {}, not {}",
                            entry.id(),
                            entry.document_id(),
                            record.document_id
                        )));
                    }
                }
                Ok(())
            }
            Change::Delete { .. } | Change::Remove { .. } => Ok(()),
        }
    }

    /// Infallible once `validate` passed. Returns the number of entries removed.
    fn apply(&mut self, change: Change) -> usize {
        match change {
            Change::Upsert { entries } => {
                for entry in entries {
                    let record = self
                        .documents
                        .entry(entry.document_id().to_string())
                        .or_insert_with(|| DocumentRecord {
                            document_id: entry.document_id().to_string(),
                            source_path: entry.source_path.clone(),
                            content_hash: entry.content_hash.clone(),
                            chunk_ids: Vec::new(),
                            indexed_at: entry.indexed_at,
                        });
                    if !record.chunk_ids.iter().any(|id| id == entry.id()) {
                        record.chunk_ids.push(entry.id().to_string());
                    }
                    self.insert(entry, None);
                }
                0
            }
            Change::Delete { ids } => {
                let removed = ids
                    .iter()
                    .filter(|id| self.entries.remove(id.as_str()).is_some())
                    .count();
                self.documents.retain(|_, record| {
                    let before = record.chunk_ids.len();
                    record.chunk_ids.retain(|id| !ids.contains(id));
                    before == 0 || !record.chunk_ids.is_empty()
                });
                removed
            }
            Change::Replace {
                mut record,
                entries,
            } => {
                let previous = self.remove_document_entries(&record.document_id);
                record.chunk_ids = entries.iter().map(|entry| entry.id().to_string()).collect();
                for entry in entries {
                    let sequence = previous.get(entry.id()).copied();
                    self.insert(entry, sequence);
                }
                self.documents.insert(record.document_id.clone(), record);
                0
            }
            Change::Remove { document_id } => self.remove_document_entries(&document_id).len(),
        }
    }

    /// Existing ids keep their original ingestion sequence.
    fn insert(&mut self, entry: IndexEntry, previous_sequence: Option<u64>) {
        let sequence = match previous_sequence.or_else(|| {
            self.entries
                .get(entry.id())
                .map(|stored| stored.sequence)
        }) {
            Some(sequence) => sequence,
            None => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                sequence
            }
        };
        self.entries
            .insert(entry.id().to_string(), StoredEntry { sequence, entry });
    }

    fn remove_document_entries(&mut self, document_id: &str) -> HashMap<String, u64> {
        let mut removed = HashMap::new();
        if let Some(record) = self.documents.remove(document_id) {
            for id in record.chunk_ids {
                if let Some(stored) = self.entries.remove(&id) {
                    removed.insert(id, stored.sequence);
                }
            }
        }

        let strays = self
            .entries
            .iter()
            .filter(|(_, stored)| stored.entry.document_id() == document_id)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in strays {
            if let Some(stored) = self.entries.remove(&id) {
                removed.insert(id, stored.sequence);
            }
        }

        removed
    }
}

/// A loaded collection plus the on-disk sizes that drive compaction.
struct Collection {
    snapshot: CollectionSnapshot,
    snapshot_bytes: u64,
    log_bytes: u64,
}

type Collections = HashMap<String, Collection>;

fn log_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("log-{generation}.jsonl"))
}

fn write_snapshot(dir: &Path, snapshot: &CollectionSnapshot) -> Result<u64, StoreError> {
    let bytes = serde_json::to_vec(snapshot)?;
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&bytes)?;
    file.as_file().sync_all()?;
    file.persist(dir.join(SNAPSHOT_FILE))
        .map_err(|error| StoreError::Unavailable(error.to_string()))?;
    Ok(bytes.len() as u64)
}

fn load_collection(dir: &Path, name: &str) -> Result<Option<Collection>, StoreError> {
    let path = dir.join(SNAPSHOT_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(StoreError::Unavailable(format!(
                "cannot read {}: {error}",
                path.display()
            )))
        }
    };

    let mut snapshot = match serde_json::from_slice::<CollectionSnapshot>(&bytes) {
        Ok(snapshot) if snapshot.format_version == FORMAT_VERSION && snapshot.name == name => {
            snapshot
        }
        Ok(snapshot) => {
            warn!(
                collection = name,
                format_version = snapshot.format_version,
                "unrecognised collection file, treating collection as empty"
            );
            return Ok(None);
        }
        Err(error) => {
            warn!(
                collection = name,
                path = %path.display(),
                error = %error,
                "corrupt collection file, treating collection as empty"
            );
            return Ok(None);
        }
    };

    let log_bytes = replay_log(&log_path(dir, snapshot.generation), &mut snapshot)?;
    debug!(
        collection = name,
        entries = snapshot.entries.len(),
        log_bytes,
        "loaded collection"
    );
    Ok(Some(Collection {
        snapshot,
        snapshot_bytes: bytes.len() as u64,
        log_bytes,
    }))
}

/// Applies every complete record in order. Whatever follows the first torn
/// or unreadable line is cut off so the next append starts on a clean line.
fn replay_log(path: &Path, snapshot: &mut CollectionSnapshot) -> Result<u64, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(0),
        Err(error) => {
            return Err(StoreError::Unavailable(format!(
                "cannot read {}: {error}",
                path.display()
            )))
        }
    };

    let mut valid = 0;
    for line in bytes.split_inclusive(|byte| *byte == b'\n') {
        if line.last() != Some(&b'\n') {
            break;
        }
        match serde_json::from_slice::<Change>(line) {
            Ok(change) => {
                snapshot.apply(change);
                valid += line.len();
            }
            Err(error) => {
                warn!(path = %path.display(), error = %error, "unreadable log record");
                break;
            }
        }
    }

    if valid < bytes.len() {
        warn!(
            path = %path.display(),
            discarded = bytes.len() - valid,
            "discarding incomplete log tail"
        );
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(valid as u64)?;
    }
    Ok(valid as u64)
}

fn append(dir: &Path, collection: &mut Collection, change: &Change) -> Result<(), StoreError> {
    let mut line = serde_json::to_vec(change)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(dir, collection.snapshot.generation))?;
    file.write_all(&line)?;
    file.sync_data()?;
    collection.log_bytes += line.len() as u64;
    Ok(())
}

/// Writes the current state as the next generation's snapshot and retires
/// the old log. Until the snapshot is in place the old pair stays valid.
fn compact(dir: &Path, collection: &mut Collection) -> Result<(), StoreError> {
    let retired = log_path(dir, collection.snapshot.generation);
    collection.snapshot.generation += 1;
    match write_snapshot(dir, &collection.snapshot) {
        Ok(bytes) => {
            collection.snapshot_bytes = bytes;
            collection.log_bytes = 0;
        }
        Err(error) => {
            collection.snapshot.generation -= 1;
            return Err(error);
        }
    }

    match fs::remove_file(&retired) {
        Err(error) if error.kind() != ErrorKind::NotFound => {
            warn!(path = %retired.display(), error = %error, "cannot remove retired log");
        }
        _ => {}
    }
    debug!(
        collection = %collection.snapshot.name,
        generation = collection.snapshot.generation,
        "compacted collection"
    );
    Ok(())
}

/// Moves `dir` aside before removing it, so a crash never leaves a
/// half-deleted collection where a live one is expected.
fn discard_dir(root: &Path, dir: &Path) -> Result<bool, StoreError> {
    match fs::symlink_metadata(dir) {
        Ok(_) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(false),
        Err(error) => return Err(error.into()),
    }
    let trash = Builder::new().prefix(".deleted-").tempdir_in(root)?;
    fs::rename(dir, trash.path().join("collection"))?;
    trash.close()?;
    Ok(true)
}

fn create_collection(
    root: &Path,
    snapshot: CollectionSnapshot,
) -> Result<Collection, StoreError> {
    let dir = root.join(&snapshot.name);
    discard_dir(root, &dir)?;
    fs::create_dir_all(&dir)?;
    let snapshot_bytes = write_snapshot(&dir, &snapshot)?;
    Ok(Collection {
        snapshot,
        snapshot_bytes,
        log_bytes: 0,
    })
}

fn loaded<'a>(
    root: &Path,
    collections: &'a mut Collections,
    name: &str,
) -> Result<Option<&'a mut Collection>, StoreError> {
    if !collections.contains_key(name) {
        if let Some(collection) = load_collection(&root.join(name), name)? {
            collections.insert(name.to_string(), collection);
        }
    }
    Ok(collections.get_mut(name))
}

pub struct LocalVectorStore {
    root: PathBuf,
    metric: DistanceMetric,
    collections: Arc<RwLock<Collections>>,
}

impl LocalVectorStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|error| {
            StoreError::Unavailable(format!("cannot create {}: {error}", root.display()))
        })?;

        Ok(Self {
            root,
            metric: DistanceMetric::default(),
            collections: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Metric for collections created from now on; existing collections keep
    /// the metric they were created with.
    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `work` on the blocking pool under the write lock. The guard moves
    /// into the task, so the files and the cache stay in step even when the
    /// caller stops waiting.
    async fn exclusive<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &mut Collections) -> Result<T, StoreError> + Send + 'static,
    {
        let mut collections = self.collections.clone().write_owned().await;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || work(&root, &mut *collections))
            .await
            .map_err(|error| StoreError::Unavailable(format!("store task failed: {error}")))?
    }

    async fn read<T>(
        &self,
        name: &str,
        view: impl FnOnce(Option<&CollectionSnapshot>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        validate_collection_name(name)?;
        {
            let collections = self.collections.read().await;
            if let Some(collection) = collections.get(name) {
                return view(Some(&collection.snapshot));
            }
        }

        let owned = name.to_string();
        self.exclusive(move |root, collections| loaded(root, collections, &owned).map(|_| ()))
            .await?;
        let collections = self.collections.read().await;
        view(collections.get(name).map(|collection| &collection.snapshot))
    }

    /// Logs `change`, then applies it to the cached collection.
    async fn mutate(&self, name: &str, change: Change) -> Result<usize, StoreError> {
        validate_collection_name(name)?;
        let name = name.to_string();
        self.exclusive(move |root, collections| {
            let dir = root.join(&name);
            let collection = loaded(root, collections, &name)?
                .ok_or_else(|| StoreError::CollectionNotFound(name.clone()))?;
            collection.snapshot.validate(&change)?;

            if let Err(error) = append(&dir, collection, &change) {
                // A partial line may be on disk; reloading cuts it off.
                collections.remove(&name);
                return Err(error);
            }
            let removed = collection.snapshot.apply(change);

            if collection.log_bytes > COMPACT_MIN_BYTES.max(collection.snapshot_bytes) {
                if let Err(error) = compact(&dir, collection) {
                    warn!(collection = %name, error = %error, "compaction failed, keeping log");
                }
            }
            Ok(removed)
        })
        .await
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn open_collection(
        &self,
        name: &str,
        dimension: usize,
    ) -> Result<CollectionInfo, StoreError> {
        validate_collection_name(name)?;
        let name = name.to_string();
        let metric = self.metric;
        self.exclusive(move |root, collections| {
            if let Some(collection) = loaded(root, collections, &name)? {
                collection.snapshot.check_dimension(dimension)?;
                return Ok(collection.snapshot.info());
            }

            let collection =
                create_collection(root, CollectionSnapshot::new(&name, dimension, metric))?;
            debug!(collection = %name, dimension, "created collection");
            let info = collection.snapshot.info();
            collections.insert(name, collection);
            Ok(info)
        })
        .await
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError> {
        self.read(name, |snapshot| Ok(snapshot.map(CollectionSnapshot::info)))
            .await
    }

    async fn delete_collection(&self, name: &str) -> Result<bool, StoreError> {
        validate_collection_name(name)?;
        let name = name.to_string();
        self.exclusive(move |root, collections| {
            let cached = collections.remove(&name).is_some();
            let removed = discard_dir(root, &root.join(&name))?;
            Ok(removed || cached)
        })
        .await
    }

    async fn upsert(&self, collection: &str, entries: &[IndexEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let change = Change::Upsert {
            entries: entries.to_vec(),
        };
        self.mutate(collection, change).await.map(|_| ())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.mutate(collection, Change::Delete { ids: ids.to_vec() })
            .await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<IndexEntry>, StoreError> {
        self.read(collection, |snapshot| {
            Ok(snapshot
                .and_then(|snapshot| snapshot.entries.get(id))
                .map(|stored| stored.entry.clone()))
        })
        .await
    }

    async fn document_record(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        self.read(collection, |snapshot| {
            Ok(snapshot.and_then(|snapshot| snapshot.documents.get(document_id).cloned()))
        })
        .await
    }

    async fn document_ids(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        self.read(collection, |snapshot| {
            Ok(snapshot
                .map(|snapshot| snapshot.documents.keys().cloned().collect())
                .unwrap_or_default())
        })
        .await
    }

    async fn replace_document(
        &self,
        collection: &str,
        record: DocumentRecord,
        entries: &[IndexEntry],
    ) -> Result<(), StoreError> {
        let change = Change::Replace {
            record,
            entries: entries.to_vec(),
        };
        self.mutate(collection, change).await.map(|_| ())
    }

    async fn remove_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<usize, StoreError> {
        let change = Change::Remove {
            document_id: document_id.to_string(),
        };
        self.mutate(collection, change).await
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        self.read(collection, |snapshot| {
            let snapshot = match snapshot {
                Some(snapshot) if k > 0 => snapshot,
                _ => return Ok(Vec::new()),
            };
            snapshot.check_dimension(vector.len())?;

            let mut hits = snapshot
                .entries
                .values()
                .filter(|stored| filter.map_or(true, |filter| filter.matches(&stored.entry)))
                .map(|stored| ScoredEntry {
                    score: snapshot.metric.score(&stored.entry.embedding, vector),
                    sequence: stored.sequence,
                    entry: stored.entry.clone(),
                })
                .collect::<Vec<_>>();

            rank(&mut hits);
            hits.truncate(k);
            Ok(hits)
        })
        .await
    }
}
