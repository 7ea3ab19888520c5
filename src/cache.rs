//! Disk-backed key-value caches for geocodes and route legs.
//!
//! Each store is an append-only JSON-lines log: one `{"key", "value",
//! "inserted_at"}` record per line, the last record for a key wins. The log is
//! replayed into memory on open and every `put` is appended and flushed before
//! returning, so a crash loses at most the record being written. A torn final
//! line is skipped on the next open.
//!
//! When the file cannot be opened or written, the store keeps serving and
//! accepting entries from memory for the rest of the run and remembers the
//! failure so callers can report it.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PlannerConfig;
use crate::error::CacheIoError;
use crate::geo::Coordinate;
use crate::rate_limit::lock;
use crate::traits::RouteLeg;

/// A cached value with the unix time (seconds) it was first stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: u64,
}

#[derive(Serialize)]
struct RecordRef<'a, V> {
    key: &'a str,
    value: &'a V,
    inserted_at: u64,
}

#[derive(Deserialize)]
struct Record<V> {
    key: String,
    value: V,
    inserted_at: u64,
}

struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    writer: Option<BufWriter<File>>,
    failure: Option<String>,
}

pub struct PersistentCache<V> {
    name: &'static str,
    path: Option<PathBuf>,
    state: Mutex<State<V>>,
}

impl<V> std::fmt::Debug for PersistentCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<V> PersistentCache<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Opens (or creates) the log at `path` and replays it into memory.
    pub fn open(name: &'static str, path: impl Into<PathBuf>) -> Result<Self, CacheIoError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CacheIoError::io(parent, e))?;
        }

        let (entries, torn_tail) = load_log(name, &path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CacheIoError::io(&path, e))?;
        if torn_tail {
            // Terminate the partial record so the next append starts clean.
            file.write_all(b"\n").map_err(|e| CacheIoError::io(&path, e))?;
        }

        info!(cache = name, path = %path.display(), entries = entries.len(), "cache store opened");

        Ok(Self {
            name,
            path: Some(path),
            state: Mutex::new(State {
                entries,
                writer: Some(BufWriter::new(file)),
                failure: None,
            }),
        })
    }

    /// Like [`open`](Self::open), but degrades to a memory-only store on
    /// failure instead of returning the error.
    pub fn open_or_in_memory(name: &'static str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::open(name, &path) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(cache = name, error = %err, "cache store unavailable, continuing in memory");
                let cache = Self::in_memory(name);
                lock(&cache.state).failure = Some(err.to_string());
                Self {
                    path: Some(path),
                    ..cache
                }
            }
        }
    }

    pub fn in_memory(name: &'static str) -> Self {
        Self {
            name,
            path: None,
            state: Mutex::new(State {
                entries: HashMap::new(),
                writer: None,
                failure: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, key: &str) -> Option<V> {
        lock(&self.state).entries.get(key).map(|e| e.value.clone())
    }

    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        lock(&self.state).entries.get(key).cloned()
    }

    /// Stores `value` under `key` and appends it to the log.
    ///
    /// The value is kept in memory even when the append fails; the store
    /// then stops writing to disk for the rest of its lifetime.
    pub fn put(&self, key: &str, value: V) -> Result<(), CacheIoError> {
        let inserted_at = unix_now();
        let mut state = lock(&self.state);

        let result = match state.writer.as_mut() {
            Some(writer) => append_record(writer, key, &value, inserted_at),
            None => Ok(()),
        };

        state
            .entries
            .insert(key.to_string(), CacheEntry { value, inserted_at });

        if let Err(err) = &result {
            self.degrade(&mut state, err);
        }
        result.map_err(|err| self.io_error(err))
    }

    /// Flushes buffered records and syncs the log file.
    pub fn flush(&self) -> Result<(), CacheIoError> {
        let mut state = lock(&self.state);
        let Some(writer) = state.writer.as_mut() else {
            return Ok(());
        };

        let result = writer
            .flush()
            .and_then(|()| writer.get_ref().sync_data());
        if let Err(err) = result {
            let err = self.io_error(err);
            self.degrade(&mut state, &err);
            return Err(err);
        }
        Ok(())
    }

    /// Rewrites the log with exactly one record per key.
    ///
    /// Writes to a temporary file and renames it over the log, so an
    /// interrupted compaction leaves the old log intact.
    pub fn compact(&self) -> Result<(), CacheIoError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let mut state = lock(&self.state);
        if state.writer.is_none() {
            return Ok(());
        }

        let tmp_path = path.with_extension("jsonl.tmp");
        let result = write_snapshot(&tmp_path, &state.entries).and_then(|()| {
            fs::rename(&tmp_path, path).map_err(|e| CacheIoError::io(path, e))?;
            OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(|e| CacheIoError::io(path, e))
        });

        match result {
            Ok(file) => {
                state.writer = Some(BufWriter::new(file));
                debug!(cache = self.name, entries = state.entries.len(), "cache log compacted");
                Ok(())
            }
            Err(err) => {
                self.degrade(&mut state, &err);
                Err(err)
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether writes still reach disk.
    pub fn is_persistent(&self) -> bool {
        lock(&self.state).writer.is_some()
    }

    /// The I/O failure that switched this store to memory-only, if any.
    pub fn failure(&self) -> Option<String> {
        lock(&self.state).failure.clone()
    }

    fn degrade(&self, state: &mut State<V>, err: &dyn std::fmt::Display) {
        warn!(cache = self.name, error = %err, "cache write failed, continuing in memory");
        state.writer = None;
        state.failure.get_or_insert_with(|| err.to_string());
    }

    fn io_error(&self, err: impl Into<AppendError>) -> CacheIoError {
        match err.into() {
            AppendError::Io(source) => CacheIoError::Io {
                path: self.path.clone().unwrap_or_default(),
                source,
            },
            AppendError::Cache(err) => err,
        }
    }
}

enum AppendError {
    Io(std::io::Error),
    Cache(CacheIoError),
}

impl From<std::io::Error> for AppendError {
    fn from(err: std::io::Error) -> Self {
        AppendError::Io(err)
    }
}

impl From<CacheIoError> for AppendError {
    fn from(err: CacheIoError) -> Self {
        AppendError::Cache(err)
    }
}

impl std::fmt::Display for AppendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppendError::Io(err) => err.fmt(f),
            AppendError::Cache(err) => err.fmt(f),
        }
    }
}

fn append_record<V: Serialize>(
    writer: &mut BufWriter<File>,
    key: &str,
    value: &V,
    inserted_at: u64,
) -> Result<(), AppendError> {
    let record = RecordRef {
        key,
        value,
        inserted_at,
    };
    let mut line = serde_json::to_vec(&record).map_err(CacheIoError::from)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

fn write_snapshot<V: Serialize>(
    path: &Path,
    entries: &HashMap<String, CacheEntry<V>>,
) -> Result<(), CacheIoError> {
    let file = File::create(path).map_err(|e| CacheIoError::io(path, e))?;
    let mut writer = BufWriter::new(file);

    let mut keys: Vec<&String> = entries.keys().collect();
    keys.sort();
    for key in keys {
        let entry = &entries[key];
        let record = RecordRef {
            key,
            value: &entry.value,
            inserted_at: entry.inserted_at,
        };
        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n").map_err(|e| CacheIoError::io(path, e))?;
    }

    writer.flush().map_err(|e| CacheIoError::io(path, e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| CacheIoError::io(path, e))
}

/// Replays the log. Returns the entries and whether the file ends in a
/// partial record.
fn load_log<V: DeserializeOwned>(
    name: &str,
    path: &Path,
) -> Result<(HashMap<String, CacheEntry<V>>, bool), CacheIoError> {
    let mut entries = HashMap::new();
    let mut raw = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut raw)
                .map_err(|e| CacheIoError::io(path, e))?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((entries, false)),
        Err(err) => return Err(CacheIoError::io(path, err)),
    }

    let torn_tail = raw.last().is_some_and(|&b| b != b'\n');
    let mut skipped = 0usize;
    for line in raw.split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Record<V>>(line) {
            Ok(record) => {
                entries.insert(
                    record.key,
                    CacheEntry {
                        value: record.value,
                        inserted_at: record.inserted_at,
                    },
                );
            }
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(cache = name, path = %path.display(), skipped, "skipped unreadable cache records");
    }

    Ok((entries, torn_tail))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The two cache namespaces shared by every optimization request.
#[derive(Debug, Clone)]
pub struct CacheStores {
    pub geocode: Arc<PersistentCache<Coordinate>>,
    pub routes: Arc<PersistentCache<RouteLeg>>,
}

impl CacheStores {
    /// Opens both stores under the configured directory, degrading each to
    /// memory independently if its file is unusable.
    pub fn open(config: &PlannerConfig) -> Self {
        Self {
            geocode: Arc::new(PersistentCache::open_or_in_memory(
                "geocode",
                config.geocode_cache_path(),
            )),
            routes: Arc::new(PersistentCache::open_or_in_memory(
                "routes",
                config.route_cache_path(),
            )),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            geocode: Arc::new(PersistentCache::in_memory("geocode")),
            routes: Arc::new(PersistentCache::in_memory("routes")),
        }
    }

    /// Flushes both stores, returning the first error.
    pub fn flush(&self) -> Result<(), CacheIoError> {
        let geocode = self.geocode.flush();
        let routes = self.routes.flush();
        geocode.and(routes)
    }

    /// Store-level failures, as `(store name, error)` pairs.
    pub fn failures(&self) -> Vec<(&'static str, String)> {
        [
            (self.geocode.name(), self.geocode.failure()),
            (self.routes.name(), self.routes.failure()),
        ]
        .into_iter()
        .filter_map(|(name, failure)| failure.map(|f| (name, f)))
        .collect()
    }
}
