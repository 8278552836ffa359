//! Local library: watch history and favorites
//!
//! The playback core only needs a handful of operations from the local store,
//! captured by [`LibraryStore`]. `JsonLibrary` keeps everything in one JSON
//! file next to the config, the same way favorites have always been stored.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::errors::StoreError;
use crate::request::ContentKind;

/// Watch progress for one item, keyed by content id and kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRecord {
    pub content_id: i64,
    pub kind: ContentKind,
    #[serde(default)]
    pub category_id: String,
    /// Where to resume; always zero once finished
    pub last_position_ms: u64,
    /// Total seconds watched across sessions
    pub watched_seconds: u64,
    pub max_duration_ms: u64,
    pub finished: bool,
    pub updated_at: DateTime<Utc>,
}

/// Favorite item (persisted to JSON)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    pub content_id: i64,
    pub kind: ContentKind,
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub category_id: String,
}

pub trait LibraryStore: Send + Sync {
    fn watch_record(&self, content_id: i64, kind: ContentKind) -> Result<Option<WatchRecord>, StoreError>;
    /// Insert or replace the record with the same content id and kind
    fn upsert_watch_record(&self, record: &WatchRecord) -> Result<(), StoreError>;
    fn is_favorite(&self, content_id: i64, kind: ContentKind) -> Result<bool, StoreError>;
    fn add_favorite(&self, favorite: Favorite) -> Result<(), StoreError>;
    fn remove_favorite(&self, content_id: i64, kind: ContentKind) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryData {
    #[serde(default)]
    watch_records: Vec<WatchRecord>,
    #[serde(default)]
    favorites: Vec<Favorite>,
}

impl LibraryData {
    fn record(&self, content_id: i64, kind: ContentKind) -> Option<&WatchRecord> {
        self.watch_records.iter().find(|r| r.content_id == content_id && r.kind == kind)
    }

    fn upsert(&mut self, record: &WatchRecord) {
        match self
            .watch_records
            .iter_mut()
            .find(|r| r.content_id == record.content_id && r.kind == record.kind)
        {
            Some(existing) => *existing = record.clone(),
            None => self.watch_records.push(record.clone()),
        }
    }

    fn is_favorite(&self, content_id: i64, kind: ContentKind) -> bool {
        self.favorites.iter().any(|f| f.content_id == content_id && f.kind == kind)
    }

    fn add_favorite(&mut self, favorite: Favorite) {
        if !self.is_favorite(favorite.content_id, favorite.kind) {
            self.favorites.push(favorite);
        }
    }

    fn remove_favorite(&mut self, content_id: i64, kind: ContentKind) {
        self.favorites.retain(|f| !(f.content_id == content_id && f.kind == kind));
    }
}

/// Library persisted as pretty JSON; every write replaces the file atomically
pub struct JsonLibrary {
    path: PathBuf,
    data: Mutex<LibraryData>,
}

impl JsonLibrary {
    pub fn default_path() -> PathBuf {
        AppConfig::config_dir().join("library.json")
    }

    /// Open the library file. A missing file is an empty library.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let data = if path.exists() {
            serde_json::from_str(&fs::read_to_string(path)?)?
        } else {
            LibraryData::default()
        };
        Ok(Self { path: path.to_path_buf(), data: Mutex::new(data) })
    }

    fn write(&self, data: &LibraryData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, change: impl FnOnce(&mut LibraryData)) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut data);
        self.write(&data)
    }
}

impl LibraryStore for JsonLibrary {
    fn watch_record(&self, content_id: i64, kind: ContentKind) -> Result<Option<WatchRecord>, StoreError> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data.record(content_id, kind).cloned())
    }

    fn upsert_watch_record(&self, record: &WatchRecord) -> Result<(), StoreError> {
        self.update(|data| data.upsert(record))
    }

    fn is_favorite(&self, content_id: i64, kind: ContentKind) -> Result<bool, StoreError> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data.is_favorite(content_id, kind))
    }

    fn add_favorite(&self, favorite: Favorite) -> Result<(), StoreError> {
        self.update(|data| data.add_favorite(favorite))
    }

    fn remove_favorite(&self, content_id: i64, kind: ContentKind) -> Result<(), StoreError> {
        self.update(|data| data.remove_favorite(content_id, kind))
    }
}

/// In-memory library that counts watch-record traffic
#[derive(Default)]
pub struct MemoryLibrary {
    data: Mutex<LibraryData>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, record: WatchRecord) -> Self {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).upsert(&record);
        self
    }

    /// Watch-record reads so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Watch-record writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl LibraryStore for MemoryLibrary {
    fn watch_record(&self, content_id: i64, kind: ContentKind) -> Result<Option<WatchRecord>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data.record(content_id, kind).cloned())
    }

    fn upsert_watch_record(&self, record: &WatchRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.data.lock().unwrap_or_else(PoisonError::into_inner).upsert(record);
        Ok(())
    }

    fn is_favorite(&self, content_id: i64, kind: ContentKind) -> Result<bool, StoreError> {
        Ok(self.data.lock().unwrap_or_else(PoisonError::into_inner).is_favorite(content_id, kind))
    }

    fn add_favorite(&self, favorite: Favorite) -> Result<(), StoreError> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).add_favorite(favorite);
        Ok(())
    }

    fn remove_favorite(&self, content_id: i64, kind: ContentKind) -> Result<(), StoreError> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).remove_favorite(content_id, kind);
        Ok(())
    }
}
