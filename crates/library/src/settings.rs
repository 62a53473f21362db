use std::collections::HashMap;
use std::sync::Arc;

use redb::{
    CommitError, Database, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

pub const PLAY_STATS_KEY: &str = "play_stats";
pub const OVERRIDES_KEY: &str = "metadata_overrides";
pub const FOLDERS_KEY: &str = "selected_folders";
pub const LIKED_SONGS_KEY: &str = "liked_songs";
pub const PLAYLISTS_KEY: &str = "playlists";
pub const FAVORITE_ARTISTS_KEY: &str = "favorite_artists";
pub const FAVORITE_ALBUMS_KEY: &str = "favorite_albums";
pub const RECENTLY_PLAYED_KEY: &str = "recently_played";
pub const RECENTLY_ADDED_KEY: &str = "recently_added";
pub const NEVER_PLAYED_KEY: &str = "never_played";
pub const TOP_ARTISTS_KEY: &str = "top_artists";

/// JSON blobs by string key. Absent or unparsable blobs read back as the
/// type's default.
#[derive(Clone)]
pub struct SettingsStore {
    db: Arc<Database>,
}

impl SettingsStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn init_tables(&self) -> Result<(), SettingsError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, SettingsError> {
        let key = key.to_string();
        self.blocking(move |db| read_raw(db, &key)).await
    }

    pub async fn set_raw(&self, key: &str, bytes: Vec<u8>) -> Result<(), SettingsError> {
        let key = key.to_string();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(SETTINGS_TABLE)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let key = key.to_string();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(SETTINGS_TABLE)?;
                let _ = table.remove(key.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SettingsError> {
        let bytes = serde_json::to_vec(value)?;
        self.set_raw(key, bytes).await
    }

    /// Never fails: a missing, unreadable or malformed blob yields
    /// `T::default()`.
    pub async fn load<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        let bytes = match self.get_raw(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return T::default(),
            Err(err) => {
                warn!("Failed to read {}: {}", key, err);
                return T::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!("Discarding malformed {} blob: {}", key, err);
                T::default()
            }
        }
    }

    /// Loads an id-keyed map where each entry is decoded on its own; a
    /// malformed entry becomes `T::default()` instead of poisoning the map.
    pub async fn load_map<T: DeserializeOwned + Default>(&self, key: &str) -> HashMap<String, T> {
        let raw: HashMap<String, serde_json::Value> = self.load(key).await;
        decode_entries(key, raw)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SettingsError>
    where
        F: FnOnce(&Database) -> Result<T, SettingsError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn read_raw(db: &Database, key: &str) -> Result<Option<Vec<u8>>, SettingsError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(SETTINGS_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = table.get(key)?.map(|value| value.value().to_vec());
    Ok(value)
}

fn decode_entries<T: DeserializeOwned + Default>(
    key: &str,
    raw: HashMap<String, serde_json::Value>,
) -> HashMap<String, T> {
    let mut out = HashMap::with_capacity(raw.len());
    for (id, value) in raw {
        if id.is_empty() {
            continue;
        }
        let entry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Malformed {} entry for {}: {}", key, id, err);
                T::default()
            }
        };
        out.insert(id, entry);
    }
    out
}

#[derive(Debug)]
pub enum SettingsError {
    Redb(redb::Error),
    Json(serde_json::Error),
    Join(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Redb(err) => write!(f, "db error: {}", err),
            SettingsError::Json(err) => write!(f, "json error: {}", err),
            SettingsError::Join(reason) => write!(f, "settings task failed: {}", reason),
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<redb::Error> for SettingsError {
    fn from(err: redb::Error) -> Self {
        SettingsError::Redb(err)
    }
}

impl From<TableError> for SettingsError {
    fn from(err: TableError) -> Self {
        SettingsError::Redb(err.into())
    }
}

impl From<TransactionError> for SettingsError {
    fn from(err: TransactionError) -> Self {
        SettingsError::Redb(err.into())
    }
}

impl From<StorageError> for SettingsError {
    fn from(err: StorageError) -> Self {
        SettingsError::Redb(err.into())
    }
}

impl From<CommitError> for SettingsError {
    fn from(err: CommitError) -> Self {
        SettingsError::Redb(err.into())
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(err: serde_json::Error) -> Self {
        SettingsError::Json(err)
    }
}

impl From<tokio::task::JoinError> for SettingsError {
    fn from(err: tokio::task::JoinError) -> Self {
        SettingsError::Join(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_or_create_db;
    use common::PlayStats;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SettingsStore {
        let db = open_or_create_db(&dir.path().join("settings.redb")).unwrap();
        let settings = SettingsStore::new(Arc::new(db));
        settings.init_tables().unwrap();
        settings
    }

    #[tokio::test]
    async fn absent_key_loads_default() {
        let dir = TempDir::new().unwrap();
        let settings = open(&dir);
        let folders: Vec<String> = settings.load(FOLDERS_KEY).await;
        assert!(folders.is_empty());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let settings = open(&dir);
        let folders = vec!["Internal > Music".to_string()];
        settings.save(FOLDERS_KEY, &folders).await.unwrap();
        let loaded: Vec<String> = settings.load(FOLDERS_KEY).await;
        assert_eq!(loaded, folders);

        settings.remove(FOLDERS_KEY).await.unwrap();
        let loaded: Vec<String> = settings.load(FOLDERS_KEY).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn malformed_blob_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let settings = open(&dir);
        settings
            .set_raw(PLAY_STATS_KEY, b"{not json".to_vec())
            .await
            .unwrap();
        let stats: HashMap<String, PlayStats> = settings.load_map(PLAY_STATS_KEY).await;
        assert!(stats.is_empty());
    }

    #[tokio::test]
    async fn malformed_entry_becomes_default() {
        let dir = TempDir::new().unwrap();
        let settings = open(&dir);
        let blob = br#"{
            "good": {"playCount": 2, "lastPlayed": 20, "playHistory": [10, 20]},
            "bad": "not an object",
            "": {"playCount": 1}
        }"#;
        settings.set_raw(PLAY_STATS_KEY, blob.to_vec()).await.unwrap();

        let stats: HashMap<String, PlayStats> = settings.load_map(PLAY_STATS_KEY).await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["good"].play_count, 2);
        assert_eq!(stats["bad"], PlayStats::default());
    }
}
