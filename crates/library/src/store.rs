use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{ScanStatus, TrackRecord};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub(crate) const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");

/// Durable scanned-facts table keyed by track id.
///
/// Every write (bulk upsert, point update, reset) goes through one FIFO
/// queue so two batches never interleave. Reads skip the queue and may
/// observe a batch that is still being written.
#[derive(Clone)]
pub struct TrackStore {
    db: Arc<Database>,
    write_queue: Arc<Mutex<()>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackPatch {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub album_id: Option<String>,
    pub cover_image: Option<String>,
    pub scan_status: Option<ScanStatus>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub total: usize,
    pub processed: usize,
}

impl TrackStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = open_or_create_db(path)?;
        let store = Self::with_db(Arc::new(db));
        store.init_tables()?;
        Ok(store)
    }

    pub fn with_db(db: Arc<Database>) -> Self {
        Self {
            db,
            write_queue: Arc::new(Mutex::new(())),
        }
    }

    pub fn init_tables(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(TRACKS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn db(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    /// Inserts or replaces every record in one transaction. A record that
    /// cannot be written is logged and skipped; the rest of the batch still
    /// commits. Returns the number of rows written.
    pub async fn upsert_many(&self, records: Vec<TrackRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let _queued = self.write_queue.lock().await;
        let total = records.len();
        let written = self.blocking(move |db| upsert_batch(db, records)).await?;
        debug!("Upserted {} of {} tracks", written, total);
        Ok(written)
    }

    pub async fn update_partial(&self, id: &str, patch: TrackPatch) -> Result<bool, StoreError> {
        let _queued = self.write_queue.lock().await;
        let id = id.to_string();
        self.blocking(move |db| update_one(db, &id, patch)).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<TrackRecord>, StoreError> {
        let id = id.to_string();
        self.blocking(move |db| read_one(db, &id)).await
    }

    /// Every row, newest `date_added` first.
    pub async fn get_all(&self) -> Result<Vec<TrackRecord>, StoreError> {
        self.blocking(|db| {
            let mut records = read_all(db)?;
            sort_newest_first(&mut records);
            Ok(records)
        })
        .await
    }

    pub async fn get_pending(&self, limit: usize) -> Result<Vec<TrackRecord>, StoreError> {
        self.blocking(move |db| {
            let mut records: Vec<TrackRecord> = read_all(db)?
                .into_iter()
                .filter(|record| record.scan_status.is_pending())
                .collect();
            sort_newest_first(&mut records);
            records.truncate(limit);
            Ok(records)
        })
        .await
    }

    pub async fn count_pending(&self) -> Result<usize, StoreError> {
        let status = self.sync_status().await?;
        Ok(status.total - status.processed)
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, StoreError> {
        self.blocking(|db| {
            let mut status = SyncStatus::default();
            for record in read_all(db)? {
                status.total += 1;
                if !record.scan_status.is_pending() {
                    status.processed += 1;
                }
            }
            Ok(status)
        })
        .await
    }

    /// Drops every row. Only used when the user deselects all folders.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let _queued = self.write_queue.lock().await;
        self.blocking(|db| {
            let write_txn = db.begin_write()?;
            match write_txn.delete_table(TRACKS_TABLE) {
                Ok(_) | Err(TableError::TableDoesNotExist(_)) => {}
                Err(err) => return Err(err.into()),
            }
            {
                let _ = write_txn.open_table(TRACKS_TABLE)?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn upsert_batch(db: &Database, records: Vec<TrackRecord>) -> Result<usize, StoreError> {
    let write_txn = db.begin_write()?;
    let mut written = 0usize;
    {
        let mut table = write_txn.open_table(TRACKS_TABLE)?;
        for record in records {
            let id = record.id.clone();
            match upsert_one(&mut table, record) {
                Ok(()) => written += 1,
                Err(err) => warn!("Skipping track {:?} in batch: {}", id, err),
            }
        }
    }
    write_txn.commit()?;
    Ok(written)
}

fn upsert_one(
    table: &mut redb::Table<&str, &[u8]>,
    mut record: TrackRecord,
) -> Result<(), StoreError> {
    if record.id.trim().is_empty() {
        return Err(StoreError::InvalidRecord("missing id".to_string()));
    }
    let existing = match table.get(record.id.as_str())? {
        Some(value) => decode_value::<TrackRecord>(value.value()).ok(),
        None => None,
    };
    if let Some(existing) = existing {
        record.scan_status = existing.scan_status.advance(record.scan_status);
        if record.cover_image.is_none() {
            record.cover_image = existing.cover_image;
        }
    }
    let bytes = encode_value(&record)?;
    table.insert(record.id.as_str(), bytes.as_slice())?;
    Ok(())
}

fn update_one(db: &Database, id: &str, patch: TrackPatch) -> Result<bool, StoreError> {
    let write_txn = db.begin_write()?;
    let updated = {
        let mut table = write_txn.open_table(TRACKS_TABLE)?;
        let mut record: TrackRecord = match table.get(id)? {
            Some(value) => decode_value(value.value())?,
            None => return Ok(false),
        };
        apply_patch(&mut record, patch);
        let bytes = encode_value(&record)?;
        table.insert(id, bytes.as_slice())?;
        true
    };
    write_txn.commit()?;
    Ok(updated)
}

fn apply_patch(record: &mut TrackRecord, patch: TrackPatch) {
    if let Some(title) = patch.title {
        record.title = title;
    }
    if let Some(artist) = patch.artist {
        record.artist = artist;
    }
    if patch.album.is_some() {
        record.album = patch.album;
    }
    if patch.year.is_some() {
        record.year = patch.year;
    }
    if patch.genre.is_some() {
        record.genre = patch.genre;
    }
    if patch.album_id.is_some() {
        record.album_id = patch.album_id;
    }
    if patch.cover_image.is_some() {
        record.cover_image = patch.cover_image;
    }
    if let Some(status) = patch.scan_status {
        record.scan_status = record.scan_status.advance(status);
    }
}

fn read_one(db: &Database, id: &str) -> Result<Option<TrackRecord>, StoreError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(TRACKS_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let record = match table.get(id)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(record)
}

fn read_all(db: &Database) -> Result<Vec<TrackRecord>, StoreError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(TRACKS_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut records = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        match decode_value::<TrackRecord>(entry.1.value()) {
            Ok(record) => records.push(record),
            Err(err) => warn!("Skipping unreadable track row {:?}: {}", entry.0.value(), err),
        }
    }
    Ok(records)
}

fn sort_newest_first(records: &mut [TrackRecord]) {
    records.sort_by(|a, b| {
        b.date_added
            .cmp(&a.date_added)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub(crate) fn open_or_create_db(path: &Path) -> Result<Database, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    InvalidRecord(String),
    Join(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "io error: {}", err),
            StoreError::Redb(err) => write!(f, "db error: {}", err),
            StoreError::Bincode(err) => write!(f, "bincode error: {}", err),
            StoreError::InvalidRecord(reason) => write!(f, "invalid record: {}", reason),
            StoreError::Join(reason) => write!(f, "store task failed: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::Redb(err)
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TableError> for StoreError {
    fn from(err: TableError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<CommitError> for StoreError {
    fn from(err: CommitError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        StoreError::Bincode(err)
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Join(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, date_added: i64) -> TrackRecord {
        TrackRecord {
            id: id.to_string(),
            filename: format!("{}.mp3", id),
            uri: format!("/storage/emulated/0/Music/{}.mp3", id),
            duration_ms: 200_000,
            date_added,
            title: id.to_string(),
            artist: "Artist".to_string(),
            album: None,
            year: None,
            genre: None,
            album_id: None,
            cover_image: None,
            scan_status: ScanStatus::Pending,
            folder: Some("Internal > Music".to_string()),
        }
    }

    fn open_store(dir: &TempDir) -> TrackStore {
        TrackStore::open(&dir.path().join("library.redb")).unwrap()
    }

    #[tokio::test]
    async fn empty_store_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.get_all().await.unwrap().is_empty());
        assert_eq!(store.sync_status().await.unwrap(), SyncStatus::default());
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let records = vec![record("a", 1), record("b", 2), record("c", 3)];

        store.upsert_many(records.clone()).await.unwrap();
        let once = store.get_all().await.unwrap();
        store.upsert_many(records).await.unwrap();
        let twice = store.get_all().await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 3);
    }

    #[tokio::test]
    async fn get_all_orders_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let records: Vec<TrackRecord> = (0..100)
            .map(|i| record(&format!("track-{:03}", i), (i * 7919 % 100) as i64))
            .collect();
        store.upsert_many(records).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 100);
        assert!(all.windows(2).all(|w| w[0].date_added >= w[1].date_added));
    }

    #[tokio::test]
    async fn invalid_record_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let written = store
            .upsert_many(vec![record("a", 1), record("", 2), record("b", 3)])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert_many(vec![record("a", 1)]).await.unwrap();

        let patch = TrackPatch {
            cover_image: Some("/art/a.jpg".to_string()),
            scan_status: Some(ScanStatus::Enhanced),
            ..TrackPatch::default()
        };
        assert!(store.update_partial("a", patch).await.unwrap());

        // a rescan delivers the record as pending without artwork
        store.upsert_many(vec![record("a", 1)]).await.unwrap();
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.scan_status, ScanStatus::Enhanced);
        assert_eq!(stored.cover_image.as_deref(), Some("/art/a.jpg"));

        let downgrade = TrackPatch {
            scan_status: Some(ScanStatus::Cached),
            ..TrackPatch::default()
        };
        store.update_partial("a", downgrade).await.unwrap();
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.scan_status, ScanStatus::Enhanced);
    }

    #[tokio::test]
    async fn update_partial_on_missing_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let updated = store
            .update_partial("nope", TrackPatch::default())
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn pending_queries_and_sync_status() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .upsert_many(vec![record("a", 1), record("b", 2), record("c", 3)])
            .await
            .unwrap();
        let patch = TrackPatch {
            scan_status: Some(ScanStatus::Cached),
            ..TrackPatch::default()
        };
        store.update_partial("c", patch).await.unwrap();

        assert_eq!(store.count_pending().await.unwrap(), 2);
        let pending = store.get_pending(1).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
        assert_eq!(
            store.sync_status().await.unwrap(),
            SyncStatus {
                total: 3,
                processed: 1
            }
        );
    }

    #[tokio::test]
    async fn corrupt_rows_are_skipped_on_read() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert_many(vec![record("a", 1)]).await.unwrap();
        {
            let db = store.db();
            let write_txn = db.begin_write().unwrap();
            {
                let mut table = write_txn.open_table(TRACKS_TABLE).unwrap();
                table.insert("broken", [0xFFu8, 0x01].as_slice()).unwrap();
            }
            write_txn.commit().unwrap();
        }
        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "a");
    }

    #[tokio::test]
    async fn concurrent_batches_do_not_lose_rows() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let first: Vec<TrackRecord> = (0..300).map(|i| record(&format!("a{}", i), i)).collect();
        let second: Vec<TrackRecord> = (0..300).map(|i| record(&format!("b{}", i), i)).collect();

        let (left, right) = tokio::join!(store.upsert_many(first), store.upsert_many(second));
        assert_eq!(left.unwrap(), 300);
        assert_eq!(right.unwrap(), 300);
        assert_eq!(store.get_all().await.unwrap().len(), 600);
    }

    #[tokio::test]
    async fn reset_clears_and_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.redb");
        {
            let store = TrackStore::open(&path).unwrap();
            store.upsert_many(vec![record("a", 1)]).await.unwrap();
            // init is idempotent
            store.init_tables().unwrap();
        }
        let store = TrackStore::open(&path).unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 1);

        store.reset().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
        store.upsert_many(vec![record("b", 2)]).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }
}
