//! 受管證書存儲：SQLite 資料表加上記憶體快取。
//!
//! 載入後快取是讀取的唯一來源；寫入一律透過單一交易完成，交易成功後才清除快取中的
//! 髒旗標或移除已刪除的紀錄，因此失敗的寫入不會讓快取與資料庫分歧。

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Row, Sqlite, Transaction,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{ManagedCertificate, ManagedCertificateFilter};

/// 資料庫與舊版 JSON 檔的共同檔名。
pub const ITEM_STORE_NAME: &str = "manageditems";

#[derive(Debug, Error)]
pub enum ItemStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Stored record {id} is unreadable: {source}")]
    Corrupt {
        id: String,
        source: serde_json::Error,
    },
    #[error("Lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, ItemStoreError>;

type Cache = Arc<RwLock<HashMap<String, ManagedCertificate>>>;

#[derive(Debug)]
pub struct ManagedCertificateStore {
    pool: SqlitePool,
    cache: Cache,
    loaded: AtomicBool,
    /// 序列化所有寫入交易。
    write_lock: Mutex<()>,
    db_path: PathBuf,
}

impl ManagedCertificateStore {
    /// 開啟 `data_path` 下的資料庫：必要時建立資料表、補上缺少的欄位，
    /// 並在資料庫尚不存在時從舊版 JSON 檔遷移。
    ///
    /// # Errors
    ///
    /// 無法建立目錄或連線時返回 [`ItemStoreError::Io`] 或 [`ItemStoreError::Database`]。
    /// 舊版檔案無法解析時返回 [`ItemStoreError::Json`]；此時新建的資料庫會被移除，
    /// 下次開啟會再嘗試遷移。
    pub async fn open(data_path: impl AsRef<Path>) -> Result<Self> {
        let data_path = data_path.as_ref();
        tokio::fs::create_dir_all(data_path).await?;

        let db_path = data_path.join(format!("{ITEM_STORE_NAME}.db"));
        let legacy_path = data_path.join(format!("{ITEM_STORE_NAME}.json"));
        let needs_migration =
            tokio::fs::try_exists(&legacy_path).await? && !tokio::fs::try_exists(&db_path).await?;

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
            loaded: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            db_path,
        };

        store.create_schema().await?;
        store.upgrade_schema().await?;
        if needs_migration {
            if let Err(e) = store.migrate_legacy(&legacy_path).await {
                warn!(error = %e, path = %legacy_path.display(), "legacy migration failed, discarding new database");
                store.pool.close().await;
                remove_database_files(&store.db_path).await;
                return Err(e);
            }
        }
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS manageditem (id TEXT NOT NULL UNIQUE PRIMARY KEY, parentid TEXT NULL, json TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 只新增缺少的欄位，從不刪改既有欄位。
    async fn upgrade_schema(&self) -> Result<()> {
        let rows = sqlx::query("PRAGMA table_info(manageditem)")
            .fetch_all(&self.pool)
            .await?;
        let mut columns = HashSet::new();
        for row in rows {
            columns.insert(row.try_get::<String, _>("name")?.to_lowercase());
        }

        if !columns.contains("parentid") {
            info!("upgrading manageditem schema: adding parentid column");
            sqlx::query("ALTER TABLE manageditem ADD COLUMN parentid TEXT")
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// 將舊版 JSON 陣列匯入資料庫；重複的 id 加上 `_{n}` 後綴，成功後將原檔改名為 `.bak`。
    async fn migrate_legacy(&self, legacy_path: &Path) -> Result<()> {
        let data = tokio::fs::read(legacy_path).await?;
        let items: Vec<ManagedCertificate> = serde_json::from_slice(&data)?;
        info!(count = items.len(), path = %legacy_path.display(), "migrating legacy managed certificates");

        let mut seen = HashSet::new();
        let mut migrated = Vec::with_capacity(items.len());
        for mut item in items {
            if item.id.is_empty() {
                item.id = Uuid::new_v4().to_string();
            }
            if seen.contains(&item.id) {
                let base = item.id.clone();
                let mut counter = 1;
                while seen.contains(&format!("{base}_{counter}")) {
                    counter += 1;
                }
                item.id = format!("{base}_{counter}");
                warn!(original = %base, id = %item.id, "duplicate id renamed during migration");
            }
            seen.insert(item.id.clone());
            item.is_changed = false;
            migrated.push(item);
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for item in &migrated {
            Self::write_row(&mut tx, item).await?;
        }
        tx.commit().await?;

        let mut backup = legacy_path.as_os_str().to_owned();
        backup.push(".bak");
        let backup = PathBuf::from(backup);
        if tokio::fs::try_exists(&backup).await? {
            tokio::fs::remove_file(&backup).await?;
        }
        tokio::fs::rename(legacy_path, &backup).await?;
        Ok(())
    }

    async fn write_row(tx: &mut Transaction<'_, Sqlite>, item: &ManagedCertificate) -> Result<()> {
        let json = serde_json::to_string(item)?;
        sqlx::query("INSERT OR REPLACE INTO manageditem (id, parentid, json) VALUES (?, ?, ?)")
            .bind(&item.id)
            .bind(&item.parent_id)
            .bind(json)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    fn parse_row(id: String, json: &str) -> Result<ManagedCertificate> {
        let mut item: ManagedCertificate =
            serde_json::from_str(json).map_err(|source| ItemStoreError::Corrupt {
                id: id.clone(),
                source,
            })?;
        if item.id != id {
            warn!(stored = %item.id, key = %id, "record id disagrees with its key, using key");
            item.id = id;
        }
        item.is_changed = false;
        Ok(item)
    }

    /// 從資料庫讀取全部紀錄並整批取代快取。
    ///
    /// 尚未寫入的髒紀錄與標記刪除的紀錄保留快取中的版本，待下一次
    /// [`flush_all`](Self::flush_all) 處理。
    ///
    /// # Errors
    ///
    /// 查詢失敗時返回 [`ItemStoreError::Database`]；任一列無法解析時返回
    /// [`ItemStoreError::Corrupt`]，此時快取維持原狀。
    pub async fn load(&self, skip_if_loaded: bool) -> Result<()> {
        if skip_if_loaded && self.is_loaded() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let rows = sqlx::query("SELECT id, json FROM manageditem")
            .fetch_all(&self.pool)
            .await?;
        let mut items = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let json: String = row.try_get("json")?;
            let item = Self::parse_row(id, &json)?;
            items.insert(item.id.clone(), item);
        }
        debug!(count = items.len(), "managed certificates loaded");

        let mut cache = self.cache.write().map_err(|_| ItemStoreError::LockPoisoned)?;
        for (id, item) in cache.drain() {
            if item.is_changed || item.deleted {
                items.insert(id, item);
            }
        }
        *cache = items;
        drop(cache);
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// 快取未命中時只讀取該筆紀錄並放入快取。
    pub async fn get(&self, id: &str) -> Result<Option<ManagedCertificate>> {
        if let Some(item) = self.cached(id)? {
            return Ok(Some(item));
        }

        let row = sqlx::query("SELECT json FROM manageditem WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let item = Self::parse_row(id.to_string(), &row.try_get::<String, _>("json")?)?;

        let mut cache = self.cache.write().map_err(|_| ItemStoreError::LockPoisoned)?;
        // 讀取期間快取可能已被更新，保留較新的版本
        let item = cache.entry(item.id.clone()).or_insert(item).clone();
        Ok(Some(item))
    }

    fn cached(&self, id: &str) -> Result<Option<ManagedCertificate>> {
        Ok(self
            .cache
            .read()
            .map_err(|_| ItemStoreError::LockPoisoned)?
            .get(id)
            .cloned())
    }

    /// 在快取快照上篩選，不存取資料庫；結果依名稱排序，不含已標記刪除的紀錄。
    pub fn query(&self, filter: &ManagedCertificateFilter) -> Result<Vec<ManagedCertificate>> {
        let mut items: Vec<ManagedCertificate> = self
            .cache
            .read()
            .map_err(|_| ItemStoreError::LockPoisoned)?
            .values()
            .filter(|item| !item.deleted && filter.matches(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        if filter.max_results > 0 {
            items.truncate(filter.max_results);
        }
        Ok(items)
    }

    /// 先重新載入再篩選。
    pub async fn query_reloaded(
        &self,
        filter: &ManagedCertificateFilter,
    ) -> Result<Vec<ManagedCertificate>> {
        self.load(false).await?;
        self.query(filter)
    }

    /// 寫入快取（必要時指派 id）；`flush` 為真時立即以單一交易寫入該筆紀錄。
    ///
    /// # 參數
    ///
    /// - `item`: 要保存的紀錄，`id` 為空時指派新的 UUID。
    /// - `flush`: 為假時只標記為髒，等待 [`flush_all`](Self::flush_all)。
    ///
    /// # Errors
    ///
    /// 交易失敗時返回 [`ItemStoreError::Database`]，快取中的紀錄保持為髒。
    pub async fn upsert(
        &self,
        mut item: ManagedCertificate,
        flush: bool,
    ) -> Result<ManagedCertificate> {
        if item.id.is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        item.is_changed = true;
        self.cache
            .write()
            .map_err(|_| ItemStoreError::LockPoisoned)?
            .insert(item.id.clone(), item.clone());

        if !flush {
            return Ok(item);
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        Self::write_row(&mut tx, &item).await?;
        tx.commit().await?;

        self.mark_clean(std::slice::from_ref(&item))?;
        item.is_changed = false;
        Ok(item)
    }

    /// 標記刪除；下一次 [`flush_all`](Self::flush_all) 時才真正移除。
    pub fn mark_deleted(&self, id: &str) -> Result<bool> {
        let mut cache = self.cache.write().map_err(|_| ItemStoreError::LockPoisoned)?;
        Ok(match cache.get_mut(id) {
            Some(item) => {
                item.deleted = true;
                item.is_changed = true;
                true
            }
            None => false,
        })
    }

    /// 以交易刪除，成功後自快取移除。
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM manageditem WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.cache
            .write()
            .map_err(|_| ItemStoreError::LockPoisoned)?
            .remove(id);
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM manageditem")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.cache
            .write()
            .map_err(|_| ItemStoreError::LockPoisoned)?
            .clear();
        Ok(())
    }

    /// 單一交易內先刪除標記刪除的紀錄，再寫入所有髒紀錄；回傳寫入與刪除的筆數。
    ///
    /// # Errors
    ///
    /// 任何一筆寫入失敗時整個交易回滾並返回 [`ItemStoreError::Database`]，
    /// 快取中的髒旗標與刪除標記都不會被清除。
    pub async fn flush_all(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let (deleted, dirty): (Vec<ManagedCertificate>, Vec<ManagedCertificate>) = self
            .cache
            .read()
            .map_err(|_| ItemStoreError::LockPoisoned)?
            .values()
            .filter(|item| item.deleted || item.is_changed)
            .cloned()
            .partition(|item| item.deleted);

        if deleted.is_empty() && dirty.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for item in &deleted {
            sqlx::query("DELETE FROM manageditem WHERE id = ?")
                .bind(&item.id)
                .execute(&mut *tx)
                .await?;
        }
        for item in &dirty {
            Self::write_row(&mut tx, item).await?;
        }
        tx.commit().await?;

        {
            let mut cache = self.cache.write().map_err(|_| ItemStoreError::LockPoisoned)?;
            for item in &deleted {
                if cache.get(&item.id).is_some_and(|cached| cached.deleted) {
                    cache.remove(&item.id);
                }
            }
        }
        self.mark_clean(&dirty)?;

        debug!(
            deleted = deleted.len(),
            written = dirty.len(),
            "managed certificate store flushed"
        );
        Ok(deleted.len() + dirty.len())
    }

    /// 清除已寫入紀錄的髒旗標；寫入後又被修改的紀錄保持為髒。
    fn mark_clean(&self, written: &[ManagedCertificate]) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| ItemStoreError::LockPoisoned)?;
        for item in written {
            if let Some(cached) = cache.get_mut(&item.id) {
                if cached == item {
                    cached.is_changed = false;
                }
            }
        }
        Ok(())
    }
}

/// 移除資料庫檔案與 SQLite 的附屬檔；不存在的檔案略過。
async fn remove_database_files(db_path: &Path) {
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = ?path, "failed to remove database file"),
        }
    }
}
