use std::{
    collections::HashMap,
    fmt, io,
    path::{Component, Path, PathBuf},
    sync::RwLock,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 帳號設定、帳號金鑰與其封存紀錄使用的鍵值儲存。
///
/// 鍵為以 `/` 分隔的相對路徑，不允許跳脫根目錄。
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 的內容；不存在時回傳 [`StorageError::NotFound`]。
    async fn read_file(&self, key: &str) -> Result<Vec<u8>>;

    /// 以整檔取代的方式寫入，父目錄會自動建立。
    async fn write_file(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 附加至既有內容之後，不存在時建立；用於只增不改的封存紀錄。
    async fn append_file(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// 讀取並轉為字串；不存在時回傳 `None`。
    async fn read_string(&self, key: &str) -> Result<Option<String>> {
        match self.read_file(key).await {
            Ok(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

struct KeyUtils;

impl KeyUtils {
    /// 正規化 key 為不含根目錄的相對路徑，並檢查不合法字元與格式。
    fn normalize(key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("Empty key".to_string()));
        }
        if key.contains('\0') || key.contains('\n') || key.contains('\r') {
            return Err(StorageError::InvalidKey(format!(
                "Invalid characters in key: {}",
                key
            )));
        }
        if key.ends_with('/') {
            return Err(StorageError::InvalidKey(format!(
                "File key cannot end with '/': {}",
                key
            )));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(StorageError::InvalidKey(format!(
                            "Cannot use '..' to escape root directory: {}",
                            key
                        )));
                    }
                }
                Component::Normal(name) => match name.to_str() {
                    Some(name) if !name.contains('\\') => normalized.push(name),
                    _ => {
                        return Err(StorageError::InvalidKey(format!(
                            "Invalid path component in: {}",
                            key
                        )))
                    }
                },
                Component::Prefix(_) => {
                    return Err(StorageError::InvalidKey(format!("Invalid path: {}", key)))
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(StorageError::InvalidKey(format!("Invalid path: {}", key)));
        }
        Ok(normalized)
    }
}

/// 以目錄為根的檔案系統儲存，每個 key 對應一個檔案。
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(KeyUtils::normalize(key)?))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_of(key)?;
        Self::ensure_parent(&path).await?;

        // 先寫入暫存檔再改名，避免寫到一半的設定檔
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn append_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_of(key)?;
        Self::ensure_parent(&path).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(value).await?;
        file.flush().await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_of(key)?;
        Ok(fs::try_exists(&path).await?)
    }
}

/// 記憶體內的儲存實作，主要用於測試。
#[derive(Debug, Default)]
pub struct MemStorage {
    data: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = KeyUtils::normalize(key)?;
        self.data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(&path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = KeyUtils::normalize(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(path, value.to_vec());
        Ok(())
    }

    async fn append_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = KeyUtils::normalize(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .entry(path)
            .or_default()
            .extend_from_slice(value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = KeyUtils::normalize(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(&path);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = KeyUtils::normalize(key)?;
        Ok(self
            .data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains_key(&path))
    }
}
