//! ACME 帳號設定與帳號金鑰的持久化，包括舊版金鑰檔匯入與只增不改的金鑰封存紀錄。

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    key_pair::{KeyAlgorithm, KeyError, KeyPair},
    storage::{Storage, StorageError},
};

/// 帳號設定檔。
pub const SETTINGS_FILE: &str = "c-settings.json";
/// 舊版僅含帳號金鑰 PEM 的檔案，首次載入時匯入設定檔。
pub const LEGACY_KEY_FILE: &str = "c-acc.key";
/// 帳號金鑰封存紀錄，只會附加。
pub const ARCHIVE_FILE: &str = "c-acc-archive";

/// 錯誤類型，用於描述在處理 ACME 帳戶相關操作時可能發生的各類錯誤。
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Account settings are unreadable: {0}")]
    CorruptSettings(#[from] serde_json::Error),
    #[error("Account key is unusable: {0}")]
    KeyError(#[from] KeyError),
}

pub type Result<T> = std::result::Result<T, AccountError>;

/// 帳號設定，欄位名稱與既有設定檔相容。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountSettings {
    #[serde(default)]
    pub account_email: Option<String>,
    #[serde(default)]
    pub account_uri: Option<String>,
    /// PEM 格式的帳號私鑰。
    #[serde(default)]
    pub account_key: Option<String>,
}

impl AccountSettings {
    /// 有聯絡信箱即視為已註冊。
    pub fn is_registered(&self) -> bool {
        self.account_email.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// 已載入的帳號：設定加上可用的金鑰。
#[derive(Debug, Clone)]
pub struct Account {
    pub settings: AccountSettings,
    pub key_pair: KeyPair,
}

/// 帳號設定的讀寫入口。
#[derive(Debug, Clone)]
pub struct AccountStore {
    storage: Arc<dyn Storage>,
}

impl AccountStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn load_settings(&self) -> Result<AccountSettings> {
        match self.storage.read_file(SETTINGS_FILE).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(StorageError::NotFound(_)) => Ok(AccountSettings::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_settings(&self, settings: &AccountSettings) -> Result<()> {
        let json = serde_json::to_vec_pretty(settings)?;
        self.storage.write_file(SETTINGS_FILE, &json).await?;
        Ok(())
    }

    /// 載入帳號；沒有任何金鑰時回傳 `None`。
    ///
    /// 金鑰存在但無法解析時回傳錯誤，不會改用新金鑰。
    pub async fn load(&self) -> Result<Option<Account>> {
        let mut settings = self.load_settings().await?;

        if let Some(pem) = settings.account_key.as_deref().filter(|k| !k.is_empty()) {
            let key_pair = KeyPair::from_pem(pem.as_bytes())?;
            if self.storage.exists(LEGACY_KEY_FILE).await? {
                self.storage.remove(LEGACY_KEY_FILE).await?;
            }
            return Ok(Some(Account { settings, key_pair }));
        }

        let Some(pem) = self.storage.read_string(LEGACY_KEY_FILE).await? else {
            return Ok(None);
        };
        let key_pair = KeyPair::from_pem(pem.as_bytes())?;
        info!("importing legacy account key file");
        settings.account_key = Some(pem);
        self.save_settings(&settings).await?;
        self.storage.remove(LEGACY_KEY_FILE).await?;
        Ok(Some(Account { settings, key_pair }))
    }

    /// 產生新的帳號金鑰並立即寫入設定，保留既有的信箱與帳號 URL。
    pub async fn create(&self, alg: KeyAlgorithm) -> Result<Account> {
        let mut settings = self.load_settings().await?;
        let key_pair = KeyPair::generate(alg)?;
        settings.account_key = Some(String::from_utf8_lossy(&key_pair.to_pem()?).into_owned());
        self.save_settings(&settings).await?;
        Ok(Account { settings, key_pair })
    }

    /// 附加一筆封存紀錄：時間、帳號 URL、信箱與金鑰 PEM。
    pub async fn archive(&self, settings: &AccountSettings, key_pair: &KeyPair) -> Result<()> {
        let pem = key_pair.to_pem()?;
        let entry = format!(
            "\n{}\n{}\n{}\n{}",
            Utc::now().to_rfc3339(),
            settings.account_uri.as_deref().unwrap_or_default(),
            settings.account_email.as_deref().unwrap_or_default(),
            String::from_utf8_lossy(&pem)
        );
        if let Err(e) = self.storage.append_file(ARCHIVE_FILE, entry.as_bytes()).await {
            warn!(error = %e, "failed to append account key archive");
            return Err(e.into());
        }
        Ok(())
    }
}
