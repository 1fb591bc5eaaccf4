//! 核心設定：以明確的物件建立一次，傳給需要的元件。

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Let's Encrypt 正式環境目錄。
pub const DEFAULT_DIRECTORY_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// 固定間隔、固定次數的輪詢策略，可被取消。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

/// 輪詢被取消時的錯誤。
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Operation cancelled")]
pub struct Cancelled;

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// 等待一個間隔；期間被取消時回傳 [`Cancelled`]。
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(self.interval()) => Ok(()),
        }
    }
}

/// 存活探測出錯或無法判斷時採用的結果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessFallback {
    /// 視為仍在運行（樂觀）。
    #[default]
    AssumeRunning,
    /// 視為已停止。
    AssumeStopped,
}

impl LivenessFallback {
    pub fn as_bool(&self) -> bool {
        matches!(self, Self::AssumeRunning)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// 建立訂單的暫時性失敗重試。
    pub order_creation: RetryPolicy,
    /// 觸發挑戰驗證後的狀態輪詢。
    pub challenge_submission: RetryPolicy,
    /// 等待授權離開 pending。
    pub authorization: RetryPolicy,
    /// 等待訂單進入 ready。
    pub order_ready: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            order_creation: RetryPolicy::new(3, Duration::from_secs(1)),
            challenge_submission: RetryPolicy::new(10, Duration::from_secs(1)),
            authorization: RetryPolicy::new(20, Duration::from_secs(1)),
            order_ready: RetryPolicy::new(5, Duration::from_secs(2)),
        }
    }
}

/// 程式範圍的設定；所有欄位皆有預設值，設定檔只需列出要覆寫的欄位。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    pub directory_url: String,
    /// 帳號設定、帳號金鑰與封存紀錄的目錄。
    pub settings_path: PathBuf,
    /// 證書輸出根目錄，每個主網域一個子目錄。
    pub assets_path: PathBuf,
    /// 受管證書資料庫與舊版 JSON 檔所在目錄。
    pub data_path: PathBuf,
    pub enable_http_challenge_server: bool,
    pub http_challenge_port: u16,
    /// 本機挑戰回應程式的執行檔。
    pub http_challenge_program: PathBuf,
    pub enable_status_reporting: bool,
    pub enable_dns_validation_checks: bool,
    pub instance_id: Option<String>,
    /// 現有證書剩餘有效天數低於此值時才續約。
    pub renewal_interval_days: u32,
    /// 超過此秒數的 CA 連線階段會在下一次下單前重新建立。
    pub session_max_age_secs: u64,
    pub retry: RetrySettings,
    pub liveness_fallback: LivenessFallback,
    pub user_agent: String,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            settings_path: PathBuf::from("settings"),
            assets_path: PathBuf::from("assets"),
            data_path: PathBuf::from("settings"),
            enable_http_challenge_server: true,
            http_challenge_port: 80,
            http_challenge_program: PathBuf::from("certfleet-responder"),
            enable_status_reporting: true,
            enable_dns_validation_checks: false,
            instance_id: None,
            renewal_interval_days: 30,
            session_max_age_secs: 30 * 60,
            retry: RetrySettings::default(),
            liveness_fallback: LivenessFallback::default(),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

impl CoreSettings {
    /// 從 JSON 檔讀取設定；檔案不存在時回傳預設值。
    pub async fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        match tokio::fs::read(path.as_ref()).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }
}
