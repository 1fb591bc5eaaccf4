use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// 表示處理目錄操作時可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Directory request failed with status {0}")]
    Status(reqwest::StatusCode),
}

type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// ACME 目錄，列出帳號、nonce、訂單、撤銷與金鑰輪替等資源的 URL。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Directory {
    #[serde(rename = "newAccount")]
    pub new_account: String,
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    #[serde(rename = "newOrder")]
    pub new_order: String,
    #[serde(rename = "revokeCert")]
    pub revoke_cert: String,
    #[serde(rename = "keyChange", default)]
    pub key_change: Option<String>,
    #[serde(rename = "renewalInfo", default)]
    pub renewal_info: Option<String>,
    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

/// 目錄的 `meta` 欄位。
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DirectoryMeta {
    #[serde(rename = "termsOfService", default)]
    pub terms_of_service: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(rename = "externalAccountRequired", default)]
    pub external_account_required: bool,
}

impl Directory {
    /// 從 CA 取得目錄。
    pub async fn fetch(client: &Client, url: &str) -> DirectoryResult<Self> {
        debug!(url, "fetching ACME directory");
        let response = client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// 目前 CA 的服務條款 URL。
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.as_deref())
    }
}
