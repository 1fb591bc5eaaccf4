use std::{fmt, str::FromStr};

use openssl::sha::sha256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{base64::Base64, order::Problem};

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Unsupported challenge type: {0}")]
    UnsupportedType(String),
}

/// 表示 ACME 挑戰的類型。本庫僅處理 `http-01` 與 `dns-01`，
/// 其他類型在解析授權時保留為 [`ChallengeType::Other`]。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ChallengeType {
    Http01,
    Dns01,
    Other(String),
}

impl ChallengeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::Other(s) => s,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<String> for ChallengeType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "http-01" => Self::Http01,
            "dns-01" => Self::Dns01,
            _ => Self::Other(s),
        }
    }
}

impl From<ChallengeType> for String {
    fn from(t: ChallengeType) -> Self {
        t.as_str().to_string()
    }
}

impl FromStr for ChallengeType {
    type Err = ChallengeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::from(s.to_lowercase()) {
            Self::Other(other) => Err(ChallengeError::UnsupportedType(other)),
            supported => Ok(supported),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 表示 ACME 挑戰的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    /// CA 仍在處理中，需要繼續輪詢。
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

/// 授權中的一個挑戰物件。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResource {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub url: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

/// 組成 key authorization：`token || '.' || thumbprint`。
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

/// DNS-01 TXT 記錄的值：key authorization 的 SHA-256 再以 URL 安全 Base64 編碼。
pub fn dns_txt_value(key_authorization: &str) -> String {
    Base64::new(sha256(key_authorization.as_bytes())).base64_url()
}

/// DNS-01 記錄名稱，萬用字元網域會去掉 `*.` 前綴。
pub fn dns_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", strip_wildcard(domain))
}

/// HTTP-01 驗證時 CA 會請求的完整 URI。
pub fn http_resource_uri(domain: &str, token: &str) -> String {
    format!(
        "http://{}/.well-known/acme-challenge/{}",
        strip_wildcard(domain),
        token
    )
}

/// 相對於站台根目錄的 HTTP-01 檔案路徑。
pub fn http_resource_path(token: &str) -> String {
    format!(".well-known/acme-challenge/{}", token)
}

pub(crate) fn strip_wildcard(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}
