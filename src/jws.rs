//! JSON Web Signature (JWS) 的平面 JSON 序列化，ACME 所有 POST 請求的外層格式。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    base64::Base64,
    key_pair::KeyPair,
    protection::{ProtectedHeader, ProtectionError},
    signature::{create_signature, SignatureError},
};

/// 表示一個 JSON Web Signature (JWS) 物件，三個欄位皆為 URL 安全的 Base64。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Jws {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

/// 表示與 JWS 相關的錯誤。
#[derive(Error, Debug)]
pub enum JwsError {
    #[error("Protected header error: {0}")]
    Protection(#[from] ProtectionError),
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, JwsError>;

impl Jws {
    /// 以已編碼的三個部分建立 `Jws`。
    pub fn new(header_b64: &Base64, payload_b64: &Base64, signature_b64: &Base64) -> Self {
        Jws {
            header: header_b64.base64_url(),
            payload: payload_b64.base64_url(),
            signature: signature_b64.base64_url(),
        }
    }

    /// 以給定的保護頭與載荷簽署。
    ///
    /// `payload` 為 `None` 時產生 POST-as-GET 請求，載荷欄位為空字串。
    pub fn sign(
        header: &ProtectedHeader,
        payload: Option<&Base64>,
        key_pair: &KeyPair,
    ) -> Result<Self> {
        let header_b64 = header.to_base64()?;
        let empty = Base64::new("");
        let payload_b64 = payload.unwrap_or(&empty);
        let signature = create_signature(&header_b64, payload_b64, key_pair)?;
        Ok(Self::new(&header_b64, payload_b64, &signature))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
