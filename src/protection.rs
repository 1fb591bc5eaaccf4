use crate::{
    base64::Base64,
    key_pair::KeyAlgorithm,
    nonce::{NonceError, NonceT},
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// 定義保護機制中可能產生的錯誤類型。
#[derive(Debug, Error)]
pub enum ProtectionError {
    /// JSON 序列化錯誤
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Nonce 相關錯誤
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
}

/// 自定義的結果型別，錯誤類型為 [`ProtectionError`]
type Result<T> = std::result::Result<T, ProtectionError>;

/// 用於生成保護頭（Protected Header）的結構體，
/// 該頭部包含數字簽章中必要的參數，如演算法、nonce、目標 URL 等。
pub struct Protection<'a> {
    nonce: Option<&'a dyn NonceT>,
    alg: &'static str,
    value: Option<JsonValue>,
}

/// 表示數字簽章保護頭部的資料結構。
#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    /// 簽章演算法
    alg: String,
    /// 用於防止重放攻擊的隨機數；金鑰輪替的內層 JWS 不帶此欄位
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    /// 請求目標 URL
    url: String,
    /// 可選的 JSON Web Key (JWK)
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<JsonValue>,
    /// 可選的密鑰標識符 (Key ID)
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    /// 將 [`ProtectedHeader`] 序列化後轉換為 Base64 格式。
    ///
    /// # Errors
    ///
    /// 如果序列化過程中發生錯誤，將返回 [`ProtectionError::Serialization`]。
    pub fn to_base64(&self) -> Result<Base64> {
        let json_str = serde_json::to_string(self)?;
        Ok(Base64::new(json_str.as_bytes()))
    }
}

impl<'a> Protection<'a> {
    /// 建立一個新的 [`Protection`] 實例。
    ///
    /// # 參數
    ///
    /// - `nonce`: 實現了 [`NonceT`] trait 的 nonce 取得器。
    /// - `alg`: 簽署此請求的金鑰演算法。
    pub fn new(nonce: &'a dyn NonceT, alg: KeyAlgorithm) -> Self {
        Self {
            nonce: Some(nonce),
            alg: alg.jws_alg(),
            value: None,
        }
    }

    /// 建立不含 nonce 的保護頭，用於金鑰輪替請求的內層 JWS。
    pub fn without_nonce(alg: KeyAlgorithm) -> Self {
        Self {
            nonce: None,
            alg: alg.jws_alg(),
            value: None,
        }
    }

    /// 為保護頭設定 `jwk`（JSON 物件）或 `kid`（其他值）。
    ///
    /// # 參數
    ///
    /// - `value`: 帳號的 JWK，或帳號 URL 作為 key id。
    ///
    /// # Errors
    ///
    /// 若序列化過程失敗，則返回 [`ProtectionError::Serialization`]。
    pub fn set_value<T: Serialize>(&mut self, value: T) -> Result<&mut Self> {
        self.value = Some(serde_json::to_value(value)?);
        Ok(self)
    }

    /// 根據目前設定的參數生成一個 [`ProtectedHeader`]。
    ///
    /// 會從 `nonce` 提供器中取得最新的 nonce 值，並根據 `value`
    /// 決定填充 `jwk` 還是 `kid` 欄位。
    ///
    /// # 參數
    ///
    /// - `url`: 目標 URL，將填入保護頭的 `url` 欄位。
    ///
    /// # Errors
    ///
    /// 取得 nonce 失敗時返回 [`ProtectionError::Nonce`]。
    pub async fn create_header(&self, url: impl Into<String>) -> Result<ProtectedHeader> {
        let nonce = match self.nonce {
            Some(nonce) => Some(nonce.get().await?),
            None => None,
        };
        let url = url.into();

        let (jwk, kid) = match &self.value {
            Some(value) if value.is_object() => (Some(value.clone()), None),
            Some(value) => (
                None,
                Some(
                    value
                        .as_str()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| value.to_string()),
                ),
            ),
            None => (None, None),
        };

        Ok(ProtectedHeader {
            alg: self.alg.to_string(),
            nonce,
            url,
            jwk,
            kid,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::nonce::MockNonce;

    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_jwk_handling() -> Result<()> {
        let nonce = MockNonce::new("test-nonce");
        let jwk = json!({"kty": "EC", "crv": "P-256"});

        let mut protection = Protection::new(&nonce, KeyAlgorithm::Es256);
        protection.set_value(&jwk)?;
        let header = protection.create_header("https://example.com").await?;

        assert_eq!(header.jwk, Some(jwk));
        assert!(header.kid.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_kid_handling() -> Result<()> {
        let nonce = MockNonce::new("test-nonce");

        let mut protection = Protection::new(&nonce, KeyAlgorithm::Rs256);
        protection.set_value("https://ca.example/acct/1")?;
        let header = protection.create_header("https://example.com").await?;
        assert_eq!(header.kid.as_deref(), Some("https://ca.example/acct/1"));
        assert!(header.jwk.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_header_serialization() -> Result<()> {
        let nonce = MockNonce::new("test-nonce");
        let header = Protection::new(&nonce, KeyAlgorithm::Es384)
            .create_header("https://example.com")
            .await?;

        let json = serde_json::to_string(&header)?;
        assert!(json.contains("\"nonce\":\"test-nonce\""));
        assert!(json.contains("\"url\":\"https://example.com\""));
        assert!(json.contains("\"alg\":\"ES384\""));

        let inner = Protection::without_nonce(KeyAlgorithm::Es256)
            .create_header("https://example.com/key-change")
            .await?;
        assert!(!serde_json::to_string(&inner)?.contains("nonce"));
        Ok(())
    }
}
