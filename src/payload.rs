use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::base64::Base64;

/// 載荷驗證失敗時的錯誤。
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Invalid payload: {0}")]
    Invalid(&'static str),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 定義所有 ACME 請求載荷（Payload）必須實作的功能。
///
/// 實作者提供驗證邏輯；序列化與 Base64 編碼由預設方法完成。
pub trait PayloadT: Serialize + for<'de> Deserialize<'de> {
    fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 先驗證，再轉成 JSON 並以 Base64 編碼。
    fn to_base64(&self) -> Result<Base64, PayloadError> {
        self.validate()?;
        Ok(Base64::new(self.to_json_string()?.as_bytes()))
    }

    /// 驗證載荷資料是否符合 ACME 的要求。
    fn validate(&self) -> Result<(), PayloadError>;
}

/// 建立新帳號所需的聯絡資訊與服務條款同意。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewAccountPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    contact: Vec<String>,
    #[serde(rename = "termsOfServiceAgreed")]
    terms_of_service_agreed: bool,
    #[serde(
        rename = "onlyReturnExisting",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    only_return_existing: bool,
}

impl NewAccountPayload {
    /// `email` 會自動補足 `mailto:` 前綴。
    pub fn new(email: &str) -> Self {
        let contact = if email.starts_with("mailto:") {
            vec![email.to_string()]
        } else {
            vec![format!("mailto:{}", email)]
        };

        NewAccountPayload {
            contact,
            terms_of_service_agreed: true,
            only_return_existing: false,
        }
    }

    /// 僅查詢既有帳號，不建立新帳號；用於以既有金鑰找回帳號 URL 或檢查帳號狀態。
    pub fn lookup() -> Self {
        NewAccountPayload {
            contact: Vec::new(),
            terms_of_service_agreed: true,
            only_return_existing: true,
        }
    }
}

impl PayloadT for NewAccountPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.contact.is_empty() && !self.only_return_existing {
            return Err(PayloadError::Invalid("Contact information is required"));
        }
        if !self.terms_of_service_agreed {
            return Err(PayloadError::Invalid("Terms of service must be agreed"));
        }
        Ok(())
    }
}

/// 證書涵蓋的識別項，目前僅支援 `dns`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            type_: "dns".to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
}

impl NewOrderPayload {
    /// 為每個（已轉為 ASCII 的）網域建立一個 `dns` 識別項。
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Self {
        let identifiers = domains
            .iter()
            .map(|domain| Identifier::dns(domain.as_ref()))
            .collect();

        NewOrderPayload { identifiers }
    }
}

impl PayloadT for NewOrderPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.identifiers.is_empty() {
            return Err(PayloadError::Invalid("At least one identifier is required"));
        }
        for identifier in &self.identifiers {
            if identifier.type_ != "dns" {
                return Err(PayloadError::Invalid("Identifier type must be 'dns'"));
            }
            if identifier.value.is_empty() {
                return Err(PayloadError::Invalid("Identifier value cannot be empty"));
            }
        }
        Ok(())
    }
}

/// 觸發挑戰驗證時送出的空物件 `{}`。
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ChallengeValidationPayload {}

impl ChallengeValidationPayload {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadT for ChallengeValidationPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        Ok(())
    }
}

/// 最終化訂單的載荷，內含 DER 編碼 CSR 的 URL 安全 Base64。
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeOrderPayload {
    #[serde(rename = "csr")]
    csr_b64_str: String,
}

impl FinalizeOrderPayload {
    pub fn new(csr_b64: &Base64) -> Self {
        FinalizeOrderPayload {
            csr_b64_str: csr_b64.base64_url(),
        }
    }
}

impl PayloadT for FinalizeOrderPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.csr_b64_str.is_empty() {
            return Err(PayloadError::Invalid("CSR cannot be empty"));
        }
        Ok(())
    }
}

/// 撤銷憑證的載荷。
#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeCertPayload {
    certificate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<u8>,
}

impl RevokeCertPayload {
    /// `cert_der` 為葉憑證的 DER 編碼。
    pub fn new(cert_der: &[u8], reason: Option<u8>) -> Self {
        RevokeCertPayload {
            certificate: Base64::new(cert_der).base64_url(),
            reason,
        }
    }
}

impl PayloadT for RevokeCertPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.certificate.is_empty() {
            return Err(PayloadError::Invalid("Certificate cannot be empty"));
        }
        // RFC 5280 原因碼 7 未使用
        if matches!(self.reason, Some(r) if r == 7 || r > 10) {
            return Err(PayloadError::Invalid("Unsupported revocation reason"));
        }
        Ok(())
    }
}

/// 金鑰輪替的內層載荷：帳號 URL 與舊金鑰的 JWK。
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyChangePayload {
    account: String,
    #[serde(rename = "oldKey")]
    old_key: Value,
}

impl KeyChangePayload {
    pub fn new(account: impl Into<String>, old_key: Value) -> Self {
        KeyChangePayload {
            account: account.into(),
            old_key,
        }
    }
}

impl PayloadT for KeyChangePayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.account.is_empty() {
            return Err(PayloadError::Invalid("Account URL is required"));
        }
        if !self.old_key.is_object() {
            return Err(PayloadError::Invalid("Old key must be a JWK object"));
        }
        Ok(())
    }
}
