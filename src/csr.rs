use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;

use crate::key_pair::KeyPair;

/// 建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("No SAN entries")]
    NoSanEntries,
}

type Result<T> = std::result::Result<T, CsrError>;

/// CSR 建構器：主體 CN 加上主體替代名稱 (SAN) 擴展。
///
/// 所有名稱都應已轉為 ASCII（IDN 轉換由呼叫端負責）。
///
/// ```no_run
/// # use certfleet::csr::CSR;
/// # use certfleet::key_pair::{KeyAlgorithm, KeyPair};
/// let key_pair = KeyPair::generate(KeyAlgorithm::Es256).unwrap();
/// let der = CSR::new()
///     .common_name("example.com")
///     .set_san("example.com")
///     .set_san("www.example.com")
///     .build_der(&key_pair)
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct CSR {
    common_name: Option<String>,
    san_entries: Vec<String>,
}

impl CSR {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定主體 CN，超過 64 字元的名稱僅放在 SAN 中。
    pub fn common_name(mut self, cn: &str) -> Self {
        self.common_name = Some(cn.to_string());
        self
    }

    /// 新增一個 DNS SAN；重複的項目會被忽略。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        if !self.san_entries.iter().any(|e| e == dns_name) {
            self.san_entries.push(dns_name.to_string());
        }
        self
    }

    pub fn build(self, key_pair: &KeyPair) -> Result<X509Req> {
        if self.san_entries.is_empty() {
            return Err(CsrError::NoSanEntries);
        }

        let mut req_builder = X509Req::builder()?;

        if let Some(cn) = self.common_name.as_deref().filter(|cn| cn.len() <= 64) {
            let mut name = X509NameBuilder::new()?;
            name.append_entry_by_text("CN", cn)?;
            req_builder.set_subject_name(&name.build())?;
        }

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(&key_pair.pri_key)?;
        req_builder.sign(&key_pair.pri_key, MessageDigest::sha256())?;

        Ok(req_builder.build())
    }

    /// 建立並以 DER 編碼輸出，供最終化訂單使用。
    pub fn build_der(self, key_pair: &KeyPair) -> Result<Vec<u8>> {
        Ok(self.build(key_pair)?.to_der()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pair::KeyAlgorithm;
    use openssl::nid::Nid;

    #[test]
    fn test_csr_has_common_name_and_sans() {
        let key = KeyPair::generate(KeyAlgorithm::Es256).unwrap();
        let req = CSR::new()
            .common_name("example.com")
            .set_san("example.com")
            .set_san("www.example.com")
            .set_san("example.com")
            .build(&key)
            .unwrap();

        let cn = req
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "example.com");
        assert!(req.verify(&req.public_key().unwrap()).unwrap());
    }

    #[test]
    fn test_csr_requires_san() {
        let key = KeyPair::generate(KeyAlgorithm::Es256).unwrap();
        assert!(matches!(CSR::new().build(&key), Err(CsrError::NoSanEntries)));
    }
}
