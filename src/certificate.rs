use chrono::{DateTime, Duration, Utc};
use openssl::{asn1::Asn1Time, pkcs12::Pkcs12, stack::Stack, x509::X509};
use thiserror::Error;
use tracing::debug;

use crate::key_pair::KeyPair;

/// 證書相關操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),
    #[error("Certificate chain is empty")]
    EmptyChain,
    #[error("PKCS#12 archive has no certificate")]
    MissingCertificate,
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
}

type Result<T> = std::result::Result<T, CertificateError>;

/// X.509 證書鏈：葉憑證加上中繼憑證。
pub struct Certificate {
    pub cert: X509,
    pub chain: Vec<X509>,
}

impl Certificate {
    /// 解析單一 PEM 證書。
    pub fn new(pem: &str) -> Result<Self> {
        let cert = X509::from_pem(pem.as_bytes())?;
        Ok(Certificate {
            cert,
            chain: Vec::new(),
        })
    }

    /// 解析 CA 下載的 `application/pem-certificate-chain`，第一張為葉憑證。
    pub fn from_chain_pem(pem: &str) -> Result<Self> {
        let mut certs = X509::stack_from_pem(pem.as_bytes())?.into_iter();
        let cert = certs.next().ok_or(CertificateError::EmptyChain)?;
        Ok(Certificate {
            cert,
            chain: certs.collect(),
        })
    }

    /// 從 PKCS#12 封存讀取證書，取第一張證書為葉憑證。
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self> {
        let parsed = Pkcs12::from_der(der)?.parse2(password)?;
        let cert = parsed.cert.ok_or(CertificateError::MissingCertificate)?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();
        Ok(Certificate { cert, chain })
    }

    /// 證書到期時間（UTC）。
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(self.cert.not_after())?;
        let ts = diff.days as i64 * 86400 + diff.secs as i64;
        DateTime::from_timestamp(ts, 0).ok_or(CertificateError::InvalidTimestamp)
    }

    /// 剩餘有效時間不足 `threshold_days` 天（或已過期）時回傳 `true`。
    pub fn should_renew(&self, threshold_days: u32) -> Result<bool> {
        let remaining = self.not_after()? - Utc::now();
        debug!(
            remaining_secs = remaining.num_seconds(),
            threshold_days, "checking certificate renewal threshold"
        );
        Ok(remaining <= Duration::days(threshold_days as i64))
    }

    pub fn leaf_der(&self) -> Result<Vec<u8>> {
        Ok(self.cert.to_der()?)
    }

    /// 依序輸出私鑰、葉憑證與鏈上的其他證書。
    pub fn to_pem_bundle(&self, key: &KeyPair) -> Result<String> {
        let mut pem = key.pri_key.private_key_to_pem_pkcs8()?;
        pem.extend(self.cert.to_pem()?);
        for cert in &self.chain {
            pem.extend(cert.to_pem()?);
        }
        Ok(String::from_utf8_lossy(&pem).into_owned())
    }

    /// 以空密碼輸出 PKCS#12。
    pub fn to_pkcs12(&self, key: &KeyPair, friendly_name: &str) -> Result<Vec<u8>> {
        let mut builder = Pkcs12::builder();
        builder
            .name(friendly_name)
            .pkey(&key.pri_key)
            .cert(&self.cert);
        if !self.chain.is_empty() {
            let mut ca = Stack::new()?;
            for cert in &self.chain {
                ca.push(cert.clone())?;
            }
            builder.ca(ca);
        }
        Ok(builder.build2("")?.to_der()?)
    }
}
