//! 續約編排依賴的外部協作者介面。
//!
//! 網站伺服器、DNS 提供者、憑證庫與儀表板都不在本庫範圍內，這裡只定義契約。

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{DnsZone, ManagedCertificate, RenewalStatusReport, StatusMessage};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Stored credential not found: {0}")]
    CredentialNotFound(String),
    #[error("Unknown provider type: {0}")]
    UnknownProvider(String),
    #[error("{0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// 已解密的憑證參數。
pub type Credentials = HashMap<String, String>;

/// 目標網站伺服器。
#[async_trait]
pub trait ServerProvider: Send + Sync {
    /// 檢查伺服器組態能否回應 HTTP-01 挑戰。
    async fn run_configuration_diagnostics(&self, site_id: Option<&str>) -> Vec<StatusMessage>;

    async fn is_site_running(&self, site_id: &str) -> Result<bool>;
}

/// 在正式下單前確認挑戰回應能被外部取得。
#[async_trait]
pub trait ChallengeDiagnostics: Send + Sync {
    async fn test_challenge_response(
        &self,
        record: &ManagedCertificate,
        is_preview: bool,
        enable_dns_checks: bool,
    ) -> Vec<StatusMessage>;
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn zones(&self) -> Result<Vec<DnsZone>>;
}

#[async_trait]
pub trait DnsProviderFactory: Send + Sync {
    /// 不認得的提供者類型回傳 `Ok(None)`。
    async fn create(
        &self,
        provider_type: &str,
        credentials: Credentials,
    ) -> Result<Option<Arc<dyn DnsProvider>>>;
}

/// 依需要解密儲存的憑證，解密結果不會被快取。
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_unlocked_credentials(&self, storage_key: &str) -> Result<Credentials>;
}

#[async_trait]
pub trait DashboardClient: Send + Sync {
    async fn report_renewal_status(&self, report: &RenewalStatusReport) -> Result<()>;
}
