//! 續約編排：串起存儲、ACME 協調器、診斷、本機挑戰回應程式與部署管線。

use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    certificate::Certificate,
    challenge::ChallengeType,
    config::CoreSettings,
    coordinator::{AcmeOrderCoordinator, CoordinatorError},
    deployment::{DeploymentPipeline, DeploymentTaskRegistry},
    item_store::{ItemStoreError, ManagedCertificateStore},
    models::{
        ActionStep, CertificateRequestResult, DnsZone, ManagedCertificate,
        ManagedCertificateFilter, RenewalStatusReport, RequestState, StatusMessage,
    },
    providers::{
        ChallengeDiagnostics, CredentialStore, DashboardClient, DnsProviderFactory, ProviderError,
        ServerProvider,
    },
    responder::ChallengeResponder,
};

const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] ItemStoreError),
    #[error("Order error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Managed certificate not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// 一次簽發嘗試的結果；失敗訊息會記錄到受管證書上。
enum Attempt {
    Issued(PathBuf),
    Failed(String),
}

pub struct OrchestratorBuilder {
    settings: Arc<CoreSettings>,
    store: Arc<ManagedCertificateStore>,
    coordinator: Arc<AcmeOrderCoordinator>,
    server: Arc<dyn ServerProvider>,
    diagnostics: Arc<dyn ChallengeDiagnostics>,
    registry: DeploymentTaskRegistry,
    credentials: Option<Arc<dyn CredentialStore>>,
    dns_providers: Option<Arc<dyn DnsProviderFactory>>,
    dashboard: Option<Arc<dyn DashboardClient>>,
    responder: Option<Arc<ChallengeResponder>>,
}

impl OrchestratorBuilder {
    pub fn deployment_tasks(mut self, registry: DeploymentTaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn dns_providers(mut self, factory: Arc<dyn DnsProviderFactory>) -> Self {
        self.dns_providers = Some(factory);
        self
    }

    pub fn dashboard(mut self, client: Arc<dyn DashboardClient>) -> Self {
        self.dashboard = Some(client);
        self
    }

    pub fn responder(mut self, responder: Arc<ChallengeResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// 啟用本機挑戰回應程式但未指定時，依設定建立一個。
    pub fn build(self) -> Result<RenewalOrchestrator> {
        let responder = match self.responder {
            Some(responder) => Some(responder),
            None if self.settings.enable_http_challenge_server => {
                Some(Arc::new(ChallengeResponder::new(&self.settings)?))
            }
            None => None,
        };
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(RenewalOrchestrator {
            pipeline: DeploymentPipeline::new(Arc::new(self.registry), self.credentials.clone()),
            settings: self.settings,
            store: self.store,
            coordinator: self.coordinator,
            server: self.server,
            diagnostics: self.diagnostics,
            credentials: self.credentials,
            dns_providers: self.dns_providers,
            dashboard: self.dashboard,
            responder,
            notifications,
        })
    }
}

pub struct RenewalOrchestrator {
    settings: Arc<CoreSettings>,
    store: Arc<ManagedCertificateStore>,
    coordinator: Arc<AcmeOrderCoordinator>,
    pipeline: DeploymentPipeline,
    server: Arc<dyn ServerProvider>,
    diagnostics: Arc<dyn ChallengeDiagnostics>,
    credentials: Option<Arc<dyn CredentialStore>>,
    dns_providers: Option<Arc<dyn DnsProviderFactory>>,
    dashboard: Option<Arc<dyn DashboardClient>>,
    responder: Option<Arc<ChallengeResponder>>,
    notifications: broadcast::Sender<ManagedCertificate>,
}

impl RenewalOrchestrator {
    pub fn builder(
        settings: Arc<CoreSettings>,
        store: Arc<ManagedCertificateStore>,
        coordinator: Arc<AcmeOrderCoordinator>,
        server: Arc<dyn ServerProvider>,
        diagnostics: Arc<dyn ChallengeDiagnostics>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings,
            store,
            coordinator,
            server,
            diagnostics,
            registry: DeploymentTaskRegistry::new(),
            credentials: None,
            dns_providers: None,
            dashboard: None,
            responder: None,
        }
    }

    /// 受管證書每次變更後都會送出一份快照。
    pub fn subscribe(&self) -> broadcast::Receiver<ManagedCertificate> {
        self.notifications.subscribe()
    }

    fn notify(&self, record: &ManagedCertificate) {
        // 沒有訂閱者時送出會失敗，可忽略
        let _ = self.notifications.send(record.clone());
    }

    pub async fn get_managed_certificate(&self, id: &str) -> Result<Option<ManagedCertificate>> {
        Ok(self.store.get(id).await?)
    }

    pub fn get_managed_certificates(
        &self,
        filter: &ManagedCertificateFilter,
    ) -> Result<Vec<ManagedCertificate>> {
        Ok(self.store.query(filter)?)
    }

    pub async fn update_managed_certificate(
        &self,
        record: ManagedCertificate,
    ) -> Result<ManagedCertificate> {
        let saved = self.store.upsert(record, true).await?;
        self.notify(&saved);
        Ok(saved)
    }

    pub async fn delete_managed_certificate(&self, id: &str) -> Result<()> {
        if self.store.get(id).await?.is_some() {
            self.store.delete(id).await?;
            info!(managed_certificate = %id, "managed certificate deleted");
        }
        Ok(())
    }

    /// 記錄續約結果並保存、通知訂閱者，視設定回報給儀表板。
    ///
    /// 成功清除失敗計數與訊息；暫停清除計數並保留原因；其他結果累加失敗計數並標記為錯誤。
    pub async fn update_status(
        &self,
        mut record: ManagedCertificate,
        outcome: RequestState,
        message: Option<&str>,
    ) -> Result<ManagedCertificate> {
        match outcome {
            RequestState::Success => {
                record.renewal_failure_count = 0;
                record.renewal_failure_message = None;
                record.last_renewal_status = RequestState::Success;
            }
            RequestState::Paused => {
                record.renewal_failure_count = 0;
                record.renewal_failure_message = message.map(ToString::to_string);
                record.last_renewal_status = RequestState::Paused;
            }
            _ => {
                record.renewal_failure_count += 1;
                record.renewal_failure_message = message.map(ToString::to_string);
                record.last_renewal_status = RequestState::Error;
            }
        }
        record.date_last_renewal_attempt = Some(Utc::now());

        let record = self.store.upsert(record, true).await?;
        self.notify(&record);

        if record.request_config.enable_failure_notifications && self.settings.enable_status_reporting
        {
            self.report_status(&record).await;
        }
        Ok(record)
    }

    async fn report_status(&self, record: &ManagedCertificate) {
        let Some(dashboard) = &self.dashboard else {
            return;
        };
        let primary_contact_email = self
            .coordinator
            .contact_registrations()
            .await
            .ok()
            .and_then(|contacts| contacts.into_iter().next());
        let report = RenewalStatusReport {
            instance_id: self.settings.instance_id.clone(),
            primary_contact_email,
            managed_certificate: record.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if let Err(e) = dashboard.report_renewal_status(&report).await {
            warn!(error = %e, "Failed to send renewal status report.");
        }
    }

    /// 下單前的組態與挑戰回應檢查；任何一則訊息不是 OK 即視為未通過，警告不影響結果。
    pub async fn run_diagnostics(
        &self,
        record: &ManagedCertificate,
        is_preview: bool,
    ) -> Vec<StatusMessage> {
        let mut results = Vec::new();
        let uses_http = record.uses_challenge(&ChallengeType::Http01);

        if record.request_config.perform_auto_config && uses_http {
            results.extend(
                self.server
                    .run_configuration_diagnostics(record.server_site_id.as_deref())
                    .await,
            );
        }

        let responder = self
            .responder
            .as_ref()
            .filter(|_| self.settings.enable_http_challenge_server && uses_http);
        if let Some(responder) = responder {
            if responder.start().await {
                results.push(StatusMessage::ok("Http Challenge Server process available."));
            } else {
                results.push(StatusMessage::warning(
                    "Built-in Http Challenge Server process unavailable or could not start. Challenge responses will fall back to the web server.",
                ));
            }
        }

        results.extend(
            self.diagnostics
                .test_challenge_response(
                    record,
                    is_preview,
                    self.settings.enable_dns_validation_checks,
                )
                .await,
        );

        if let Some(responder) = responder {
            responder.stop().await;
        }
        results
    }

    /// 執行受管證書的部署任務；找不到紀錄時回傳單一失敗步驟。
    pub async fn perform_deployment_tasks(
        &self,
        id: &str,
        task_id: Option<&str>,
        is_preview_only: bool,
        skip_deferred: bool,
    ) -> Result<Vec<ActionStep>> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(vec![ActionStep::error(
                "Deployment",
                "Managed certificate not found. Could not deploy.",
            )]);
        };
        Ok(self
            .pipeline
            .run(&record, task_id, is_preview_only, skip_deferred)
            .await)
    }

    /// 網站是否運行中；找不到紀錄或探測失敗時依 [`LivenessFallback`](crate::config::LivenessFallback) 決定。
    pub async fn is_managed_certificate_running(&self, id: &str) -> bool {
        let fallback = self.settings.liveness_fallback.as_bool();
        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return fallback,
            Err(e) => {
                warn!(managed_certificate = %id, error = %e, "cannot load managed certificate");
                return fallback;
            }
        };
        match self
            .server
            .is_site_running(record.group_id.as_deref().unwrap_or_default())
            .await
        {
            Ok(running) => running,
            Err(e) => {
                warn!(managed_certificate = %id, error = %e, "site status probe failed");
                fallback
            }
        }
    }

    /// 沒有 DNS 提供者工廠或不認得該類型時回傳空清單。
    pub async fn get_dns_provider_zones(
        &self,
        provider_type: &str,
        credentials_id: Option<&str>,
    ) -> Result<Vec<DnsZone>> {
        let Some(factory) = &self.dns_providers else {
            return Ok(Vec::new());
        };
        let credentials = match (credentials_id.filter(|c| !c.is_empty()), &self.credentials) {
            (Some(key), Some(store)) => store.get_unlocked_credentials(key).await?,
            (Some(key), None) => return Err(ProviderError::CredentialNotFound(key.to_string()).into()),
            (None, _) => Default::default(),
        };
        match factory.create(provider_type, credentials).await? {
            Some(provider) => Ok(provider.zones().await?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn revoke_certificate(&self, id: &str) -> Result<StatusMessage> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(StatusMessage::error("Managed certificate not found."));
        };
        Ok(self.coordinator.revoke_certificate(&record).await)
    }

    /// 完整續約流程：診斷、下單、驗證、完成訂單、記錄結果，成功後執行非延後的部署任務。
    ///
    /// `force` 為假且現有證書尚未進入續約期時直接回傳成功，不改變紀錄。
    ///
    /// # Errors
    ///
    /// 找不到紀錄時返回 [`OrchestratorError::NotFound`]。簽發失敗以
    /// `is_success == false` 的結果回報；存儲錯誤會先盡力記錄到紀錄上再返回。
    pub async fn perform_renewal(
        &self,
        id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<CertificateRequestResult> {
        let span = info_span!("renewal", managed_certificate = %id);
        self.renew(id, force, cancel).instrument(span).await
    }

    async fn renew(
        &self,
        id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<CertificateRequestResult> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        if !force && !self.is_due(&record).await {
            info!("certificate is not due for renewal");
            return Ok(CertificateRequestResult {
                managed_certificate_id: record.id,
                is_success: true,
                message: "Certificate is not due for renewal.".into(),
                pfx_path: record.certificate_path,
                deployment_steps: Vec::new(),
            });
        }

        record.last_renewal_status = RequestState::InProgress;
        record.date_last_renewal_attempt = Some(Utc::now());
        record = self.update_managed_certificate(record).await?;

        let attempt = self.attempt(&mut record, cancel).await;
        if !matches!(attempt, Ok(Attempt::Issued(_))) {
            self.discard_order(&record);
        }
        let pfx_path = match attempt {
            Ok(Attempt::Issued(path)) => path,
            Ok(Attempt::Failed(message)) => return self.fail(record, message).await,
            Err(OrchestratorError::Coordinator(e)) => return self.fail(record, e.to_string()).await,
            Err(e) => {
                if let Err(record_error) = self.fail(record, e.to_string()).await {
                    warn!(error = %record_error, "failed to record renewal failure");
                }
                return Err(e);
            }
        };

        match tokio::fs::read(&pfx_path)
            .await
            .ok()
            .and_then(|der| Certificate::from_pkcs12(&der, "").ok())
            .and_then(|cert| cert.not_after().ok())
        {
            Some(expiry) => record.date_expiry = Some(expiry),
            None => warn!(path = %pfx_path.display(), "cannot read expiry of issued certificate"),
        }
        record.certificate_path = Some(pfx_path.to_string_lossy().into_owned());
        record.date_renewed = Some(Utc::now());
        record.current_order_uri = None;
        let record = self
            .update_status(record, RequestState::Success, None)
            .await?;
        info!(path = %pfx_path.display(), "certificate renewed");

        let deployment_steps = self
            .perform_deployment_tasks(&record.id, None, false, true)
            .await?;

        Ok(CertificateRequestResult {
            managed_certificate_id: record.id,
            is_success: true,
            message: "Certificate renewed.".into(),
            pfx_path: Some(pfx_path.to_string_lossy().into_owned()),
            deployment_steps,
        })
    }

    fn discard_order(&self, record: &ManagedCertificate) {
        let Some(order_uri) = record.current_order_uri.as_deref() else {
            return;
        };
        if let Err(e) = self.coordinator.discard_order(order_uri) {
            warn!(order_uri, error = %e, "failed to discard order handles");
        }
    }

    async fn is_due(&self, record: &ManagedCertificate) -> bool {
        let Some(path) = record.certificate_path.as_deref().filter(|p| !p.is_empty()) else {
            return true;
        };
        let der = match tokio::fs::read(path).await {
            Ok(der) => der,
            Err(_) => return true,
        };
        Certificate::from_pkcs12(&der, "")
            .and_then(|cert| cert.should_renew(self.settings.renewal_interval_days))
            .unwrap_or(true)
    }

    async fn attempt(
        &self,
        record: &mut ManagedCertificate,
        cancel: &CancellationToken,
    ) -> Result<Attempt> {
        let diagnostics = self.run_diagnostics(record, false).await;
        let failed: Vec<&str> = diagnostics
            .iter()
            .filter(|m| !m.is_ok)
            .map(|m| m.message.as_str())
            .collect();
        if !failed.is_empty() {
            return Ok(Attempt::Failed(failed.join(" ")));
        }

        let config = record.request_config.clone();
        let order = self
            .coordinator
            .begin_order(&config, record.current_order_uri.as_deref(), cancel)
            .await?;
        if let Some(message) = order.failure() {
            return Ok(Attempt::Failed(message.to_string()));
        }
        let Some(order_uri) = order.order_uri.clone() else {
            return Ok(Attempt::Failed("Order has no URI.".into()));
        };
        record.current_order_uri = Some(order_uri.clone());
        *record = self.store.upsert(record.clone(), true).await?;

        for auth in order.authorizations.iter().filter(|a| !a.is_validated) {
            let challenge_type = record
                .challenge_config(Some(&auth.identifier.dns))
                .challenge_type();
            let Some(item) = auth.challenge(&challenge_type) else {
                return Ok(Attempt::Failed(format!(
                    "The CA did not offer a {} challenge for {}.",
                    challenge_type, auth.identifier.dns
                )));
            };

            let submitted = self.coordinator.submit_challenge(item, cancel).await?;
            if !submitted.is_ok {
                return Ok(Attempt::Failed(submitted.message));
            }

            let awaited = self
                .coordinator
                .await_authorization(auth, &challenge_type, cancel)
                .await?;
            if awaited.is_failure {
                return Ok(Attempt::Failed(
                    awaited
                        .authorization_error
                        .unwrap_or_else(|| "Authorization failed.".into()),
                ));
            }
        }

        let path = self
            .coordinator
            .finalize_order(&order_uri, &config, cancel)
            .await?;
        Ok(Attempt::Issued(path))
    }

    async fn fail(
        &self,
        record: ManagedCertificate,
        message: String,
    ) -> Result<CertificateRequestResult> {
        warn!(error = %message, "certificate renewal failed");
        let record = self
            .update_status(record, RequestState::Error, Some(&message))
            .await?;
        Ok(CertificateRequestResult {
            managed_certificate_id: record.id,
            is_success: false,
            message,
            pfx_path: None,
            deployment_steps: Vec::new(),
        })
    }
}
