//! 單張證書的 ACME 下單流程：建立或續用訂單、提交挑戰、等待授權、完成訂單並輸出證書檔。
//!
//! CA 回傳的訂單、授權與挑戰物件都留在協調器內部，對外只以 URI 作為 id 引用，
//! 呼叫端拿到的 [`PendingOrder`] 等資料模型因此可以任意複製與序列化。

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Instant,
};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    account::{Account, AccountError, AccountStore},
    certificate::{Certificate, CertificateError},
    challenge::{
        dns_record_name, dns_txt_value, http_resource_path, http_resource_uri, strip_wildcard,
        ChallengeResource, ChallengeStatus, ChallengeType,
    },
    config::{Cancelled, CoreSettings},
    csr::{CsrError, CSR},
    key_pair::{KeyAlgorithm, KeyError, KeyPair},
    models::{
        AuthorizationChallengeItem, IdentifierItem, ManagedCertificate, PendingAuthorization,
        PendingOrder, RequestConfig, StatusMessage,
    },
    order::{
        AccountResourceStatus, AuthorizationResource, AuthorizationStatus, OrderResource,
        OrderStatus, ACCOUNT_DOES_NOT_EXIST,
    },
    session::{CaSession, SessionConnector, SessionError},
};

/// 新帳號金鑰與輪替金鑰使用的演算法。
const ACCOUNT_KEY_ALGORITHM: KeyAlgorithm = KeyAlgorithm::Es256;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("CA session error: {0}")]
    Session(#[from] SessionError),
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
    #[error("Request has no domains")]
    NoDomains,
    #[error("Unknown order or authorization: {0}")]
    UnknownHandle(String),
    #[error("Certificate Request did not complete. Order did not reach Ready status in the time allowed.")]
    OrderNotReady,
    #[error("Failed to finalize certificate order: {0}")]
    Finalize(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("Lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// 帳號在 CA 端的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    /// 尚未建立連線階段。
    None,
    Ok,
    TosRequired,
    Revoked,
    Deactivated,
    DoesNotExist,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ok => "ok",
            Self::TosRequired => "tos-required",
            Self::Revoked => "account-revoked",
            Self::Deactivated => "account-deactivated",
            Self::DoesNotExist => "account-doesnotexist",
            Self::Error => "account-error",
        }
    }
}

struct SessionState {
    session: Arc<dyn CaSession>,
    account: Account,
    started: Instant,
}

pub struct AcmeOrderCoordinator {
    settings: Arc<CoreSettings>,
    accounts: AccountStore,
    connector: Arc<dyn SessionConnector>,
    state: Mutex<Option<SessionState>>,
    orders: RwLock<HashMap<String, OrderResource>>,
    authorizations: RwLock<HashMap<String, AuthorizationResource>>,
    challenges: RwLock<HashMap<String, ChallengeResource>>,
}

/// 轉為 ASCII（IDN）、小寫並去除重複，主網域排第一。
pub fn normalize_domains(config: &RequestConfig) -> Result<Vec<String>> {
    let mut domains: Vec<String> = Vec::new();
    let candidates =
        std::iter::once(&config.primary_domain).chain(config.subject_alternative_names.iter());

    for raw in candidates {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (prefix, host) = match raw.strip_prefix("*.") {
            Some(host) => ("*.", host),
            None => ("", raw),
        };
        let ascii = idna::domain_to_ascii(host)
            .map_err(|_| CoordinatorError::InvalidDomain(raw.to_string()))?;
        let domain = format!("{prefix}{}", ascii.to_lowercase());
        if !domains.contains(&domain) {
            domains.push(domain);
        }
    }

    if domains.is_empty() {
        return Err(CoordinatorError::NoDomains);
    }
    Ok(domains)
}

impl AcmeOrderCoordinator {
    pub fn new(
        settings: Arc<CoreSettings>,
        accounts: AccountStore,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        Self {
            settings,
            accounts,
            connector,
            state: Mutex::new(None),
            orders: RwLock::new(HashMap::new()),
            authorizations: RwLock::new(HashMap::new()),
            challenges: RwLock::new(HashMap::new()),
        }
    }

    /// 載入（或建立）帳號金鑰並連線到 CA 目錄。
    ///
    /// 已儲存的金鑰無法解析時回傳錯誤，不會以新金鑰取代。
    ///
    /// # Errors
    ///
    /// 帳號設定無法讀取或金鑰損毀時返回 [`CoordinatorError::Account`]；
    /// 無法取得 CA 目錄時返回 [`CoordinatorError::Session`]。
    pub async fn init_session(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = Some(self.connect().await?);
        Ok(())
    }

    async fn connect(&self) -> Result<SessionState> {
        let account = match self.accounts.load().await? {
            Some(account) => account,
            None => {
                info!("no account key found, generating a new one");
                self.accounts.create(ACCOUNT_KEY_ALGORITHM).await?
            }
        };
        let session = self
            .connector
            .connect(account.key_pair.clone(), account.settings.account_uri.clone())
            .await?;
        debug!(directory = %self.settings.directory_url, "CA session established");
        Ok(SessionState {
            session,
            account,
            started: Instant::now(),
        })
    }

    async fn session(&self) -> Result<Arc<dyn CaSession>> {
        let mut state = self.state.lock().await;
        if let Some(current) = state.as_ref() {
            return Ok(current.session.clone());
        }
        let fresh = self.connect().await?;
        let session = fresh.session.clone();
        *state = Some(fresh);
        Ok(session)
    }

    /// 連線階段超過最長壽命時重新建立，避免使用過期的 nonce。
    async fn fresh_session(&self) -> Result<Arc<dyn CaSession>> {
        let mut state = self.state.lock().await;
        match state.as_ref() {
            Some(current) if current.started.elapsed() < self.settings.session_max_age() => {
                return Ok(current.session.clone());
            }
            Some(_) => info!("CA session expired, re-initializing"),
            None => {}
        }
        let fresh = self.connect().await?;
        let session = fresh.session.clone();
        *state = Some(fresh);
        Ok(session)
    }

    /// 以信箱註冊帳號（同意服務條款），並將帳號資料封存與保存。
    pub async fn register_account(&self, email: &str) -> Result<()> {
        self.session().await?;
        let mut state = self.state.lock().await;
        let current = state.as_mut().ok_or(CoordinatorError::Session(SessionError::NoAccount))?;

        let created = current.session.new_account(Some(email), false).await?;
        info!(account_uri = %created.location, "ACME account registered");

        let settings = &mut current.account.settings;
        settings.account_email = Some(email.to_string());
        settings.account_uri = Some(created.location);
        self.accounts
            .archive(&current.account.settings, &current.account.key_pair)
            .await?;
        self.accounts.save_settings(&current.account.settings).await?;
        Ok(())
    }

    /// 查詢帳號狀態；連線失敗視為正常，避免網路問題被誤判為帳號問題。
    pub async fn account_status(&self) -> AccountStatus {
        let session = match self.state.lock().await.as_ref() {
            Some(current) => current.session.clone(),
            None => return AccountStatus::None,
        };

        let resource = match session.account_uri() {
            Some(_) => session.fetch_account().await,
            None => session.new_account(None, true).await.map(|l| l.resource),
        };

        match resource {
            Ok(account) => match account.status {
                AccountResourceStatus::Valid
                    if account.terms_of_service_agreed == Some(false) =>
                {
                    AccountStatus::TosRequired
                }
                AccountResourceStatus::Valid => AccountStatus::Ok,
                AccountResourceStatus::Revoked => AccountStatus::Revoked,
                AccountResourceStatus::Deactivated => AccountStatus::Deactivated,
            },
            Err(e) if e.is_connectivity() => {
                warn!(error = %e, "could not reach CA to check account status");
                AccountStatus::Ok
            }
            Err(e) => match e.problem() {
                Some(problem) if problem.is(ACCOUNT_DOES_NOT_EXIST) => AccountStatus::DoesNotExist,
                _ => {
                    warn!(error = %e, "account status check failed");
                    AccountStatus::Error
                }
            },
        }
    }

    pub async fn is_account_registered(&self) -> Result<bool> {
        Ok(self.accounts.load_settings().await?.is_registered())
    }

    pub async fn contact_registrations(&self) -> Result<Vec<String>> {
        Ok(self
            .accounts
            .load_settings()
            .await?
            .account_email
            .into_iter()
            .filter(|email| !email.is_empty())
            .collect())
    }

    /// 建立或續用訂單並回傳每個網域的待處理授權。
    ///
    /// 除了取消以外，所有失敗都以帶有一個失敗授權的 [`PendingOrder`] 回報。
    ///
    /// # 參數
    ///
    /// - `config`: 主網域與 SAN，會先轉為 ASCII 並去除重複。
    /// - `resume_uri`: 先前的訂單位址；訂單已失效或無法取得時改為建立新訂單。
    /// - `cancel`: 取消重試等待。
    ///
    /// # Errors
    ///
    /// 僅在取消時返回 [`CoordinatorError::Cancelled`]。
    pub async fn begin_order(
        &self,
        config: &RequestConfig,
        resume_uri: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PendingOrder> {
        match self.try_begin_order(config, resume_uri, cancel).await {
            Ok(order) => Ok(order),
            Err(CoordinatorError::Cancelled(c)) => Err(c.into()),
            Err(e) => {
                let detail = match &e {
                    CoordinatorError::Session(session) => session.detail(),
                    other => other.to_string(),
                };
                warn!(primary = %config.primary_domain, error = %e, "failed to begin certificate order");
                Ok(PendingOrder::failed(format!(
                    "Failed to begin certificate order: {detail}"
                )))
            }
        }
    }

    async fn try_begin_order(
        &self,
        config: &RequestConfig,
        resume_uri: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PendingOrder> {
        let domains = normalize_domains(config)?;
        let session = self.fresh_session().await?;

        let resumed = match resume_uri {
            Some(uri) => match session.fetch_order(uri).await {
                Ok(order) if order.status != OrderStatus::Invalid => {
                    info!(order_uri = %uri, "resuming existing order");
                    Some((uri.to_string(), order))
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(order_uri = %uri, error = %e, "cannot resume order, creating a new one");
                    None
                }
            },
            None => None,
        };

        let (order_uri, order) = match resumed {
            Some(found) => found,
            None => self.create_order(session.as_ref(), &domains, cancel).await?,
        };

        let is_pending_authorizations = order.status != OrderStatus::Ready;
        let auth_uris = order.authorizations.clone();
        self.orders
            .write()
            .map_err(|_| CoordinatorError::LockPoisoned)?
            .insert(order_uri.clone(), order);

        let mut authorizations = Vec::with_capacity(auth_uris.len());
        for auth_uri in &auth_uris {
            let pending = match session.fetch_authorization(auth_uri).await {
                Ok(resource) => {
                    self.pending_authorization(session.as_ref(), auth_uri, &order_uri, resource)
                }
                Err(e) => Err(e.into()),
            };
            match pending {
                Ok(pending) => authorizations.push(pending),
                Err(e) => {
                    self.discard_order(&order_uri)?;
                    return Err(e);
                }
            }
        }

        Ok(PendingOrder {
            order_uri: Some(order_uri),
            is_pending_authorizations,
            authorizations,
        })
    }

    async fn create_order(
        &self,
        session: &dyn CaSession,
        domains: &[String],
        cancel: &CancellationToken,
    ) -> Result<(String, OrderResource)> {
        let policy = self.settings.retry.order_creation;
        let mut attempt = 1;
        loop {
            match session.new_order(domains).await {
                Ok(created) => {
                    info!(order_uri = %created.location, domains = ?domains, "order created");
                    return Ok((created.location, created.resource));
                }
                Err(e) if attempt < policy.attempts => {
                    warn!(attempt, error = %e, "order creation failed, retrying");
                    attempt += 1;
                    policy.wait(cancel).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn pending_authorization(
        &self,
        session: &dyn CaSession,
        auth_uri: &str,
        order_uri: &str,
        resource: AuthorizationResource,
    ) -> Result<PendingAuthorization> {
        let domain = resource.domain();
        let is_validated = resource.status == AuthorizationStatus::Valid
            || resource
                .challenges
                .iter()
                .any(|c| c.status == ChallengeStatus::Valid);

        let mut challenges = Vec::new();
        for challenge in resource
            .challenges
            .iter()
            .filter(|c| c.challenge_type.is_supported())
        {
            let key_authorization = session.key_authorization(&challenge.token)?;
            let item = match challenge.challenge_type {
                ChallengeType::Http01 => AuthorizationChallengeItem {
                    challenge_type: ChallengeType::Http01,
                    key: challenge.token.clone(),
                    value: key_authorization,
                    resource_uri: Some(http_resource_uri(&domain, &challenge.token)),
                    resource_path: Some(http_resource_path(&challenge.token)),
                    is_validated: challenge.status == ChallengeStatus::Valid,
                    challenge_id: challenge.url.clone(),
                },
                _ => AuthorizationChallengeItem {
                    challenge_type: ChallengeType::Dns01,
                    key: dns_record_name(&domain),
                    value: dns_txt_value(&key_authorization),
                    resource_uri: None,
                    resource_path: None,
                    is_validated: challenge.status == ChallengeStatus::Valid,
                    challenge_id: challenge.url.clone(),
                },
            };
            challenges.push(item);
        }

        {
            let mut known = self
                .challenges
                .write()
                .map_err(|_| CoordinatorError::LockPoisoned)?;
            for challenge in &resource.challenges {
                known.insert(challenge.url.clone(), challenge.clone());
            }
        }
        self.authorizations
            .write()
            .map_err(|_| CoordinatorError::LockPoisoned)?
            .insert(auth_uri.to_string(), resource.clone());

        Ok(PendingAuthorization {
            identifier: IdentifierItem {
                dns: domain,
                status: Some(status_name(resource.status).to_string()),
                is_authorization_pending: !is_validated,
                validation_error: None,
                validation_error_type: None,
            },
            challenges,
            is_validated,
            is_failure: false,
            authorization_error: None,
            authorization_id: auth_uri.to_string(),
            order_uri: Some(order_uri.to_string()),
        })
    }

    /// 通知 CA 開始驗證挑戰並輪詢結果。
    pub async fn submit_challenge(
        &self,
        item: &AuthorizationChallengeItem,
        cancel: &CancellationToken,
    ) -> Result<StatusMessage> {
        if item.is_validated {
            return Ok(StatusMessage::ok("Validated"));
        }
        let session = self.session().await?;

        let mut challenge = match session.trigger_challenge(&item.challenge_id).await {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!(challenge = %item.challenge_id, error = %e, "challenge submission failed");
                return Ok(StatusMessage::error(format!(
                    "Submit Challenge failed: {}",
                    e.detail()
                )));
            }
        };

        let policy = self.settings.retry.challenge_submission;
        let mut attempt = 0;
        while challenge.status.is_in_progress() && attempt < policy.attempts {
            attempt += 1;
            policy.wait(cancel).await?;
            match session.fetch_challenge(&item.challenge_id).await {
                Ok(latest) => challenge = latest,
                Err(e) => {
                    return Ok(StatusMessage::error(format!(
                        "Submit Challenge failed: {}",
                        e.detail()
                    )))
                }
            }
        }

        self.challenges
            .write()
            .map_err(|_| CoordinatorError::LockPoisoned)?
            .insert(item.challenge_id.clone(), challenge.clone());

        Ok(match challenge.status {
            ChallengeStatus::Valid => StatusMessage::ok("Submitted"),
            status => StatusMessage::error(match &challenge.error {
                Some(problem) => problem.detail().to_string(),
                None => format!("Challenge {} is {:?}", item.challenge_type, status).to_lowercase(),
            }),
        })
    }

    /// 輪詢授權直到離開 pending，回傳更新後的授權。
    pub async fn await_authorization(
        &self,
        pending: &PendingAuthorization,
        challenge_type: &ChallengeType,
        cancel: &CancellationToken,
    ) -> Result<PendingAuthorization> {
        let session = self.session().await?;
        let auth_uri = &pending.authorization_id;
        let mut latest = self
            .authorizations
            .read()
            .map_err(|_| CoordinatorError::LockPoisoned)?
            .get(auth_uri)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownHandle(auth_uri.clone()))?;

        let policy = self.settings.retry.authorization;
        for attempt in 1..=policy.attempts {
            match session.fetch_authorization(auth_uri).await {
                Ok(resource) => latest = resource,
                Err(e) => warn!(authorization = %auth_uri, error = %e, "authorization poll failed"),
            }
            if latest.status != AuthorizationStatus::Pending {
                break;
            }
            if attempt < policy.attempts {
                policy.wait(cancel).await?;
            }
        }

        self.authorizations
            .write()
            .map_err(|_| CoordinatorError::LockPoisoned)?
            .insert(auth_uri.clone(), latest.clone());

        let mut result = pending.clone();
        if latest.status == AuthorizationStatus::Valid {
            result.identifier.status = Some("valid".into());
            result.identifier.is_authorization_pending = false;
            result.is_validated = true;
            result.is_failure = false;
            return Ok(result);
        }

        let error = self
            .authorization_failure_detail(session.as_ref(), &latest, challenge_type)
            .await;
        warn!(authorization = %auth_uri, error = %error, "authorization did not validate");
        result.identifier.status = Some("invalid".into());
        result.identifier.validation_error = Some("Failed".into());
        result.identifier.validation_error_type = Some("Error".into());
        result.is_validated = false;
        result.is_failure = true;
        result.authorization_error = Some(error);
        Ok(result)
    }

    async fn authorization_failure_detail(
        &self,
        session: &dyn CaSession,
        resource: &AuthorizationResource,
        challenge_type: &ChallengeType,
    ) -> String {
        const GENERIC: &str = "The authorization did not complete validation.";

        let Some(url) = resource
            .challenges
            .iter()
            .find(|c| &c.challenge_type == challenge_type)
            .map(|c| c.url.clone())
        else {
            return GENERIC.to_string();
        };

        match session.fetch_challenge(&url).await {
            Ok(challenge) => challenge
                .error
                .map(|problem| problem.to_string())
                .unwrap_or_else(|| GENERIC.to_string()),
            Err(e) => {
                warn!(error = %e, "Failed to determine error message for failed authorization.");
                GENERIC.to_string()
            }
        }
    }

    /// 等待訂單就緒、以新產生的金鑰送出 CSR、下載證書並輸出 PFX 與 PEM，回傳 PFX 路徑。
    ///
    /// 無論成功與否，結束後都會丟棄此訂單的控制代碼。
    ///
    /// # 參數
    ///
    /// - `order_uri`: [`begin_order`](Self::begin_order) 回傳的訂單位址。
    /// - `config`: 用於產生 CSR 的網域與金鑰演算法。
    ///
    /// # Errors
    ///
    /// - 訂單在允許的輪詢次數內未就緒時返回 [`CoordinatorError::OrderNotReady`]。
    /// - CA 拒絕 CSR 或未產出證書時返回 [`CoordinatorError::Finalize`]，內含 CA 的說明。
    /// - 取消時返回 [`CoordinatorError::Cancelled`]；寫入證書檔失敗時返回 [`CoordinatorError::Io`]。
    pub async fn finalize_order(
        &self,
        order_uri: &str,
        config: &RequestConfig,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let result = self.try_finalize_order(order_uri, config, cancel).await;
        self.discard_order(order_uri)?;
        result
    }

    async fn try_finalize_order(
        &self,
        order_uri: &str,
        config: &RequestConfig,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let session = self.session().await?;
        let policy = self.settings.retry.order_ready;

        let mut order = None;
        for attempt in 1..=policy.attempts {
            let latest = session.fetch_order(order_uri).await?;
            match latest.status {
                OrderStatus::Ready => {
                    order = Some(latest);
                    break;
                }
                OrderStatus::Invalid => break,
                _ if attempt < policy.attempts => policy.wait(cancel).await?,
                _ => {}
            }
        }
        let order = order.ok_or(CoordinatorError::OrderNotReady)?;

        let domains = normalize_domains(config)?;
        let primary = domains[0].clone();
        let key_pair = KeyPair::generate(config.key_algorithm()?)?;
        let csr = domains
            .iter()
            .fold(CSR::new().common_name(&primary), |csr, d| csr.set_san(d))
            .build_der(&key_pair)?;

        let mut order = session
            .finalize(&order.finalize, &csr)
            .await
            .map_err(|e| CoordinatorError::Finalize(e.detail()))?;

        let mut attempt = 0;
        while order.status == OrderStatus::Processing && attempt < policy.attempts {
            attempt += 1;
            policy.wait(cancel).await?;
            order = session
                .fetch_order(order_uri)
                .await
                .map_err(|e| CoordinatorError::Finalize(e.detail()))?;
        }

        let certificate_uri = match (&order.status, &order.certificate) {
            (OrderStatus::Valid, Some(uri)) => uri.clone(),
            _ => {
                let detail = order
                    .error
                    .as_ref()
                    .map(|p| p.detail().to_string())
                    .unwrap_or_else(|| "order did not produce a certificate".to_string());
                return Err(CoordinatorError::Finalize(detail));
            }
        };

        let pem = session
            .download_certificate(&certificate_uri)
            .await
            .map_err(|e| CoordinatorError::Finalize(e.detail()))?;
        let certificate = Certificate::from_chain_pem(&pem)?;
        let path = self.export(&primary, &certificate, &key_pair).await?;
        info!(order_uri, path = %path.display(), "certificate issued");
        Ok(path)
    }

    /// 丟棄訂單及其授權、挑戰的控制代碼；未知的訂單直接略過。
    pub fn discard_order(&self, order_uri: &str) -> Result<()> {
        let order = self
            .orders
            .write()
            .map_err(|_| CoordinatorError::LockPoisoned)?
            .remove(order_uri);
        let Some(order) = order else {
            return Ok(());
        };

        let removed: Vec<AuthorizationResource> = {
            let mut authorizations = self
                .authorizations
                .write()
                .map_err(|_| CoordinatorError::LockPoisoned)?;
            order
                .authorizations
                .iter()
                .filter_map(|uri| authorizations.remove(uri))
                .collect()
        };
        let mut challenges = self
            .challenges
            .write()
            .map_err(|_| CoordinatorError::LockPoisoned)?;
        for authorization in &removed {
            for challenge in &authorization.challenges {
                challenges.remove(&challenge.url);
            }
        }
        debug!(order_uri, "order handles discarded");
        Ok(())
    }

    /// 目前保留的訂單、授權與挑戰控制代碼數量。
    #[cfg(test)]
    pub(crate) fn handle_counts(&self) -> (usize, usize, usize) {
        (
            self.orders.read().map(|m| m.len()).unwrap_or_default(),
            self.authorizations.read().map(|m| m.len()).unwrap_or_default(),
            self.challenges.read().map(|m| m.len()).unwrap_or_default(),
        )
    }

    async fn export(
        &self,
        primary: &str,
        certificate: &Certificate,
        key_pair: &KeyPair,
    ) -> Result<PathBuf> {
        let expiry = certificate.not_after()?;
        let cert_id = format!(
            "{}_{}",
            expiry.format("%Y%m%d"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = self.settings.assets_path.join(primary.replace('*', "_"));
        tokio::fs::create_dir_all(&dir).await?;

        let friendly_name = format!(
            "{} [certfleet] - {} to {}",
            primary,
            Utc::now().format("%Y-%m-%d"),
            expiry.format("%Y-%m-%d")
        );
        let pfx_path = dir.join(format!("{cert_id}.pfx"));
        tokio::fs::write(&pfx_path, certificate.to_pkcs12(key_pair, &friendly_name)?).await?;
        tokio::fs::write(
            dir.join(format!("{cert_id}.pem")),
            certificate.to_pem_bundle(key_pair)?,
        )
        .await?;
        Ok(pfx_path)
    }

    /// 撤銷受管證書目前的證書；失敗只回報，不重試。
    pub async fn revoke_certificate(&self, record: &ManagedCertificate) -> StatusMessage {
        match self.try_revoke(record).await {
            Ok(()) => {
                info!(managed_certificate = %record.id, "certificate revoked");
                StatusMessage::ok("Certificate revoked")
            }
            Err(e) => StatusMessage::error(format!("Failed to revoke certificate: {e}")),
        }
    }

    async fn try_revoke(&self, record: &ManagedCertificate) -> Result<()> {
        let path = record
            .certificate_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no certificate file"))?;
        let der = tokio::fs::read(path).await?;
        let leaf = Certificate::from_pkcs12(&der, "")?.leaf_der()?;
        self.session().await?.revoke_certificate(&leaf, None).await?;
        Ok(())
    }

    /// 輪替帳號金鑰：先封存舊金鑰，CA 接受後才保存新金鑰；任何失敗都保留舊金鑰。
    ///
    /// # Errors
    ///
    /// 尚未建立帳號時返回 [`CoordinatorError::Session`]；封存或保存失敗時返回
    /// [`CoordinatorError::Account`]；CA 拒絕時返回 CA 的錯誤說明。
    pub async fn change_account_key(&self) -> Result<()> {
        self.session().await?;
        let mut state = self.state.lock().await;
        let current = state.as_mut().ok_or(CoordinatorError::Session(SessionError::NoAccount))?;

        let new_key = KeyPair::generate(ACCOUNT_KEY_ALGORITHM)?;
        self.accounts
            .archive(&current.account.settings, &current.account.key_pair)
            .await?;
        current.session.change_key(&new_key).await?;

        let mut settings = current.account.settings.clone();
        settings.account_key = Some(String::from_utf8_lossy(&new_key.to_pem()?).into_owned());
        self.accounts.save_settings(&settings).await?;
        current.account.settings = settings;
        current.account.key_pair = new_key;
        info!("account key changed");
        Ok(())
    }
}

fn status_name(status: AuthorizationStatus) -> &'static str {
    match status {
        AuthorizationStatus::Pending => "pending",
        AuthorizationStatus::Valid => "valid",
        AuthorizationStatus::Invalid => "invalid",
        AuthorizationStatus::Deactivated => "deactivated",
        AuthorizationStatus::Expired => "expired",
        AuthorizationStatus::Revoked => "revoked",
    }
}

/// 主網域的 ASCII 形式，用於輸出目錄與日誌。
pub fn primary_domain_ascii(config: &RequestConfig) -> Result<String> {
    Ok(strip_wildcard(&normalize_domains(config)?[0]).to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use crate::{
        certificate::test_support::issue_from_csr,
        challenge::{ChallengeResource, ChallengeStatus, ChallengeType},
        config::{CoreSettings, RetryPolicy, RetrySettings},
        key_pair::KeyPair,
        order::{
            AccountResource, AccountResourceStatus, AuthorizationResource, AuthorizationStatus,
            OrderResource, OrderStatus, Problem,
        },
        payload::Identifier,
        session::{CaSession, Located, Result, SessionConnector, SessionError},
    };

    /// 挑戰被觸發後 CA 給出的結果。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Verdict {
        Valid,
        Invalid,
        /// 永遠停在 pending。
        Stuck,
    }

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub(crate) orders: HashMap<String, OrderResource>,
        pub(crate) auths: HashMap<String, AuthorizationResource>,
        pub(crate) order_failures: u32,
        pub(crate) new_order_calls: u32,
        pub(crate) auth_fetches: u32,
        pub(crate) revoked: Vec<Vec<u8>>,
        pub(crate) csr: Option<Vec<u8>>,
        pub(crate) account: Option<AccountResource>,
        pub(crate) account_problem: Option<Problem>,
        pub(crate) key_changes: u32,
        pub(crate) key_change_problem: Option<Problem>,
        pub(crate) never_ready: bool,
    }

    /// 記憶體內的假 CA，同時扮演連線工廠。
    pub(crate) struct FakeCa {
        pub(crate) state: Mutex<FakeState>,
        pub(crate) verdict: Mutex<Verdict>,
        pub(crate) connects: AtomicUsize,
        account_uri: Mutex<Option<String>>,
    }

    pub(crate) const BASE: &str = "https://ca.test";

    impl FakeCa {
        pub(crate) fn new(verdict: Verdict) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(FakeState::default()),
                verdict: Mutex::new(verdict),
                connects: AtomicUsize::new(0),
                account_uri: Mutex::new(None),
            })
        }

        /// 預先放入一張訂單，每個網域一個授權；`valid` 決定授權是否已通過。
        pub(crate) fn seed_order(&self, domains: &[&str], valid: bool) -> String {
            let mut state = self.state.lock().unwrap();
            let id = state.orders.len() + 1;
            let order_uri = format!("{BASE}/order/{id}");
            let mut authorizations = Vec::new();
            for (i, domain) in domains.iter().enumerate() {
                let auth_uri = format!("{order_uri}/authz/{i}");
                let status = if valid {
                    ChallengeStatus::Valid
                } else {
                    ChallengeStatus::Pending
                };
                let (value, wildcard) = match domain.strip_prefix("*.") {
                    Some(rest) => (rest.to_string(), true),
                    None => (domain.to_string(), false),
                };
                let challenges = [ChallengeType::Http01, ChallengeType::Dns01]
                    .into_iter()
                    .chain(std::iter::once(ChallengeType::Other("tls-alpn-01".into())))
                    .map(|t| ChallengeResource {
                        url: format!("{auth_uri}/{}", t.as_str()),
                        challenge_type: t,
                        status,
                        token: format!("token-{id}-{i}"),
                        validated: None,
                        error: None,
                    })
                    .collect();
                state.auths.insert(
                    auth_uri.clone(),
                    AuthorizationResource {
                        identifier: Identifier::dns(value),
                        status: if valid {
                            AuthorizationStatus::Valid
                        } else {
                            AuthorizationStatus::Pending
                        },
                        expires: None,
                        challenges,
                        wildcard,
                    },
                );
                authorizations.push(auth_uri);
            }
            state.orders.insert(
                order_uri.clone(),
                OrderResource {
                    status: if valid {
                        OrderStatus::Ready
                    } else {
                        OrderStatus::Pending
                    },
                    expires: None,
                    identifiers: domains.iter().map(|d| Identifier::dns(*d)).collect(),
                    authorizations,
                    finalize: format!("{order_uri}/finalize"),
                    certificate: None,
                    error: None,
                },
            );
            order_uri
        }

        fn auth_for_challenge(state: &FakeState, url: &str) -> Option<String> {
            state
                .auths
                .iter()
                .find(|(_, a)| a.challenges.iter().any(|c| c.url == url))
                .map(|(uri, _)| uri.clone())
        }

        fn not_found(what: &str) -> SessionError {
            SessionError::Problem(Problem {
                problem_type: "urn:ietf:params:acme:error:malformed".into(),
                detail: Some(format!("{what} not found")),
                status: Some(404),
            })
        }
    }

    #[async_trait]
    impl CaSession for FakeCa {
        fn account_uri(&self) -> Option<String> {
            self.account_uri.lock().unwrap().clone()
        }

        fn key_authorization(&self, token: &str) -> Result<String> {
            Ok(format!("{token}.thumbprint"))
        }

        fn terms_of_service(&self) -> Option<String> {
            Some(format!("{BASE}/tos"))
        }

        async fn new_account(
            &self,
            email: Option<&str>,
            _only_existing: bool,
        ) -> Result<Located<AccountResource>> {
            let state = self.state.lock().unwrap();
            if let Some(problem) = &state.account_problem {
                return Err(SessionError::Problem(problem.clone()));
            }
            let location = format!("{BASE}/acct/1");
            *self.account_uri.lock().unwrap() = Some(location.clone());
            Ok(Located {
                location,
                resource: state.account.clone().unwrap_or(AccountResource {
                    status: AccountResourceStatus::Valid,
                    contact: email.map(|e| vec![format!("mailto:{e}")]).unwrap_or_default(),
                    terms_of_service_agreed: Some(true),
                }),
            })
        }

        async fn fetch_account(&self) -> Result<AccountResource> {
            self.new_account(None, true).await.map(|l| l.resource)
        }

        async fn new_order(&self, domains: &[String]) -> Result<Located<OrderResource>> {
            {
                let mut state = self.state.lock().unwrap();
                state.new_order_calls += 1;
                if state.order_failures > 0 {
                    state.order_failures -= 1;
                    return Err(SessionError::Problem(Problem {
                        problem_type: "urn:ietf:params:acme:error:serverInternal".into(),
                        detail: Some("Service busy".into()),
                        status: Some(503),
                    }));
                }
            }
            let refs: Vec<&str> = domains.iter().map(String::as_str).collect();
            let location = self.seed_order(&refs, false);
            let resource = self.fetch_order(&location).await?;
            Ok(Located { location, resource })
        }

        async fn fetch_order(&self, uri: &str) -> Result<OrderResource> {
            let mut state = self.state.lock().unwrap();
            let all_valid = {
                let order = state.orders.get(uri).ok_or_else(|| Self::not_found("order"))?;
                order
                    .authorizations
                    .iter()
                    .all(|a| state.auths.get(a).is_some_and(|a| a.status == AuthorizationStatus::Valid))
            };
            let never_ready = state.never_ready;
            let order = state
                .orders
                .get_mut(uri)
                .ok_or_else(|| Self::not_found("order"))?;
            if order.status == OrderStatus::Pending && all_valid && !never_ready {
                order.status = OrderStatus::Ready;
            }
            Ok(order.clone())
        }

        async fn fetch_authorization(&self, uri: &str) -> Result<AuthorizationResource> {
            let mut state = self.state.lock().unwrap();
            state.auth_fetches += 1;
            state
                .auths
                .get(uri)
                .cloned()
                .ok_or_else(|| Self::not_found("authorization"))
        }

        async fn fetch_challenge(&self, uri: &str) -> Result<ChallengeResource> {
            let state = self.state.lock().unwrap();
            let auth = Self::auth_for_challenge(&state, uri)
                .and_then(|a| state.auths.get(&a).cloned())
                .ok_or_else(|| Self::not_found("challenge"))?;
            auth.challenges
                .into_iter()
                .find(|c| c.url == uri)
                .ok_or_else(|| Self::not_found("challenge"))
        }

        async fn trigger_challenge(&self, uri: &str) -> Result<ChallengeResource> {
            let verdict = *self.verdict.lock().unwrap();
            {
                let mut state = self.state.lock().unwrap();
                let auth_uri =
                    Self::auth_for_challenge(&state, uri).ok_or_else(|| Self::not_found("challenge"))?;
                let auth = state
                    .auths
                    .get_mut(&auth_uri)
                    .ok_or_else(|| Self::not_found("authorization"))?;
                let challenge = auth
                    .challenges
                    .iter_mut()
                    .find(|c| c.url == uri)
                    .ok_or_else(|| Self::not_found("challenge"))?;
                match verdict {
                    Verdict::Valid => {
                        challenge.status = ChallengeStatus::Valid;
                        auth.status = AuthorizationStatus::Valid;
                    }
                    Verdict::Invalid => {
                        challenge.status = ChallengeStatus::Invalid;
                        challenge.error = Some(Problem {
                            problem_type: "urn:ietf:params:acme:error:unauthorized".into(),
                            detail: Some("Invalid response from http://example.com".into()),
                            status: Some(403),
                        });
                        auth.status = AuthorizationStatus::Invalid;
                    }
                    Verdict::Stuck => {}
                }
            }
            // 觸發當下仍回報 processing，驗證結果需輪詢取得
            let mut challenge = self.fetch_challenge(uri).await?;
            if verdict != Verdict::Stuck {
                challenge.status = ChallengeStatus::Processing;
            }
            Ok(challenge)
        }

        async fn finalize(&self, finalize_uri: &str, csr_der: &[u8]) -> Result<OrderResource> {
            let mut state = self.state.lock().unwrap();
            state.csr = Some(csr_der.to_vec());
            let order_uri = finalize_uri.trim_end_matches("/finalize").to_string();
            let order = state
                .orders
                .get_mut(&order_uri)
                .ok_or_else(|| Self::not_found("order"))?;
            order.status = OrderStatus::Processing;
            order.certificate = Some(format!("{order_uri}/cert"));
            let processing = order.clone();
            order.status = OrderStatus::Valid;
            Ok(processing)
        }

        async fn download_certificate(&self, _uri: &str) -> Result<String> {
            let state = self.state.lock().unwrap();
            let csr = state.csr.as_ref().ok_or_else(|| Self::not_found("certificate"))?;
            Ok(issue_from_csr(csr, 90))
        }

        async fn revoke_certificate(&self, cert_der: &[u8], _reason: Option<u8>) -> Result<()> {
            self.state.lock().unwrap().revoked.push(cert_der.to_vec());
            Ok(())
        }

        async fn change_key(&self, _new_key: &KeyPair) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(problem) = &state.key_change_problem {
                return Err(SessionError::Problem(problem.clone()));
            }
            state.key_changes += 1;
            Ok(())
        }
    }

    pub(crate) struct FakeConnector(pub(crate) Arc<FakeCa>);

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(
            &self,
            _key_pair: KeyPair,
            account_uri: Option<String>,
        ) -> Result<Arc<dyn CaSession>> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if account_uri.is_some() {
                *self.0.account_uri.lock().unwrap() = account_uri;
            }
            Ok(self.0.clone())
        }
    }

    /// 輪詢間隔縮短為毫秒的設定。
    pub(crate) fn fast_settings(assets: &std::path::Path) -> CoreSettings {
        let fast = |attempts| RetryPolicy::new(attempts, Duration::from_millis(1));
        CoreSettings {
            assets_path: assets.to_path_buf(),
            retry: RetrySettings {
                order_creation: fast(3),
                challenge_submission: fast(10),
                authorization: fast(4),
                order_ready: fast(5),
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::test_support::{fast_settings, FakeCa, FakeConnector, Verdict};
    use super::*;
    use crate::{
        account::{ARCHIVE_FILE, SETTINGS_FILE},
        order::Problem,
        storage::{MemStorage, Storage},
    };

    struct Harness {
        ca: Arc<FakeCa>,
        storage: Arc<MemStorage>,
        coordinator: AcmeOrderCoordinator,
        _assets: tempfile::TempDir,
    }

    fn harness(verdict: Verdict) -> Harness {
        let assets = tempfile::tempdir().unwrap();
        harness_with(verdict, fast_settings(assets.path()), assets)
    }

    fn harness_with(verdict: Verdict, settings: CoreSettings, assets: tempfile::TempDir) -> Harness {
        let ca = FakeCa::new(verdict);
        let storage = Arc::new(MemStorage::new());
        let coordinator = AcmeOrderCoordinator::new(
            Arc::new(settings),
            AccountStore::new(storage.clone()),
            Arc::new(FakeConnector(ca.clone())),
        );
        Harness {
            ca,
            storage,
            coordinator,
            _assets: assets,
        }
    }

    fn config(primary: &str, sans: &[&str]) -> RequestConfig {
        RequestConfig {
            primary_domain: primary.into(),
            subject_alternative_names: sans.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_domains() {
        let domains = normalize_domains(&config(
            "Bücher.Example",
            &["bücher.example", "*.Example.com", "www.example.com", ""],
        ))
        .unwrap();
        assert_eq!(
            domains,
            vec!["xn--bcher-kva.example", "*.example.com", "www.example.com"]
        );
        assert!(matches!(
            normalize_domains(&config("", &[])),
            Err(CoordinatorError::NoDomains)
        ));
        assert_eq!(
            primary_domain_ascii(&config("*.example.com", &[])).unwrap(),
            "example.com"
        );
    }

    #[tokio::test]
    async fn test_begin_order_one_authorization_per_domain() {
        let h = harness(Verdict::Valid);
        let cancel = CancellationToken::new();
        let order = h
            .coordinator
            .begin_order(
                &config("example.com", &["www.example.com", "*.example.com", "example.com"]),
                None,
                &cancel,
            )
            .await
            .unwrap();

        assert!(order.is_pending_authorizations);
        assert_eq!(order.authorizations.len(), 3);
        for auth in &order.authorizations {
            assert!(!auth.is_validated);
            assert!(auth.identifier.is_authorization_pending);
            assert_eq!(auth.order_uri, order.order_uri);
            assert_eq!(auth.challenges.len(), 2);
        }

        let wildcard = &order.authorizations[2];
        assert_eq!(wildcard.identifier.dns, "*.example.com");
        let dns = wildcard.challenge(&ChallengeType::Dns01).unwrap();
        assert_eq!(dns.key, "_acme-challenge.example.com");
        assert_eq!(dns.value, dns_txt_value("token-1-2.thumbprint"));

        let http = order.authorizations[1]
            .challenge(&ChallengeType::Http01)
            .unwrap();
        assert_eq!(http.key, "token-1-1");
        assert_eq!(http.value, "token-1-1.thumbprint");
        assert_eq!(
            http.resource_uri.as_deref(),
            Some("http://www.example.com/.well-known/acme-challenge/token-1-1")
        );
        assert_eq!(
            http.resource_path.as_deref(),
            Some(".well-known/acme-challenge/token-1-1")
        );
    }

    #[tokio::test]
    async fn test_resume_order_with_valid_authorizations() {
        let h = harness(Verdict::Valid);
        let uri = h.ca.seed_order(&["example.com", "www.example.com"], true);
        let order = h
            .coordinator
            .begin_order(
                &config("example.com", &["www.example.com"]),
                Some(&uri),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(order.order_uri.as_deref(), Some(uri.as_str()));
        assert!(!order.is_pending_authorizations);
        assert!(order.authorizations.iter().all(|a| a.is_validated));
        assert!(order
            .authorizations
            .iter()
            .all(|a| !a.identifier.is_authorization_pending));
        assert_eq!(h.ca.state.lock().unwrap().new_order_calls, 0);
    }

    #[tokio::test]
    async fn test_order_creation_retries_then_reports_failure() {
        let h = harness(Verdict::Valid);
        h.ca.state.lock().unwrap().order_failures = 2;
        let order = h
            .coordinator
            .begin_order(&config("example.com", &[]), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(order.authorizations.len(), 1);
        assert!(order.failure().is_none());

        h.ca.state.lock().unwrap().order_failures = 10;
        let order = h
            .coordinator
            .begin_order(&config("example.com", &[]), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(order.order_uri, None);
        assert_eq!(
            order.failure(),
            Some("Failed to begin certificate order: Service busy")
        );
        // 3 次成功前的嘗試 + 3 次全部失敗
        assert_eq!(h.ca.state.lock().unwrap().new_order_calls, 6);
    }

    #[tokio::test]
    async fn test_submit_and_await_valid_challenge() {
        let h = harness(Verdict::Valid);
        let cancel = CancellationToken::new();
        let cfg = config("example.com", &[]);
        let order = h.coordinator.begin_order(&cfg, None, &cancel).await.unwrap();
        let auth = &order.authorizations[0];
        let item = auth.challenge(&ChallengeType::Http01).unwrap();

        let status = h.coordinator.submit_challenge(item, &cancel).await.unwrap();
        assert_eq!(status, StatusMessage::ok("Submitted"));

        let awaited = h
            .coordinator
            .await_authorization(auth, &ChallengeType::Http01, &cancel)
            .await
            .unwrap();
        assert!(awaited.is_validated);
        assert!(!awaited.identifier.is_authorization_pending);
        assert_eq!(awaited.identifier.status.as_deref(), Some("valid"));

        let mut validated = item.clone();
        validated.is_validated = true;
        assert_eq!(
            h.coordinator.submit_challenge(&validated, &cancel).await.unwrap(),
            StatusMessage::ok("Validated")
        );
    }

    #[tokio::test]
    async fn test_invalid_challenge_surfaces_ca_detail() {
        let h = harness(Verdict::Invalid);
        let cancel = CancellationToken::new();
        let order = h
            .coordinator
            .begin_order(&config("example.com", &[]), None, &cancel)
            .await
            .unwrap();
        let auth = &order.authorizations[0];
        let status = h
            .coordinator
            .submit_challenge(auth.challenge(&ChallengeType::Http01).unwrap(), &cancel)
            .await
            .unwrap();
        assert!(!status.is_ok);
        assert_eq!(status.message, "Invalid response from http://example.com");

        let awaited = h
            .coordinator
            .await_authorization(auth, &ChallengeType::Http01, &cancel)
            .await
            .unwrap();
        assert!(awaited.is_failure);
        assert_eq!(awaited.identifier.status.as_deref(), Some("invalid"));
        assert_eq!(awaited.identifier.validation_error.as_deref(), Some("Failed"));
        assert_eq!(
            awaited.authorization_error.as_deref(),
            Some("Invalid response from http://example.com 403 urn:ietf:params:acme:error:unauthorized")
        );
    }

    #[tokio::test]
    async fn test_await_authorization_is_bounded() {
        let h = harness(Verdict::Stuck);
        let cancel = CancellationToken::new();
        let order = h
            .coordinator
            .begin_order(&config("example.com", &[]), None, &cancel)
            .await
            .unwrap();
        let before = h.ca.state.lock().unwrap().auth_fetches;

        let awaited = h
            .coordinator
            .await_authorization(&order.authorizations[0], &ChallengeType::Dns01, &cancel)
            .await
            .unwrap();
        assert!(awaited.is_failure);
        assert_eq!(
            awaited.authorization_error.as_deref(),
            Some("The authorization did not complete validation.")
        );
        assert_eq!(h.ca.state.lock().unwrap().auth_fetches - before, 4);
    }

    #[tokio::test]
    async fn test_cancelled_poll_returns_cancelled() {
        let h = harness(Verdict::Stuck);
        let cancel = CancellationToken::new();
        let order = h
            .coordinator
            .begin_order(&config("example.com", &[]), None, &cancel)
            .await
            .unwrap();
        cancel.cancel();
        let result = h
            .coordinator
            .await_authorization(&order.authorizations[0], &ChallengeType::Http01, &cancel)
            .await;
        assert!(matches!(result, Err(CoordinatorError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_finalize_exports_pfx_and_pem() {
        let h = harness(Verdict::Valid);
        let cancel = CancellationToken::new();
        let mut cfg = config("*.example.com", &["example.com"]);
        cfg.csr_key_alg = Some("ECDSA256".into());
        let uri = h.ca.seed_order(&["*.example.com", "example.com"], true);

        let pfx = h.coordinator.finalize_order(&uri, &cfg, &cancel).await.unwrap();
        assert_eq!(pfx.parent().unwrap().file_name().unwrap(), "_.example.com");
        let stem = pfx.file_stem().unwrap().to_str().unwrap().to_string();
        let (date, id) = stem.split_once('_').unwrap();
        assert_eq!(date.len(), 8);
        assert_eq!(id.len(), 8);
        assert!(pfx.with_extension("pem").exists());

        let der = std::fs::read(&pfx).unwrap();
        let cert = Certificate::from_pkcs12(&der, "").unwrap();
        assert_eq!(cert.not_after().unwrap().format("%Y%m%d").to_string(), date);

        let csr = openssl::x509::X509Req::from_der(h.ca.state.lock().unwrap().csr.as_ref().unwrap()).unwrap();
        let cn = csr
            .subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "*.example.com");
    }

    #[tokio::test]
    async fn test_finalize_times_out_when_not_ready() {
        let h = harness(Verdict::Valid);
        h.ca.state.lock().unwrap().never_ready = true;
        let uri = h.ca.seed_order(&["example.com"], false);
        let err = h
            .coordinator
            .finalize_order(&uri, &config("example.com", &[]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::OrderNotReady));
        assert!(err.to_string().contains("did not reach Ready status"));
    }

    #[tokio::test]
    async fn test_revoke_reads_leaf_from_pfx() {
        let h = harness(Verdict::Valid);
        let cancel = CancellationToken::new();
        let cfg = config("example.com", &[]);
        let uri = h.ca.seed_order(&["example.com"], true);
        let pfx = h.coordinator.finalize_order(&uri, &cfg, &cancel).await.unwrap();

        let record = ManagedCertificate {
            certificate_path: Some(pfx.to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert_eq!(
            h.coordinator.revoke_certificate(&record).await,
            StatusMessage::ok("Certificate revoked")
        );
        assert_eq!(h.ca.state.lock().unwrap().revoked.len(), 1);

        let missing = ManagedCertificate::default();
        let status = h.coordinator.revoke_certificate(&missing).await;
        assert!(!status.is_ok);
        assert!(status.message.starts_with("Failed to revoke certificate:"));
    }

    #[tokio::test]
    async fn test_register_and_account_status() {
        let h = harness(Verdict::Valid);
        assert_eq!(h.coordinator.account_status().await, AccountStatus::None);
        assert!(!h.coordinator.is_account_registered().await.unwrap());

        h.coordinator.register_account("ops@example.com").await.unwrap();
        assert!(h.coordinator.is_account_registered().await.unwrap());
        assert_eq!(
            h.coordinator.contact_registrations().await.unwrap(),
            vec!["ops@example.com"]
        );
        assert!(h.storage.exists(ARCHIVE_FILE).await.unwrap());
        assert_eq!(h.coordinator.account_status().await.as_str(), "ok");

        h.ca.state.lock().unwrap().account = Some(crate::order::AccountResource {
            status: AccountResourceStatus::Valid,
            contact: Vec::new(),
            terms_of_service_agreed: Some(false),
        });
        assert_eq!(h.coordinator.account_status().await, AccountStatus::TosRequired);

        h.ca.state.lock().unwrap().account_problem = Some(Problem {
            problem_type: ACCOUNT_DOES_NOT_EXIST.into(),
            detail: None,
            status: Some(400),
        });
        assert_eq!(
            h.coordinator.account_status().await.as_str(),
            "account-doesnotexist"
        );
    }

    #[tokio::test]
    async fn test_change_account_key_archives_and_persists() {
        let h = harness(Verdict::Valid);
        h.coordinator.init_session().await.unwrap();
        let before = AccountStore::new(h.storage.clone())
            .load_settings()
            .await
            .unwrap()
            .account_key;

        h.coordinator.change_account_key().await.unwrap();

        let after = AccountStore::new(h.storage.clone())
            .load_settings()
            .await
            .unwrap()
            .account_key;
        assert_ne!(before, after);
        assert_eq!(h.ca.state.lock().unwrap().key_changes, 1);
        let archive = h.storage.read_string(ARCHIVE_FILE).await.unwrap().unwrap();
        assert!(archive.contains(before.unwrap().trim()));
        assert!(h.storage.exists(SETTINGS_FILE).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_key_change_keeps_prior_key() {
        let h = harness(Verdict::Valid);
        h.coordinator.init_session().await.unwrap();
        let before = AccountStore::new(h.storage.clone())
            .load_settings()
            .await
            .unwrap()
            .account_key
            .unwrap();
        h.ca.state.lock().unwrap().key_change_problem = Some(Problem {
            problem_type: "urn:ietf:params:acme:error:unauthorized".into(),
            detail: Some("key change rejected".into()),
            status: Some(403),
        });

        assert!(h.coordinator.change_account_key().await.is_err());

        let after = AccountStore::new(h.storage.clone())
            .load_settings()
            .await
            .unwrap()
            .account_key
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(h.ca.state.lock().unwrap().key_changes, 0);

        let state = h.coordinator.state.lock().await;
        let active = state.as_ref().unwrap().account.key_pair.to_pem().unwrap();
        assert_eq!(String::from_utf8_lossy(&active).trim(), before.trim());
        drop(state);

        // 封存在呼叫 CA 之前完成
        let archive = h.storage.read_string(ARCHIVE_FILE).await.unwrap().unwrap();
        assert!(archive.contains(before.trim()));
    }

    #[tokio::test]
    async fn test_order_handles_are_discarded() {
        let h = harness(Verdict::Invalid);
        let cancel = CancellationToken::new();
        let cfg = config("example.com", &["www.example.com"]);

        for _ in 0..5 {
            let order = h.coordinator.begin_order(&cfg, None, &cancel).await.unwrap();
            let auth = &order.authorizations[0];
            h.coordinator
                .submit_challenge(auth.challenge(&ChallengeType::Http01).unwrap(), &cancel)
                .await
                .unwrap();
            h.coordinator
                .await_authorization(auth, &ChallengeType::Http01, &cancel)
                .await
                .unwrap();
            assert_eq!(h.coordinator.handle_counts(), (1, 2, 6));
            h.coordinator
                .discard_order(order.order_uri.as_deref().unwrap())
                .unwrap();
        }
        assert_eq!(h.coordinator.handle_counts(), (0, 0, 0));

        // 完成訂單失敗時同樣丟棄
        let order = h.coordinator.begin_order(&cfg, None, &cancel).await.unwrap();
        let uri = order.order_uri.unwrap();
        assert!(matches!(
            h.coordinator.finalize_order(&uri, &cfg, &cancel).await,
            Err(CoordinatorError::OrderNotReady)
        ));
        assert_eq!(h.coordinator.handle_counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_stale_session_is_reinitialized() {
        let assets = tempfile::tempdir().unwrap();
        let mut settings = fast_settings(assets.path());
        settings.session_max_age_secs = 0;
        let h = harness_with(Verdict::Valid, settings, assets);
        let cancel = CancellationToken::new();
        let cfg = config("example.com", &[]);

        h.coordinator.begin_order(&cfg, None, &cancel).await.unwrap();
        h.coordinator.begin_order(&cfg, None, &cancel).await.unwrap();
        assert_eq!(h.ca.connects.load(Ordering::SeqCst), 2);
    }
}
