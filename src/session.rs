//! 與 CA 之間綁定帳號金鑰的連線階段。
//!
//! [`CaSession`] 是協議協調器唯一依賴的 CA 介面；[`HttpCaSession`] 以 JWS 簽署的
//! HTTPS 請求實作它。測試中以記憶體內的假 CA 取代。

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    base64::Base64,
    challenge::ChallengeResource,
    directory::{Directory, DirectoryError},
    jwk::{Jwk, JwkError},
    jws::{Jws, JwsError},
    key_pair::{KeyError, KeyPair},
    nonce::{Nonce, NonceT},
    order::{AccountResource, AuthorizationResource, OrderResource, Problem, BAD_NONCE},
    payload::{
        ChallengeValidationPayload, FinalizeOrderPayload, KeyChangePayload, NewAccountPayload,
        NewOrderPayload, PayloadError, PayloadT, RevokeCertPayload,
    },
    protection::{Protection, ProtectionError},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    /// CA 以錯誤文件拒絕請求。
    #[error("{0}")]
    Problem(Problem),
    #[error("Unexpected response status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Response is missing the Location header")]
    MissingLocation,
    #[error("No account is bound to this session")]
    NoAccount,
    #[error("CA does not support {0}")]
    Unsupported(&'static str),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
    #[error("Protection error: {0}")]
    Protection(#[from] ProtectionError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Lock poisoned")]
    LockPoisoned,
}

impl SessionError {
    /// CA 的錯誤文件（若有）。
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Self::Problem(problem) => Some(problem),
            _ => None,
        }
    }

    /// 給使用者看的錯誤細節：CA 錯誤文件的 detail，否則為錯誤訊息本身。
    pub fn detail(&self) -> String {
        match self {
            Self::Problem(problem) => problem.detail().to_string(),
            other => other.to_string(),
        }
    }

    /// 連線層級的失敗（非 CA 的明確回應）。
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Directory(DirectoryError::Request(_)))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// 附帶 `Location` 標頭的資源。
#[derive(Debug, Clone)]
pub struct Located<T> {
    pub location: String,
    pub resource: T,
}

/// 綁定帳號金鑰的 CA 連線階段。
#[async_trait]
pub trait CaSession: Send + Sync {
    fn account_uri(&self) -> Option<String>;

    /// `token.thumbprint`，以目前的帳號金鑰計算。
    fn key_authorization(&self, token: &str) -> Result<String>;

    fn terms_of_service(&self) -> Option<String>;

    /// 註冊（或以 `only_existing` 查詢）帳號；成功後此階段以回傳的 URL 作為 `kid`。
    async fn new_account(
        &self,
        email: Option<&str>,
        only_existing: bool,
    ) -> Result<Located<AccountResource>>;

    async fn fetch_account(&self) -> Result<AccountResource>;

    async fn new_order(&self, domains: &[String]) -> Result<Located<OrderResource>>;

    async fn fetch_order(&self, uri: &str) -> Result<OrderResource>;

    async fn fetch_authorization(&self, uri: &str) -> Result<AuthorizationResource>;

    async fn fetch_challenge(&self, uri: &str) -> Result<ChallengeResource>;

    /// 通知 CA 挑戰已就緒，回傳觸發後的挑戰狀態。
    async fn trigger_challenge(&self, uri: &str) -> Result<ChallengeResource>;

    async fn finalize(&self, finalize_uri: &str, csr_der: &[u8]) -> Result<OrderResource>;

    /// 下載 PEM 證書鏈。
    async fn download_certificate(&self, uri: &str) -> Result<String>;

    async fn revoke_certificate(&self, cert_der: &[u8], reason: Option<u8>) -> Result<()>;

    /// 向 CA 輪替帳號金鑰；成功後此階段改用新金鑰簽署。
    async fn change_key(&self, new_key: &KeyPair) -> Result<()>;
}

/// 建立 [`CaSession`] 的工廠。
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        key_pair: KeyPair,
        account_uri: Option<String>,
    ) -> Result<Arc<dyn CaSession>>;
}

/// 以 reqwest 連線到 ACME 目錄的工廠。
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    directory_url: String,
}

impl HttpConnector {
    pub fn new(directory_url: impl Into<String>, user_agent: &str) -> Result<Self> {
        let client = Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            client,
            directory_url: directory_url.into(),
        })
    }
}

#[async_trait]
impl SessionConnector for HttpConnector {
    async fn connect(
        &self,
        key_pair: KeyPair,
        account_uri: Option<String>,
    ) -> Result<Arc<dyn CaSession>> {
        let directory = Directory::fetch(&self.client, &self.directory_url).await?;
        Ok(Arc::new(HttpCaSession::new(
            self.client.clone(),
            directory,
            key_pair,
            account_uri,
        )))
    }
}

/// JWS 簽署的 ACME HTTPS 連線階段。
#[derive(Debug)]
pub struct HttpCaSession {
    client: Client,
    directory: Directory,
    nonce: Nonce,
    key_pair: RwLock<Arc<KeyPair>>,
    account_uri: RwLock<Option<String>>,
}

const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

impl HttpCaSession {
    pub fn new(
        client: Client,
        directory: Directory,
        key_pair: KeyPair,
        account_uri: Option<String>,
    ) -> Self {
        let nonce = Nonce::new(client.clone(), directory.new_nonce.clone());
        Self {
            client,
            directory,
            nonce,
            key_pair: RwLock::new(Arc::new(key_pair)),
            account_uri: RwLock::new(account_uri),
        }
    }

    fn key(&self) -> Result<Arc<KeyPair>> {
        Ok(self
            .key_pair
            .read()
            .map_err(|_| SessionError::LockPoisoned)?
            .clone())
    }

    fn set_account_uri(&self, uri: String) -> Result<()> {
        *self
            .account_uri
            .write()
            .map_err(|_| SessionError::LockPoisoned)? = Some(uri);
        Ok(())
    }

    /// 簽署並送出 POST；`badNonce` 以新的 nonce 重試一次。
    async fn post(
        &self,
        url: &str,
        payload: Option<&Base64>,
        use_jwk: bool,
        accept: Option<&str>,
    ) -> Result<Response> {
        let mut retried = false;
        loop {
            let key = self.key()?;
            let mut protection = Protection::new(&self.nonce, key.alg);
            match self.account_uri() {
                Some(kid) if !use_jwk => protection.set_value(kid)?,
                _ => protection.set_value(Jwk::new(&key)?.to_acme_value())?,
            };
            let header = protection.create_header(url).await?;
            let body = Jws::sign(&header, payload, &key)?.to_json()?;

            let mut request = self
                .client
                .post(url)
                .header(header::CONTENT_TYPE, JOSE_JSON)
                .body(body);
            if let Some(accept) = accept {
                request = request.header(header::ACCEPT, accept);
            }
            let response = request.send().await?;

            if let Some(nonce) = response
                .headers()
                .get("Replay-Nonce")
                .and_then(|v| v.to_str().ok())
            {
                self.nonce.save(nonce);
            }

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let body = response.text().await?;
            let problem = match serde_json::from_str::<Problem>(&body) {
                Ok(problem) => problem,
                Err(_) => return Err(SessionError::Status { status, body }),
            };
            if problem.is(BAD_NONCE) && !retried {
                warn!(url, "CA rejected nonce, retrying with a fresh one");
                retried = true;
                continue;
            }
            return Err(SessionError::Problem(problem));
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        payload: Option<&Base64>,
    ) -> Result<T> {
        let response = self.post(url, payload, false, None).await?;
        Ok(response.json().await?)
    }

    fn location(response: &Response) -> Result<String> {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or(SessionError::MissingLocation)
    }
}

#[async_trait]
impl CaSession for HttpCaSession {
    fn account_uri(&self) -> Option<String> {
        self.account_uri.read().ok().and_then(|uri| uri.clone())
    }

    fn key_authorization(&self, token: &str) -> Result<String> {
        let thumbprint = self.key()?.thumbprint()?;
        Ok(crate::challenge::key_authorization(token, &thumbprint))
    }

    fn terms_of_service(&self) -> Option<String> {
        self.directory.terms_of_service().map(ToString::to_string)
    }

    async fn new_account(
        &self,
        email: Option<&str>,
        only_existing: bool,
    ) -> Result<Located<AccountResource>> {
        let payload = match email {
            Some(email) if !only_existing => NewAccountPayload::new(email),
            _ => NewAccountPayload::lookup(),
        }
        .to_base64()?;
        let response = self
            .post(&self.directory.new_account, Some(&payload), true, None)
            .await?;
        let location = Self::location(&response)?;
        let resource: AccountResource = response.json().await?;
        self.set_account_uri(location.clone())?;
        debug!(account_uri = %location, "account bound to session");
        Ok(Located { location, resource })
    }

    async fn fetch_account(&self) -> Result<AccountResource> {
        let uri = self.account_uri().ok_or(SessionError::NoAccount)?;
        self.post_json(&uri, None).await
    }

    async fn new_order(&self, domains: &[String]) -> Result<Located<OrderResource>> {
        let payload = NewOrderPayload::new(domains).to_base64()?;
        let response = self
            .post(&self.directory.new_order, Some(&payload), false, None)
            .await?;
        let location = Self::location(&response)?;
        Ok(Located {
            location,
            resource: response.json().await?,
        })
    }

    async fn fetch_order(&self, uri: &str) -> Result<OrderResource> {
        self.post_json(uri, None).await
    }

    async fn fetch_authorization(&self, uri: &str) -> Result<AuthorizationResource> {
        self.post_json(uri, None).await
    }

    async fn fetch_challenge(&self, uri: &str) -> Result<ChallengeResource> {
        self.post_json(uri, None).await
    }

    async fn trigger_challenge(&self, uri: &str) -> Result<ChallengeResource> {
        let payload = ChallengeValidationPayload::new().to_base64()?;
        self.post_json(uri, Some(&payload)).await
    }

    async fn finalize(&self, finalize_uri: &str, csr_der: &[u8]) -> Result<OrderResource> {
        let payload = FinalizeOrderPayload::new(&Base64::new(csr_der)).to_base64()?;
        self.post_json(finalize_uri, Some(&payload)).await
    }

    async fn download_certificate(&self, uri: &str) -> Result<String> {
        let response = self.post(uri, None, false, Some(PEM_CHAIN)).await?;
        Ok(response.text().await?)
    }

    async fn revoke_certificate(&self, cert_der: &[u8], reason: Option<u8>) -> Result<()> {
        let payload = RevokeCertPayload::new(cert_der, reason).to_base64()?;
        self.post(&self.directory.revoke_cert, Some(&payload), false, None)
            .await?;
        Ok(())
    }

    async fn change_key(&self, new_key: &KeyPair) -> Result<()> {
        let url = self
            .directory
            .key_change
            .clone()
            .ok_or(SessionError::Unsupported("keyChange"))?;
        let account = self.account_uri().ok_or(SessionError::NoAccount)?;
        let old_jwk = Jwk::new(&*self.key()?)?.to_acme_value();

        // 內層 JWS 以新金鑰簽署，不帶 nonce
        let mut inner = Protection::without_nonce(new_key.alg);
        inner.set_value(Jwk::new(new_key)?.to_acme_value())?;
        let inner_header = inner.create_header(url.as_str()).await?;
        let inner_payload = KeyChangePayload::new(account, old_jwk).to_base64()?;
        let inner_jws = Jws::sign(&inner_header, Some(&inner_payload), new_key)?;

        let outer_payload = Base64::new(inner_jws.to_json()?.as_bytes());
        self.post(&url, Some(&outer_payload), false, None).await?;

        *self
            .key_pair
            .write()
            .map_err(|_| SessionError::LockPoisoned)? = Arc::new(new_key.clone());
        Ok(())
    }
}
