use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 當請求過程中發生錯誤時回傳此錯誤。
    #[error("Failed to make request: {0}")]
    RequestFailed(#[from] reqwest::Error),
    /// 當回應中缺少 `Replay-Nonce` 標頭時回傳此錯誤。
    #[error("No Replay-Nonce header found in response")]
    NoNonceHeader,
    /// 當標頭值無法轉換成字串時回傳此錯誤。
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::ToStrError),
}

/// 定義取得 Nonce 的行為。
#[async_trait]
pub trait NonceT: Send + Sync {
    /// 嘗試取得一個尚未使用過的 Nonce。
    async fn get(&self) -> Result<String, NonceError>;

    /// 保存伺服器回應附帶的 Nonce，供下一次請求使用。
    fn save(&self, _nonce: &str) {}
}

/// 透過 HTTP 請求取得 `Replay-Nonce` 的實作。
///
/// 每個 ACME 回應都帶有新的 `Replay-Nonce`，保存後可省去一次 HEAD 請求。
#[derive(Debug)]
pub struct Nonce {
    client: Client,
    url: String,
    cached: Mutex<Option<String>>,
}

impl Nonce {
    /// 建立一個新的 `Nonce` 實例，`url` 為目錄中的 `newNonce`。
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Nonce {
            client,
            url: url.into(),
            cached: Mutex::new(None),
        }
    }

    fn take_cached(&self) -> Option<String> {
        self.cached.lock().ok().and_then(|mut cached| cached.take())
    }
}

#[async_trait]
impl NonceT for Nonce {
    async fn get(&self) -> Result<String, NonceError> {
        if let Some(nonce) = self.take_cached() {
            return Ok(nonce);
        }

        let response = self.client.head(&self.url).send().await?;

        match response.headers().get("Replay-Nonce") {
            Some(nonce) => Ok(nonce.to_str()?.to_string()),
            None => Err(NonceError::NoNonceHeader),
        }
    }

    fn save(&self, nonce: &str) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(nonce.to_string());
        }
    }
}

/// 模擬 Nonce 實作，提供固定的 Nonce 值。
#[derive(Debug, Clone)]
pub struct MockNonce {
    value: String,
}

impl MockNonce {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl NonceT for MockNonce {
    async fn get(&self) -> Result<String, NonceError> {
        Ok(self.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_mock_nonce() {
        let nonce = MockNonce::new("test-nonce-123");
        assert_eq!(nonce.get().await.unwrap(), "test-nonce-123");
    }

    #[tokio::test]
    async fn test_saved_nonce_is_used_once() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("Replay-Nonce", "fresh"))
            .expect(1)
            .mount(&server)
            .await;

        let nonce = Nonce::new(Client::new(), format!("{}/new-nonce", server.uri()));
        nonce.save("from-response");
        assert_eq!(nonce.get().await.unwrap(), "from-response");
        assert_eq!(nonce.get().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_missing_header() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let nonce = Nonce::new(Client::new(), server.uri());
        assert!(matches!(nonce.get().await, Err(NonceError::NoNonceHeader)));
    }
}
