//! # certfleet
//!
//! 為大量各自設定的網域（受管證書）自動化 ACME 證書的簽發、續約與部署。
//!
//! 本庫分成三層：
//!
//! - **協議層**：[`coordinator::AcmeOrderCoordinator`] 驅動單一訂單走完 ACME 流程，
//!   透過 [`session::CaSession`] 與 CA 溝通（JWS 簽署、nonce 管理、帳號金鑰）。
//! - **存儲層**：[`item_store::ManagedCertificateStore`] 以 SQLite 保存受管證書，
//!   載入後以記憶體快取作為讀取來源，並支援舊版 JSON 檔的一次性遷移。
//! - **編排層**：[`orchestrator::RenewalOrchestrator`] 串起診斷、下單、結果記錄、
//!   部署任務與狀態通知。
//!
//! 網站伺服器、DNS 提供者、憑證庫與儀表板只以 [`providers`] 中的介面表示。
//!
//! ## 使用方式
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use certfleet::{
//!     account::AccountStore,
//!     config::CoreSettings,
//!     coordinator::AcmeOrderCoordinator,
//!     item_store::ManagedCertificateStore,
//!     session::HttpConnector,
//!     storage::FileStorage,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Arc::new(CoreSettings::load("settings/core.json").await?);
//! let connector = HttpConnector::new(&settings.directory_url, &settings.user_agent)?;
//! let accounts = AccountStore::new(Arc::new(FileStorage::open(&settings.settings_path)));
//! let coordinator = AcmeOrderCoordinator::new(settings.clone(), accounts, Arc::new(connector));
//!
//! coordinator.init_session().await?;
//! coordinator.register_account("ops@example.com").await?;
//!
//! let store = ManagedCertificateStore::open(&settings.data_path).await?;
//! store.load(true).await?;
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod base64;
pub mod certificate;
pub mod challenge;
pub mod config;
pub mod coordinator;
pub mod csr;
pub mod deployment;
pub mod directory;
pub mod item_store;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod models;
pub mod nonce;
pub mod orchestrator;
pub mod order;
pub mod payload;
pub mod protection;
pub mod providers;
pub mod responder;
pub mod session;
pub mod signature;
pub mod storage;
