//! 證書簽發後的部署任務。
//!
//! 任務提供者以類型 id 註冊到 [`DeploymentTaskRegistry`]；[`DeploymentPipeline`]
//! 依受管證書的任務設定依序建立並執行，單一任務失敗不會阻擋其他任務。
//! 重試與致命旗標只是傳給提供者的設定，管線本身不解讀。

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    models::{ActionStep, DeploymentTaskConfig, ManagedCertificate, ProviderParameter},
    providers::{CredentialStore, Credentials, ProviderError},
};

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("Deployment task type id must not be empty")]
    EmptyTypeId,
    #[error("Deployment task type already registered: {0}")]
    DuplicateTypeId(String),
    #[error("Unknown deployment task type: {0}")]
    UnknownTaskType(String),
    #[error("Credential error: {0}")]
    Credentials(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, DeploymentError>;

/// 單一任務的執行結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub is_success: bool,
    pub message: String,
}

impl TaskOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            is_success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait DeploymentTaskProvider: Send + Sync {
    /// 提供者接受的參數描述。
    fn parameters(&self) -> Vec<ProviderParameter> {
        Vec::new()
    }

    async fn execute(
        &self,
        record: &ManagedCertificate,
        config: &DeploymentTaskConfig,
        credentials: Option<&Credentials>,
        is_preview_only: bool,
    ) -> TaskOutcome;
}

pub type TaskFactory = Arc<dyn Fn() -> Arc<dyn DeploymentTaskProvider> + Send + Sync>;

/// 類型 id（不分大小寫）到任務工廠的對照表。
#[derive(Default, Clone)]
pub struct DeploymentTaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl fmt::Debug for DeploymentTaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentTaskRegistry")
            .field("type_ids", &self.type_ids())
            .finish()
    }
}

impl DeploymentTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 註冊任務類型；類型 id 去除前後空白並忽略大小寫。
    ///
    /// # Errors
    ///
    /// 類型 id 為空時返回 [`DeploymentError::EmptyTypeId`]，已註冊過時返回
    /// [`DeploymentError::DuplicateTypeId`]。
    pub fn register<F>(&mut self, type_id: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn DeploymentTaskProvider> + Send + Sync + 'static,
    {
        let key = normalize_type_id(type_id);
        if key.is_empty() {
            return Err(DeploymentError::EmptyTypeId);
        }
        if self.factories.contains_key(&key) {
            return Err(DeploymentError::DuplicateTypeId(key));
        }
        self.factories.insert(key, Arc::new(factory));
        Ok(())
    }

    /// 依類型 id 建立任務提供者，比對規則與 [`register`](Self::register) 相同。
    ///
    /// # Errors
    ///
    /// 沒有對應的類型時返回 [`DeploymentError::UnknownTaskType`]。
    pub fn create(&self, type_id: &str) -> Result<Arc<dyn DeploymentTaskProvider>> {
        self.factories
            .get(&normalize_type_id(type_id))
            .map(|factory| factory())
            .ok_or_else(|| DeploymentError::UnknownTaskType(type_id.to_string()))
    }

    pub fn type_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn normalize_type_id(type_id: &str) -> String {
    type_id.trim().to_lowercase()
}

/// 已解析提供者與憑證、可執行的部署任務。
pub struct DeploymentTask {
    provider: Arc<dyn DeploymentTaskProvider>,
    pub config: DeploymentTaskConfig,
    credentials: Option<Credentials>,
}

impl DeploymentTask {
    pub async fn execute(&self, record: &ManagedCertificate, is_preview_only: bool) -> TaskOutcome {
        self.provider
            .execute(record, &self.config, self.credentials.as_ref(), is_preview_only)
            .await
    }
}

pub struct DeploymentPipeline {
    registry: Arc<DeploymentTaskRegistry>,
    credentials: Option<Arc<dyn CredentialStore>>,
}

impl DeploymentPipeline {
    pub fn new(
        registry: Arc<DeploymentTaskRegistry>,
        credentials: Option<Arc<dyn CredentialStore>>,
    ) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    /// 建立提供者並在需要時解密憑證。
    pub async fn prepare(&self, config: &DeploymentTaskConfig) -> Result<DeploymentTask> {
        let provider = self.registry.create(&config.task_type_id)?;

        let credentials = match (config.credential_key.as_deref(), &self.credentials) {
            (Some(key), Some(store)) if !key.is_empty() => {
                Some(store.get_unlocked_credentials(key).await?)
            }
            (Some(key), None) if !key.is_empty() => {
                return Err(ProviderError::CredentialNotFound(key.to_string()).into());
            }
            _ => None,
        };

        Ok(DeploymentTask {
            provider,
            config: config.clone(),
            credentials,
        })
    }

    /// 依設定順序執行任務，每個任務產生一個步驟；
    /// 無法建立的任務先以失敗步驟列出，不影響其他任務執行。
    pub async fn run(
        &self,
        record: &ManagedCertificate,
        task_id: Option<&str>,
        is_preview_only: bool,
        skip_deferred: bool,
    ) -> Vec<ActionStep> {
        let mut steps = Vec::new();
        let mut tasks = Vec::new();

        let selected = record
            .deployment_tasks
            .iter()
            .filter(|t| task_id.map_or(true, |id| id.is_empty() || t.id == id))
            .filter(|t| !(t.is_deferred && skip_deferred));

        for config in selected {
            match self.prepare(config).await {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(task = %config.task_name, error = %e, "cannot create deployment task");
                    steps.push(ActionStep::error(
                        format!("Deployment Task: {}", config.task_name),
                        format!("Cannot create task provider for deployment task: {e}"),
                    ));
                }
            }
        }

        for task in tasks {
            info!(
                managed_certificate = %record.id,
                task = %task.config.task_name,
                preview = is_preview_only,
                "executing deployment task"
            );
            let outcome = task.execute(record, is_preview_only).await;
            if !outcome.is_success {
                warn!(task = %task.config.task_name, message = %outcome.message, "deployment task failed");
            }
            steps.push(ActionStep {
                title: format!("Deployment Task: {}", task.config.task_name),
                description: outcome.message,
                has_error: !outcome.is_success,
                has_warning: false,
            });
        }

        steps
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::test_support::{registry, task};
    use super::*;

    struct FixedCredentials;

    #[async_trait]
    impl CredentialStore for FixedCredentials {
        async fn get_unlocked_credentials(&self, storage_key: &str) -> crate::providers::Result<Credentials> {
            if storage_key == "cred-1" {
                Ok(HashMap::from([("user".to_string(), "deployer".to_string())]))
            } else {
                Err(ProviderError::CredentialNotFound(storage_key.to_string()))
            }
        }
    }

    fn record(tasks: Vec<DeploymentTaskConfig>) -> ManagedCertificate {
        ManagedCertificate {
            id: "mc-1".into(),
            deployment_tasks: tasks,
            ..Default::default()
        }
    }

    fn pipeline(log: Arc<Mutex<Vec<String>>>) -> DeploymentPipeline {
        DeploymentPipeline::new(Arc::new(registry(log)), Some(Arc::new(FixedCredentials)))
    }

    #[test]
    fn test_registry_validation() {
        let mut registry = DeploymentTaskRegistry::new();
        let factory = || -> Arc<dyn DeploymentTaskProvider> {
            Arc::new(test_support::RecordingTask {
                log: Arc::default(),
                fail: false,
            })
        };
        assert!(matches!(
            registry.register("  ", factory),
            Err(DeploymentError::EmptyTypeId)
        ));
        registry.register("Certify.Deploy.Copy", factory).unwrap();
        assert!(matches!(
            registry.register("certify.deploy.copy", factory),
            Err(DeploymentError::DuplicateTypeId(_))
        ));
        assert!(registry.create("CERTIFY.DEPLOY.COPY").is_ok());
        assert!(registry.create(" Certify.Deploy.Copy\t").is_ok());
        assert!(matches!(
            registry.create("missing"),
            Err(DeploymentError::UnknownTaskType(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_in_order_and_skips_deferred() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = record(vec![
            task("first", "Test.Record", false),
            task("later", "Test.Record", true),
            task("second", "test.fail", false),
        ]);

        let steps = pipeline(log.clone()).run(&record, None, false, true).await;
        assert_eq!(steps.len(), 2);
        assert!(!steps[0].has_error);
        assert!(steps[1].has_error);
        assert_eq!(steps[1].description, "second failed");
        assert_eq!(*log.lock().unwrap(), vec!["first:-:false", "second:-:false"]);

        log.lock().unwrap().clear();
        let steps = pipeline(log.clone()).run(&record, None, true, false).await;
        assert_eq!(steps.len(), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:-:true", "later:-:true", "second:-:true"]
        );
    }

    #[tokio::test]
    async fn test_unresolvable_task_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut broken = task("broken", "Test.Record", false);
        broken.credential_key = Some("missing".into());
        let record = record(vec![
            task("unknown", "No.Such.Type", false),
            broken,
            task("ok", "Test.Record", false),
        ]);

        let steps = pipeline(log.clone()).run(&record, None, false, false).await;
        assert_eq!(steps.len(), 3);
        assert!(steps[0].has_error);
        assert_eq!(steps[0].title, "Deployment Task: unknown");
        assert!(steps[0]
            .description
            .starts_with("Cannot create task provider for deployment task:"));
        assert!(steps[1].has_error);
        assert!(!steps[2].has_error);
        assert_eq!(*log.lock().unwrap(), vec!["ok:-:false"]);
    }

    #[tokio::test]
    async fn test_single_task_with_credentials() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut secured = task("secured", "Test.Record", true);
        secured.credential_key = Some("cred-1".into());
        let record = record(vec![task("other", "Test.Record", false), secured]);

        let steps = pipeline(log.clone())
            .run(&record, Some("secured"), false, false)
            .await;
        assert_eq!(steps.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["secured:deployer:false"]);
    }
}
