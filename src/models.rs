//! 受管證書與單次下單流程使用的資料模型。
//!
//! 受管證書以 PascalCase 欄位名稱序列化，與既有的資料庫內容與舊版 JSON 檔相容。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    challenge::ChallengeType,
    key_pair::{KeyAlgorithm, KeyError},
};

/// 最近一次續約的結果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    #[default]
    NotStarted,
    InProgress,
    Success,
    Error,
    Paused,
}

/// 單一挑戰的設定；`domain_match` 為空時套用到所有網域。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChallengeConfig {
    pub challenge_type: String,
    pub challenge_provider: Option<String>,
    pub challenge_credential_key: Option<String>,
    pub domain_match: Option<String>,
    pub zone_id: Option<String>,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            challenge_type: ChallengeType::Http01.as_str().to_string(),
            challenge_provider: None,
            challenge_credential_key: None,
            domain_match: None,
            zone_id: None,
        }
    }
}

impl ChallengeConfig {
    pub fn challenge_type(&self) -> ChallengeType {
        ChallengeType::from(self.challenge_type.to_lowercase())
    }

    fn matches(&self, domain: &str) -> bool {
        match self.domain_match.as_deref() {
            None | Some("") => true,
            Some(pattern) => pattern
                .split([';', ','])
                .map(str::trim)
                .any(|p| p.eq_ignore_ascii_case(domain)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestConfig {
    pub primary_domain: String,
    pub subject_alternative_names: Vec<String>,
    pub challenges: Vec<ChallengeConfig>,
    /// `RS256`（預設）、`ECDSA256`、`ECDSA384` 或 `ECDSA521`。
    #[serde(rename = "CSRKeyAlg")]
    pub csr_key_alg: Option<String>,
    pub perform_auto_config: bool,
    pub enable_failure_notifications: bool,
    pub website_root_path: Option<String>,
}

impl RequestConfig {
    pub fn key_algorithm(&self) -> Result<KeyAlgorithm, KeyError> {
        self.csr_key_alg.as_deref().unwrap_or_default().parse()
    }
}

/// 部署任務參數（保持設定順序）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterValue {
    pub key: String,
    pub value: String,
}

/// 部署任務設定；重試與致命旗標由任務提供者解讀。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeploymentTaskConfig {
    pub id: String,
    pub task_name: String,
    pub task_type_id: String,
    pub parameters: Vec<ParameterValue>,
    pub is_deferred: bool,
    pub is_fatal_on_error: bool,
    pub retries_allowed: u32,
    pub retry_delay_seconds: u32,
    #[serde(rename = "ChallengeCredentialKey")]
    pub credential_key: Option<String>,
}

impl DeploymentTaskConfig {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }
}

/// 一張受管證書的完整設定與續約狀態。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ManagedCertificate {
    /// 空字串表示尚未指派，寫入存儲時會產生 UUID。
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub request_config: RequestConfig,
    pub deployment_tasks: Vec<DeploymentTaskConfig>,
    pub last_renewal_status: RequestState,
    pub renewal_failure_count: u32,
    pub renewal_failure_message: Option<String>,
    pub date_last_renewal_attempt: Option<DateTime<Utc>>,
    pub date_renewed: Option<DateTime<Utc>>,
    pub date_expiry: Option<DateTime<Utc>>,
    pub certificate_path: Option<String>,
    /// 尚未完成的訂單，可於下次嘗試時續用。
    pub current_order_uri: Option<String>,
    pub server_site_id: Option<String>,
    pub group_id: Option<String>,
    pub deleted: bool,
    #[serde(skip)]
    pub is_changed: bool,
}

impl ManagedCertificate {
    /// 指定網域適用的挑戰設定；沒有任何設定時回傳預設的 http-01。
    pub fn challenge_config(&self, domain: Option<&str>) -> ChallengeConfig {
        let challenges = &self.request_config.challenges;
        domain
            .and_then(|d| {
                challenges
                    .iter()
                    .find(|c| c.domain_match.is_some() && c.matches(d))
            })
            .or_else(|| challenges.iter().find(|c| c.matches("")))
            .or_else(|| challenges.first())
            .cloned()
            .unwrap_or_default()
    }

    pub fn uses_challenge(&self, challenge_type: &ChallengeType) -> bool {
        self.challenge_config(None).challenge_type() == *challenge_type
    }
}

/// 查詢條件；空欄位不參與篩選。
#[derive(Debug, Clone, Default)]
pub struct ManagedCertificateFilter {
    pub keyword: Option<String>,
    pub challenge_type: Option<String>,
    pub challenge_provider: Option<String>,
    pub stored_credential_key: Option<String>,
    /// 0 表示不限筆數。
    pub max_results: usize,
}

impl ManagedCertificateFilter {
    pub fn matches(&self, item: &ManagedCertificate) -> bool {
        if let Some(keyword) = self.keyword.as_deref().filter(|k| !k.is_empty()) {
            if !item.name.to_lowercase().contains(&keyword.to_lowercase()) {
                return false;
            }
        }

        let challenges = &item.request_config.challenges;
        if let Some(t) = self.challenge_type.as_deref().filter(|t| !t.is_empty()) {
            if !challenges.iter().any(|c| c.challenge_type == t) {
                return false;
            }
        }
        if let Some(p) = self.challenge_provider.as_deref().filter(|p| !p.is_empty()) {
            if !challenges
                .iter()
                .any(|c| c.challenge_provider.as_deref() == Some(p))
            {
                return false;
            }
        }
        if let Some(k) = self
            .stored_credential_key
            .as_deref()
            .filter(|k| !k.is_empty())
        {
            if !challenges
                .iter()
                .any(|c| c.challenge_credential_key.as_deref() == Some(k))
            {
                return false;
            }
        }
        true
    }
}

/// 授權的識別項（網域）與驗證狀態。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierItem {
    pub dns: String,
    pub status: Option<String>,
    pub is_authorization_pending: bool,
    pub validation_error: Option<String>,
    pub validation_error_type: Option<String>,
}

/// 單一挑戰的描述。`challenge_id` 指向協調器內部持有的挑戰。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationChallengeItem {
    pub challenge_type: ChallengeType,
    /// http-01 為 token，dns-01 為記錄名稱。
    pub key: String,
    /// http-01 為 key authorization，dns-01 為 TXT 值。
    pub value: String,
    pub resource_uri: Option<String>,
    pub resource_path: Option<String>,
    pub is_validated: bool,
    pub challenge_id: String,
}

/// 單一網域的待處理授權。`authorization_id` 指向協調器內部持有的授權。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub identifier: IdentifierItem,
    pub challenges: Vec<AuthorizationChallengeItem>,
    pub is_validated: bool,
    pub is_failure: bool,
    pub authorization_error: Option<String>,
    pub authorization_id: String,
    pub order_uri: Option<String>,
}

impl PendingAuthorization {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            is_failure: true,
            authorization_error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn challenge(&self, challenge_type: &ChallengeType) -> Option<&AuthorizationChallengeItem> {
        self.challenges
            .iter()
            .find(|c| &c.challenge_type == challenge_type)
    }
}

/// 一次下單嘗試的結果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingOrder {
    pub order_uri: Option<String>,
    pub is_pending_authorizations: bool,
    pub authorizations: Vec<PendingAuthorization>,
}

impl PendingOrder {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            order_uri: None,
            is_pending_authorizations: true,
            authorizations: vec![PendingAuthorization::failed(message)],
        }
    }

    /// 第一個失敗授權的錯誤訊息。
    pub fn failure(&self) -> Option<&str> {
        self.authorizations
            .iter()
            .find(|a| a.is_failure)
            .map(|a| a.authorization_error.as_deref().unwrap_or("Authorization failed"))
    }
}

/// 不拋出錯誤的操作結果。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub is_ok: bool,
    pub has_warning: bool,
    pub message: String,
}

impl StatusMessage {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            is_ok: true,
            has_warning: false,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            is_ok: true,
            has_warning: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_ok: false,
            has_warning: false,
            message: message.into(),
        }
    }
}

/// 部署或預覽中的一個步驟。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStep {
    pub title: String,
    pub description: String,
    pub has_error: bool,
    pub has_warning: bool,
}

impl ActionStep {
    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            has_error: true,
            has_warning: false,
        }
    }
}

/// 提供者參數的輸入類型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    String,
    MultiLineText,
    Boolean,
    Select,
    MultiSelect,
    RadioButton,
    Checkbox,
}

/// 部署任務或 DNS 提供者宣告的參數描述。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProviderParameter {
    pub key: String,
    pub name: String,
    pub description: String,
    pub is_password: bool,
    pub is_required: bool,
    pub value: Option<String>,
    pub is_credential: bool,
    /// 以 `;` 分隔的選項。
    pub options_list: Option<String>,
    #[serde(rename = "Type")]
    pub option_type: Option<OptionType>,
}

impl Default for ProviderParameter {
    fn default() -> Self {
        Self {
            key: String::new(),
            name: String::new(),
            description: String::new(),
            is_password: false,
            is_required: false,
            value: None,
            is_credential: true,
            options_list: None,
            option_type: None,
        }
    }
}

impl ProviderParameter {
    pub fn options(&self) -> Vec<String> {
        self.options_list
            .as_deref()
            .filter(|list| !list.is_empty())
            .map(|list| list.split(';').map(ToString::to_string).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsZone {
    pub zone_id: String,
    pub name: String,
}

/// 送往儀表板的續約狀態報告。
#[derive(Debug, Clone, Serialize)]
pub struct RenewalStatusReport {
    pub instance_id: Option<String>,
    pub primary_contact_email: Option<String>,
    pub managed_certificate: ManagedCertificate,
    pub app_version: String,
}

/// 單次續約流程的整體結果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateRequestResult {
    pub managed_certificate_id: String,
    pub is_success: bool,
    pub message: String,
    pub pfx_path: Option<String>,
    pub deployment_steps: Vec<ActionStep>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, challenge: ChallengeConfig) -> ManagedCertificate {
        ManagedCertificate {
            name: name.into(),
            request_config: RequestConfig {
                challenges: vec![challenge],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_keyword_is_case_insensitive() {
        let filter = ManagedCertificateFilter {
            keyword: Some("EXAMPLE".into()),
            ..Default::default()
        };
        assert!(filter.matches(&item("www.example.com", ChallengeConfig::default())));
        assert!(!filter.matches(&item("other.org", ChallengeConfig::default())));
    }

    #[test]
    fn test_filter_challenge_fields_are_exact() {
        let dns = ChallengeConfig {
            challenge_type: "dns-01".into(),
            challenge_provider: Some("DNS01.API.Route53".into()),
            challenge_credential_key: Some("cred-1".into()),
            ..Default::default()
        };
        let filter = ManagedCertificateFilter {
            challenge_provider: Some("DNS01.API.Route53".into()),
            stored_credential_key: Some("cred-1".into()),
            ..Default::default()
        };
        assert!(filter.matches(&item("a", dns.clone())));
        let filter = ManagedCertificateFilter {
            challenge_provider: Some("dns01.api.route53".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&item("a", dns)));
    }

    #[test]
    fn test_dirty_flag_is_not_serialized() {
        let mut record = item("a", ChallengeConfig::default());
        record.is_changed = true;
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("IsChanged"));
        assert!(json.contains("\"LastRenewalStatus\":\"NotStarted\""));
        let back: ManagedCertificate = serde_json::from_str(&json).unwrap();
        assert!(!back.is_changed);
    }

    #[test]
    fn test_challenge_config_domain_match() {
        let mut record = item("a", ChallengeConfig::default());
        record.request_config.challenges.push(ChallengeConfig {
            challenge_type: "dns-01".into(),
            domain_match: Some("*.example.com".into()),
            ..Default::default()
        });
        assert_eq!(
            record.challenge_config(Some("*.example.com")).challenge_type(),
            ChallengeType::Dns01
        );
        assert_eq!(
            record.challenge_config(Some("example.com")).challenge_type(),
            ChallengeType::Http01
        );
    }

    #[test]
    fn test_provider_parameter_options() {
        let param = ProviderParameter {
            options_list: Some("a;b;c".into()),
            ..Default::default()
        };
        assert_eq!(param.options(), vec!["a", "b", "c"]);
        assert!(ProviderParameter::default().options().is_empty());
    }

    #[test]
    fn test_task_parameter_lookup() {
        let config = DeploymentTaskConfig {
            parameters: vec![ParameterValue {
                key: "path".into(),
                value: "/srv/certs".into(),
            }],
            ..Default::default()
        };
        assert_eq!(config.parameter("path"), Some("/srv/certs"));
        assert_eq!(config.parameter("missing"), None);
    }

    #[test]
    fn test_empty_key_algorithm_defaults_to_rsa() {
        assert_eq!(
            RequestConfig::default().key_algorithm().unwrap(),
            KeyAlgorithm::Rs256
        );
    }
}
