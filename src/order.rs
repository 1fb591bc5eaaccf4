//! ACME 訂單、授權、帳號與錯誤文件（problem document）的線上格式。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{challenge::ChallengeResource, payload::Identifier};

/// RFC 8555 的 `badNonce` 錯誤類型。
pub const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
pub const ACCOUNT_DOES_NOT_EXIST: &str = "urn:ietf:params:acme:error:accountDoesNotExist";
pub const USER_ACTION_REQUIRED: &str = "urn:ietf:params:acme:error:userActionRequired";
pub const UNAUTHORIZED: &str = "urn:ietf:params:acme:error:unauthorized";

/// 表示訂單狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResource {
    pub status: OrderStatus,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationResource {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub challenges: Vec<ChallengeResource>,
    #[serde(default)]
    pub wildcard: bool,
}

impl AuthorizationResource {
    /// 授權對應的網域；萬用字元授權的識別項不含 `*.`，這裡補回。
    pub fn domain(&self) -> String {
        if self.wildcard {
            format!("*.{}", self.identifier.value)
        } else {
            self.identifier.value.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountResourceStatus {
    Valid,
    Deactivated,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResource {
    pub status: AccountResourceStatus,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(rename = "termsOfServiceAgreed", default)]
    pub terms_of_service_agreed: Option<bool>,
}

/// RFC 7807 錯誤文件。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl Problem {
    pub fn is(&self, problem_type: &str) -> bool {
        self.problem_type == problem_type
    }

    pub fn detail(&self) -> &str {
        self.detail.as_deref().unwrap_or(&self.problem_type)
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.detail, self.status) {
            (Some(detail), Some(status)) => {
                write!(f, "{} {} {}", detail, status, self.problem_type)
            }
            (Some(detail), None) => write!(f, "{} {}", detail, self.problem_type),
            (None, _) => f.write_str(&self.problem_type),
        }
    }
}
