use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{BodySchema, PaymentConfig, RateLimitConfig};

const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 300;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub permits: Vec<PermitConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    #[serde(default)]
    pub endpoints: Vec<ApiEndpointConfig>,
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
}

fn default_backend_timeout_secs() -> u64 {
    DEFAULT_BACKEND_TIMEOUT_SECS
}

impl GatewayConfig {
    pub fn permit_by_key(&self, api_key: &str) -> Option<&PermitConfig> {
        self.permits.iter().find(|permit| permit.api_key == api_key)
    }

    pub fn policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.iter().find(|policy| policy.name == name)
    }

    pub fn endpoint(&self, name: &str) -> Option<&ApiEndpointConfig> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PermitConfig {
    pub id: String,
    pub api_key: String,
    pub user_id: String,
    pub endpoint: String,
    pub policy: String,
    pub enabled: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until_ms: Option<u64>,
    #[serde(default)]
    pub test_permit: bool,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl std::fmt::Debug for PermitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitConfig")
            .field("id", &self.id)
            .field("api_key", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("endpoint", &self.endpoint)
            .field("policy", &self.policy)
            .field("enabled", &self.enabled)
            .field("blocked", &self.blocked)
            .field("block_reason", &self.block_reason)
            .field("valid_from_ms", &self.valid_from_ms)
            .field("valid_until_ms", &self.valid_until_ms)
            .field("test_permit", &self.test_permit)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

impl PermitConfig {
    pub fn new(
        id: impl Into<String>,
        api_key: impl Into<String>,
        user_id: impl Into<String>,
        endpoint: impl Into<String>,
        policy: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            api_key: api_key.into(),
            user_id: user_id.into(),
            endpoint: endpoint.into(),
            policy: policy.into(),
            enabled: true,
            blocked: false,
            block_reason: None,
            valid_from_ms: None,
            valid_until_ms: None,
            test_permit: false,
            created_at_ms: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiEndpointConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_message: Option<String>,
    pub versions: Vec<ApiVersionConfig>,
}

impl ApiEndpointConfig {
    pub fn version(&self, number: u32) -> Option<&ApiVersionConfig> {
        self.versions.iter().find(|version| version.version == number)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Soap,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiVersionConfig {
    pub version: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_message: Option<String>,
    pub protocol: Protocol,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub header_params: Vec<String>,
    #[serde(default)]
    pub query_params: Vec<String>,
    #[serde(default)]
    pub path_params: Vec<String>,
    #[serde(default)]
    pub static_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub has_body: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_schema: Option<BodySchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soap_template: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "GET".to_string()
}
