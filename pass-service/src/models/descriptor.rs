//! Provisioning descriptor stored with every pass.
//!
//! The descriptor says which broker the pass lives on, which queue it
//! activates, which topics it subscribes and which optional resources
//! (client profile, REST delivery point) it brings along. Ownership is
//! recorded per resource so teardown can decide between delete and detach.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Whether a resource was created for the pass or borrowed from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ownership {
    /// Created when the pass was created; deleted on teardown when asked.
    #[serde(alias = "create", alias = "created-by-pass")]
    Owned,
    /// Pre-existing resource; teardown only detaches from it.
    #[serde(alias = "existing", alias = "pre-existing")]
    Referenced,
}

impl Ownership {
    pub fn is_owned(self) -> bool {
        matches!(self, Ownership::Owned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Ownership::Owned => "owned",
            Ownership::Referenced => "referenced",
        }
    }
}

impl std::fmt::Display for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue access type as understood by the broker management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessType {
    #[serde(alias = "Exclusive", alias = "EXCLUSIVE")]
    Exclusive,
    #[serde(alias = "Non-Exclusive", alias = "NON-EXCLUSIVE")]
    NonExclusive,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Exclusive => "exclusive",
            AccessType::NonExclusive => "non-exclusive",
        }
    }
}

/// Permission granted to non-owner clients of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    NoAccess,
    ReadOnly,
    Consume,
    ModifyTopic,
    Delete,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::NoAccess => "no-access",
            Permission::ReadOnly => "read-only",
            Permission::Consume => "consume",
            Permission::ModifyTopic => "modify-topic",
            Permission::Delete => "delete",
        }
    }
}

fn default_permission() -> Permission {
    Permission::Consume
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    pub name: String,
    pub ownership: Ownership,
    pub access_type: AccessType,
    #[serde(default)]
    pub respect_ttl: bool,
    /// Seconds; 0 means no limit.
    #[serde(default)]
    pub max_ttl: u64,
    #[serde(default = "default_permission")]
    pub permission: Permission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientProfileSpec {
    pub name: String,
    pub ownership: Ownership,
    /// Extra broker attributes applied when the profile is created.
    #[serde(default)]
    pub settings: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[serde(alias = "POST")]
    Post,
    #[serde(alias = "PUT")]
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "post",
            HttpMethod::Put => "put",
        }
    }
}

fn default_http_method() -> HttpMethod {
    HttpMethod::Post
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestConsumerSpec {
    pub name: String,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default = "default_http_method")]
    pub http_method: HttpMethod,
}

/// REST delivery path: an RDP, the binding from the pass queue into it, and
/// the consumer it posts to. Always created by (and owned by) the pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestDeliverySpec {
    pub rdp_name: String,
    #[serde(default)]
    pub client_profile: Option<String>,
    pub post_request_target: String,
    pub consumer: RestConsumerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassObject {
    pub broker: String,
    pub queue: QueueSpec,
    #[serde(default)]
    pub client_profile: Option<ClientProfileSpec>,
    #[serde(default, deserialize_with = "subscription_list")]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub rest_delivery: Option<RestDeliverySpec>,
}

impl PassObject {
    /// Client profile the pass must delete on teardown, if any.
    pub fn owned_client_profile(&self) -> Option<&ClientProfileSpec> {
        self.client_profile
            .as_ref()
            .filter(|cp| cp.ownership.is_owned())
    }
}

/// Split a comma-separated topic list, dropping blanks.
pub fn parse_subscriptions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accept either a JSON array of topics or a single comma-separated string.
fn subscription_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::List(items) => items
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        Raw::Joined(joined) => parse_subscriptions(&joined),
    })
}
