//! Provider descriptors: how to talk to each supported third party.
//!
//! Descriptors are plain data loaded once at startup. Adding a provider is a
//! new `[[providers]]` table, never a new code path.

mod registry;

pub use registry::ProviderRegistry;

use crate::integration::Environment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCategory {
    Warehouse,
    Dropshipping,
    Payment,
    Accounting,
    Advertising,
    Communication,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    #[serde(rename = "oauth2")]
    OAuth2,
    #[serde(rename = "api_key")]
    ApiKey,
    #[serde(rename = "manual")]
    Manual,
}

/// Authorization-code endpoints of an `oauth2` provider.
#[derive(Clone, Debug, Deserialize)]
pub struct OAuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub revoke_url: Option<String>,
    #[serde(default = "default_scope_separator")]
    pub scope_separator: String,
    /// Extra query parameters some providers require on the authorize URL
    /// (e.g. `access_type = "offline"`).
    #[serde(default)]
    pub extra_authorize_params: BTreeMap<String, String>,
}

fn default_scope_separator() -> String {
    " ".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct BaseUrls {
    pub sandbox: String,
    pub live: String,
}

impl BaseUrls {
    pub fn for_environment(&self, environment: Environment) -> &str {
        match environment {
            Environment::Sandbox => &self.sandbox,
            Environment::Live => &self.live,
        }
    }
}

/// Where a credential field is attached to an outgoing request.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "location", rename_all = "lowercase")]
pub enum AuthInjection {
    Header {
        name: String,
        field: String,
        #[serde(default)]
        prefix: Option<String>,
    },
    Query {
        name: String,
        field: String,
    },
    Body {
        name: String,
        field: String,
    },
    Bearer {
        field: String,
    },
    Basic {
        username_field: String,
        #[serde(default)]
        password_field: Option<String>,
    },
}

impl AuthInjection {
    /// Credential fields this injection reads.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            AuthInjection::Header { field, .. }
            | AuthInjection::Query { field, .. }
            | AuthInjection::Body { field, .. }
            | AuthInjection::Bearer { field } => vec![field.as_str()],
            AuthInjection::Basic {
                username_field,
                password_field,
            } => {
                let mut fields = vec![username_field.as_str()];
                if let Some(p) = password_field {
                    fields.push(p.as_str());
                }
                fields
            }
        }
    }
}

/// Target type a normalized field is coerced to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Keep the provider's JSON value as-is.
    #[default]
    Any,
    Integer,
    Decimal,
    String,
}

/// Canonical field ← candidate source fields, first present wins.
///
/// ```toml
/// quantity = ["stock", "quantity", "inventory_count"]
/// price = { sources = ["price", "retail_price"], kind = "decimal" }
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldMapping {
    Sources(Vec<String>),
    Typed {
        sources: Vec<String>,
        #[serde(default)]
        kind: FieldKind,
    },
}

impl FieldMapping {
    pub fn sources(&self) -> &[String] {
        match self {
            FieldMapping::Sources(sources) => sources,
            FieldMapping::Typed { sources, .. } => sources,
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldMapping::Sources(_) => FieldKind::Any,
            FieldMapping::Typed { kind, .. } => *kind,
        }
    }
}

/// Endpoint template for one logical operation.
#[derive(Clone, Debug, Deserialize)]
pub struct OperationTemplate {
    pub method: String,
    /// Path appended to the environment's base URL; may hold `{param}` and
    /// `{credentials.<field>}` placeholders.
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON pointer to the record array (e.g. `/data/items`). Absent means the
    /// whole response is the record (or array of records).
    #[serde(default)]
    pub items_path: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldMapping>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundMapping {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldMapping>,
}

/// Static description of one provider.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub category: ProviderCategory,
    pub auth_mode: AuthMode,
    /// Fields a direct connect must supply.
    #[serde(default)]
    pub credential_fields: Vec<String>,
    #[serde(default)]
    pub oauth: Option<OAuthEndpoints>,
    pub base_url: BaseUrls,
    #[serde(default)]
    pub auth: Vec<AuthInjection>,
    #[serde(default)]
    pub operations: BTreeMap<String, OperationTemplate>,
    /// Event patterns forwarded to this provider's webhook (`order.*`, `*`).
    #[serde(default)]
    pub webhook_events: Vec<String>,
    #[serde(default)]
    pub inbound: InboundMapping,
}

impl ProviderDescriptor {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_oauth(&self) -> bool {
        self.auth_mode == AuthMode::OAuth2
    }

    pub fn operation(&self, name: &str) -> Option<&OperationTemplate> {
        self.operations.get(name)
    }

    pub fn supports(&self, operation: &str) -> bool {
        self.operations.contains_key(operation)
    }

    pub fn base_url(&self, environment: Environment) -> &str {
        self.base_url.for_environment(environment)
    }

    /// Whether any of the declared webhook patterns matches `event`.
    pub fn wants_event(&self, event: &str) -> bool {
        self.webhook_events
            .iter()
            .any(|pattern| event_matches(pattern, event))
    }
}

/// `*` matches everything, `order.*` matches every `order.` event, anything
/// else must match exactly.
pub fn event_matches(pattern: &str, event: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => event.starts_with(prefix),
        None => pattern == event,
    }
}

/// Public listing entry for `GET /api/providers`.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub display_name: String,
    pub category: ProviderCategory,
    pub auth_mode: AuthMode,
    pub credential_fields: Vec<String>,
    pub operations: Vec<String>,
}

impl From<&ProviderDescriptor> for ProviderSummary {
    fn from(d: &ProviderDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            display_name: d.display_name().to_string(),
            category: d.category,
            auth_mode: d.auth_mode,
            credential_fields: d.credential_fields.clone(),
            operations: d.operations.keys().cloned().collect(),
        }
    }
}
