//! Turning an operation template into an HTTP request, and sending it.
//!
//! Templates may reference call parameters as `{name}` and decrypted credential
//! fields as `{credentials.name}`. A JSON body string that is exactly one
//! placeholder keeps the parameter's JSON type.

use crate::error::{BrokerError, BrokerResult};
use crate::integration::Environment;
use crate::providers::{AuthInjection, OperationTemplate, ProviderDescriptor};
use crate::vault::PlainCredentials;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value};
use std::fmt;

/// Provider error bodies are kept for diagnostics, capped at this many bytes.
const MAX_ERROR_BODY: usize = 2048;

/// A fully resolved request. `Debug` prints header names only.
pub struct PreparedCall {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl fmt::Debug for PreparedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedCall")
            .field("method", &self.method)
            .field("url", &self.url)
            .field(
                "query",
                &self.query.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .field(
                "headers",
                &self.headers.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Resolution context for placeholders.
struct Bindings<'a> {
    params: &'a Map<String, Value>,
    credentials: &'a PlainCredentials,
}

impl Bindings<'_> {
    fn lookup(&self, name: &str) -> BrokerResult<Value> {
        if let Some(field) = name.strip_prefix("credentials.") {
            return self
                .credentials
                .get(field)
                .map(|v| Value::String(v.to_string()))
                .ok_or_else(|| {
                    BrokerError::InvalidInput(format!("missing credential field '{}'", field))
                });
        }
        self.params
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidInput(format!("missing parameter '{}'", name)))
    }

    fn lookup_text(&self, name: &str) -> BrokerResult<String> {
        match self.lookup(name)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(BrokerError::InvalidInput(format!(
                "parameter '{}' must be a string, number or boolean",
                name
            ))),
        }
    }

    /// Replaces every `{name}` in `template`; `encode` percent-encodes each value.
    fn render(&self, template: &str, encode: bool) -> BrokerResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) if is_placeholder(&after[..end]) => {
                    let value = self.lookup_text(&after[..end])?;
                    if encode {
                        out.push_str(&urlencoding::encode(&value));
                    } else {
                        out.push_str(&value);
                    }
                    rest = &after[end + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    fn render_json(&self, template: &Value) -> BrokerResult<Value> {
        Ok(match template {
            Value::String(s) => match whole_placeholder(s) {
                Some(name) => self.lookup(name)?,
                None => Value::String(self.render(s, false)?),
            },
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_json(v))
                    .collect::<BrokerResult<_>>()?,
            ),
            Value::Object(fields) => {
                let mut rendered = Map::with_capacity(fields.len());
                for (k, v) in fields {
                    rendered.insert(k.clone(), self.render_json(v)?);
                }
                Value::Object(rendered)
            }
            other => other.clone(),
        })
    }
}

fn is_placeholder(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn whole_placeholder(s: &str) -> Option<&str> {
    s.strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .filter(|name| is_placeholder(name))
}

/// Resolves `template` into a request against the environment's base URL and
/// attaches credentials per the descriptor. `access_token` is set for `oauth2`
/// providers and sent as a bearer token.
pub fn prepare(
    descriptor: &ProviderDescriptor,
    environment: Environment,
    template: &OperationTemplate,
    params: &Map<String, Value>,
    credentials: &PlainCredentials,
    access_token: Option<&str>,
) -> BrokerResult<PreparedCall> {
    let bindings = Bindings {
        params,
        credentials,
    };

    let method = Method::from_bytes(template.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| BrokerError::Configuration(format!("invalid method '{}'", template.method)))?;

    let base = descriptor.base_url(environment).trim_end_matches('/');
    let path = bindings.render(&template.path, true)?;
    let url = if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };

    let mut query = template
        .query
        .iter()
        .map(|(k, v)| Ok((k.clone(), bindings.render(v, false)?)))
        .collect::<BrokerResult<Vec<_>>>()?;

    let mut headers = template
        .headers
        .iter()
        .map(|(k, v)| Ok((k.clone(), bindings.render(v, false)?)))
        .collect::<BrokerResult<Vec<_>>>()?;

    let mut body = template
        .body
        .as_ref()
        .map(|b| bindings.render_json(b))
        .transpose()?;

    if let Some(token) = access_token {
        headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
    }

    for injection in &descriptor.auth {
        let field = |name: &str| -> BrokerResult<String> {
            credentials.get(name).map(str::to_string).ok_or_else(|| {
                BrokerError::InvalidInput(format!("missing credential field '{}'", name))
            })
        };

        match injection {
            AuthInjection::Header {
                name,
                field: f,
                prefix,
            } => {
                let value = field(f)?;
                let value = match prefix {
                    Some(p) => format!("{}{}", p, value),
                    None => value,
                };
                headers.push((name.clone(), value));
            }
            AuthInjection::Query { name, field: f } => query.push((name.clone(), field(f)?)),
            AuthInjection::Body { name, field: f } => {
                let value = Value::String(field(f)?);
                match body.get_or_insert_with(|| Value::Object(Map::new())) {
                    Value::Object(map) => {
                        map.insert(name.clone(), value);
                    }
                    _ => {
                        return Err(BrokerError::Configuration(format!(
                            "provider '{}' injects credentials into a non-object body",
                            descriptor.name
                        )))
                    }
                }
            }
            AuthInjection::Bearer { field: f } => {
                headers.push(("Authorization".to_string(), format!("Bearer {}", field(f)?)));
            }
            AuthInjection::Basic {
                username_field,
                password_field,
            } => {
                let user = field(username_field)?;
                let pass = match password_field {
                    Some(p) => field(p)?,
                    None => String::new(),
                };
                let encoded = BASE64.encode(format!("{}:{}", user, pass));
                headers.push(("Authorization".to_string(), format!("Basic {}", encoded)));
            }
        }
    }

    Ok(PreparedCall {
        method,
        url,
        query,
        headers,
        body,
    })
}

/// A 2xx reply; the body is JSON when it parses, otherwise a JSON string.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub status: u16,
    pub body: Value,
}

/// Why a provider call did not produce a 2xx reply.
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    Unauthorized { body: String },
    /// Timeout, connection failure or 5xx.
    Unavailable(String),
    Rejected { status: u16, body: String },
}

impl CallFailure {
    pub fn into_error(self, provider: &str) -> BrokerError {
        match self {
            CallFailure::Unauthorized { body } => BrokerError::InvalidRequest {
                provider: provider.to_string(),
                status: StatusCode::UNAUTHORIZED.as_u16(),
                body,
            },
            CallFailure::Unavailable(message) => BrokerError::ProviderUnavailable {
                provider: provider.to_string(),
                message,
            },
            CallFailure::Rejected { status, body } => BrokerError::InvalidRequest {
                provider: provider.to_string(),
                status,
                body,
            },
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Unauthorized { .. } => f.write_str("unauthorized (401)"),
            CallFailure::Unavailable(message) => write!(f, "unavailable: {}", message),
            CallFailure::Rejected { status, .. } => write!(f, "rejected with status {}", status),
        }
    }
}

/// Sends a prepared call. The client's own timeout bounds the whole exchange.
pub async fn execute(http: &Client, call: &PreparedCall) -> Result<ProviderReply, CallFailure> {
    let mut request = http
        .request(call.method.clone(), &call.url)
        .header("Accept", "application/json");
    if !call.query.is_empty() {
        request = request.query(&call.query);
    }
    for (name, value) in &call.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &call.body {
        request = request.json(body);
    }

    let response = request.send().await.map_err(transport_failure)?;
    let status = response.status();
    let text = response.text().await.map_err(transport_failure)?;

    if status == StatusCode::UNAUTHORIZED {
        return Err(CallFailure::Unauthorized {
            body: truncate(text),
        });
    }
    if status.is_server_error() {
        return Err(CallFailure::Unavailable(format!(
            "provider returned status {}",
            status.as_u16()
        )));
    }
    if !status.is_success() {
        return Err(CallFailure::Rejected {
            status: status.as_u16(),
            body: truncate(text),
        });
    }

    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };

    Ok(ProviderReply {
        status: status.as_u16(),
        body,
    })
}

// URLs may carry query-injected credentials, so they never reach the message
fn transport_failure(e: reqwest::Error) -> CallFailure {
    if e.is_timeout() {
        CallFailure::Unavailable("request timed out".to_string())
    } else {
        CallFailure::Unavailable(e.without_url().to_string())
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
