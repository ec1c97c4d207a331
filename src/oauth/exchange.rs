//! OAuth token endpoint calls: code exchange, refresh and revocation.

use super::clients::OAuthClient;
use crate::providers::OAuthEndpoints;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::fmt;

/// Token error bodies are cut to this many bytes before they reach an error message.
const MAX_ERROR_BODY: usize = 512;

/// Plaintext tokens straight from a token endpoint. `Debug` is redacted.
#[derive(Clone, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// OAuth token response (standard OAuth 2.0). Some providers answer 200 with
/// an `error` field instead of a token, so `access_token` is optional here.
#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Builds the provider's authorize URL.
pub fn build_authorize_url(
    endpoints: &OAuthEndpoints,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> String {
    let scopes = endpoints.scopes.join(&endpoints.scope_separator);
    let separator = if endpoints.authorize_url.contains('?') {
        '&'
    } else {
        '?'
    };

    let mut url = format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&state={}",
        endpoints.authorize_url,
        separator,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state)
    );
    if !scopes.is_empty() {
        url.push_str("&scope=");
        url.push_str(&urlencoding::encode(&scopes));
    }
    for (key, value) in &endpoints.extra_authorize_params {
        url.push('&');
        url.push_str(&urlencoding::encode(key));
        url.push('=');
        url.push_str(&urlencoding::encode(value));
    }
    url
}

/// Exchanges an authorization code for tokens.
pub async fn exchange_code(
    http: &Client,
    endpoints: &OAuthEndpoints,
    client: &OAuthClient,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenSet> {
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client.client_id.as_str()),
        ("client_secret", client.client_secret.as_str()),
    ];

    tracing::debug!("Exchanging authorization code for token at {}", endpoints.token_url);
    let response = post_token_endpoint(http, &endpoints.token_url, &form).await?;

    let access_token = response.access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
        anyhow!(
            "Token response has no access_token{}",
            describe_error(&response.error, &response.error_description)
        )
    })?;

    tracing::debug!(
        "Token exchange successful, has_refresh_token={}, expires_in={:?}",
        response.refresh_token.is_some(),
        response.expires_in
    );

    Ok(TokenSet {
        access_token,
        refresh_token: response.refresh_token,
        expires_at: expiry(response.expires_in),
    })
}

/// Uses a refresh token to obtain a new access token.
///
/// The current refresh token is kept if the provider does not rotate it.
pub async fn refresh_tokens(
    http: &Client,
    endpoints: &OAuthEndpoints,
    client: &OAuthClient,
    refresh_token: &str,
) -> Result<TokenSet> {
    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client.client_id.as_str()),
        ("client_secret", client.client_secret.as_str()),
    ];

    let response = post_token_endpoint(http, &endpoints.token_url, &form).await?;

    let access_token = response.access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
        anyhow!(
            "Refresh response has no access_token{}",
            describe_error(&response.error, &response.error_description)
        )
    })?;

    Ok(TokenSet {
        access_token,
        refresh_token: response
            .refresh_token
            .or_else(|| Some(refresh_token.to_string())),
        expires_at: expiry(response.expires_in),
    })
}

/// RFC 7009 token revocation.
pub async fn revoke_token(
    http: &Client,
    revoke_url: &str,
    client: &OAuthClient,
    token: &str,
) -> Result<()> {
    let form = [
        ("token", token),
        ("client_id", client.client_id.as_str()),
        ("client_secret", client.client_secret.as_str()),
    ];

    let response = http
        .post(revoke_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| anyhow!("Failed to send revoke request: {}", e.without_url()))?;

    if !response.status().is_success() {
        bail!("Token revocation failed with status {}", response.status());
    }
    Ok(())
}

async fn post_token_endpoint(
    http: &Client,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    let response = http
        .post(token_url)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| anyhow!("Failed to send token request: {}", e.without_url()))?;

    if !response.status().is_success() {
        let status = response.status();
        let mut body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        bail!("Token endpoint returned status {}: {}", status, body);
    }

    response
        .json::<TokenResponse>()
        .await
        .context("Failed to parse token response")
}

fn expiry(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in.map(|seconds| Utc::now() + Duration::seconds(seconds))
}

fn describe_error(error: &Option<String>, description: &Option<String>) -> String {
    match (error, description) {
        (Some(e), Some(d)) => format!(" ({}: {})", e, d),
        (Some(e), None) => format!(" ({})", e),
        _ => String::new(),
    }
}
