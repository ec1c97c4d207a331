//! Seller sessions for the seller-facing routes.
//!
//! The marketplace's own login system issues the bearer tokens; the broker
//! only maps a token to a seller id through a [`SessionResolver`].

use crate::config::SessionConfig;
use axum::http::HeaderMap;
use std::collections::HashMap;

#[cfg(test)]
mod tests;

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let (scheme, token) = header_value
        .split_once(' ')
        .ok_or(TokenError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>"
    InvalidFormat,
    Empty,
    /// Well-formed token that maps to no seller
    UnknownSession,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization token not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization token format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
            TokenError::UnknownSession => write!(f, "Session not recognized"),
        }
    }
}

impl std::error::Error for TokenError {}

/// Maps a session token to the seller it belongs to.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<String>;

    /// Resolves the seller behind the request's bearer token.
    fn seller_from_headers(&self, headers: &HeaderMap) -> Result<String, TokenError> {
        let token = extract_bearer_token(headers)?;
        self.resolve(&token).ok_or(TokenError::UnknownSession)
    }
}

/// Session tokens from `[sessions]`, or pass-through where the token is the seller id.
pub struct StaticSessions {
    passthrough: bool,
    tokens: HashMap<String, String>,
}

impl StaticSessions {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            passthrough: false,
            tokens,
        }
    }

    /// Development mode: every token is accepted as a seller id.
    pub fn passthrough() -> Self {
        Self {
            passthrough: true,
            tokens: HashMap::new(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        if config.passthrough {
            tracing::warn!("Session pass-through enabled; bearer tokens are trusted as seller ids");
            return Self::passthrough();
        }
        Self::new(config.tokens.clone())
    }
}

impl SessionResolver for StaticSessions {
    fn resolve(&self, token: &str) -> Option<String> {
        if self.passthrough {
            return Some(token.to_string());
        }
        self.tokens.get(token).cloned()
    }
}
