use super::*;
use axum::http::HeaderMap;

fn headers_with(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", value.parse().unwrap());
    headers
}

mod extract_bearer_token_tests {
    use super::*;

    #[test]
    fn valid_bearer_token() {
        let headers = headers_with("Bearer sess-7f3a");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "sess-7f3a");
    }

    #[test]
    fn valid_bearer_token_with_extra_whitespace() {
        let headers = headers_with("Bearer   sess-7f3a  ");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "sess-7f3a");
    }

    #[test]
    fn case_insensitive_bearer() {
        let headers = headers_with("bearer sess-7f3a");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "sess-7f3a");
    }

    #[test]
    fn missing_authorization_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::Missing));
    }

    #[test]
    fn missing_bearer_prefix() {
        let headers = headers_with("sess-7f3a");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn wrong_scheme() {
        let headers = headers_with("Basic dXNlcjpwYXNz");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn empty_token() {
        let headers = headers_with("Bearer ");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::Empty));
    }
}

mod session_resolver_tests {
    use super::*;

    fn sessions() -> StaticSessions {
        let mut tokens = HashMap::new();
        tokens.insert("sess-1".to_string(), "seller-1".to_string());
        StaticSessions::new(tokens)
    }

    #[test]
    fn known_token_resolves_to_seller() {
        let seller = sessions().seller_from_headers(&headers_with("Bearer sess-1"));
        assert_eq!(seller.unwrap(), "seller-1");
    }

    #[test]
    fn unknown_token_is_rejected() {
        let seller = sessions().seller_from_headers(&headers_with("Bearer sess-2"));
        assert_eq!(seller, Err(TokenError::UnknownSession));
    }

    #[test]
    fn passthrough_trusts_token_as_seller() {
        let sessions = StaticSessions::passthrough();
        assert_eq!(sessions.resolve("seller-42").as_deref(), Some("seller-42"));
    }

    #[test]
    fn from_config_respects_passthrough_flag() {
        let config = SessionConfig {
            passthrough: true,
            tokens: HashMap::new(),
        };
        assert!(StaticSessions::from_config(&config).resolve("anyone").is_some());

        let config = SessionConfig::default();
        assert!(StaticSessions::from_config(&config).resolve("anyone").is_none());
    }
}
