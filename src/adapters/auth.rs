use std::collections::HashMap;

use async_trait::async_trait;
use http::{HeaderMap, header};

use crate::{
    config::AuthConfig,
    ports::authenticator::{AuthError, Authenticator, Principal},
};

/// Looks session tokens up in the configured token table.
///
/// The token is read from `Authorization: Bearer <token>` or, failing that, from the
/// session cookie. With authentication disabled every caller is `anonymous`.
pub struct StaticTokenAuthenticator {
    enabled: bool,
    tokens: HashMap<String, String>,
    cookie_name: String,
}

impl StaticTokenAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            enabled: config.enabled,
            tokens: config.tokens.clone(),
            cookie_name: config.cookie_name.clone(),
        }
    }

    fn bearer(headers: &HeaderMap) -> Option<&str> {
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let (scheme, token) = value.split_once(' ')?;
        scheme
            .eq_ignore_ascii_case("bearer")
            .then(|| token.trim())
            .filter(|t| !t.is_empty())
    }

    fn cookie<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value.trim())
            .filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        if !self.enabled {
            return Ok(Principal::anonymous());
        }
        let token = Self::bearer(headers)
            .or_else(|| self.cookie(headers))
            .ok_or(AuthError::MissingToken)?;
        self.tokens
            .get(token)
            .map(|name| Principal { name: name.clone() })
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn authenticator() -> StaticTokenAuthenticator {
        let mut config = AuthConfig::default();
        config.tokens.insert("s3cret".to_string(), "admin".to_string());
        StaticTokenAuthenticator::new(&config)
    }

    #[tokio::test]
    async fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        let principal = authenticator().authenticate(&headers).await.unwrap();
        assert_eq!(principal.name, "admin");
    }

    #[tokio::test]
    async fn test_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session-token=s3cret"),
        );
        let principal = authenticator().authenticate(&headers).await.unwrap();
        assert_eq!(principal.name, "admin");
    }

    #[tokio::test]
    async fn test_missing_and_invalid_tokens() {
        let auth = authenticator();
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()).await,
            Err(AuthError::MissingToken)
        ));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(matches!(
            auth.authenticate(&headers).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_disabled_auth_is_anonymous() {
        let config = AuthConfig {
            enabled: false,
            ..AuthConfig::default()
        };
        let principal = StaticTokenAuthenticator::new(&config)
            .authenticate(&HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(principal, Principal::anonymous());
    }
}
