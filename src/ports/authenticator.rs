use async_trait::async_trait;
use http::HeaderMap;
use thiserror::Error;

/// Error type for authentication
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuthError {
    /// No session token on the request
    #[error("Missing session token")]
    MissingToken,

    /// The token is unknown or expired
    #[error("Invalid session token")]
    InvalidToken,
}

/// The authenticated caller of a management endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
        }
    }
}

/// Authenticator gates the management endpoints; it never inspects bodies.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError>;
}
