use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to upstreams
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to an upstream service
    ///
    /// Redirects are never followed: a 3xx answer is returned as-is.
    ///
    /// # Arguments
    /// * `req` - The HTTP request to send, with an absolute URI
    /// * `timeout` - Deadline for receiving the response head; `None` waits forever
    ///
    /// # Returns
    /// A future that resolves to the upstream's response or an error
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        timeout: Option<Duration>,
    ) -> HttpClientResult<Response<AxumBody>>;
}
