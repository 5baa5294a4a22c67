pub mod auth;
pub mod http_client;
pub mod http_handler;
pub mod memory_store;
pub mod middleware;
pub mod proxy;
pub mod redis_store;
pub mod websocket;

/// Re-export commonly used types from adapters
pub use auth::StaticTokenAuthenticator;
pub use http_client::HttpClientAdapter;
pub use http_handler::{AppState, build_router};
pub use memory_store::MemoryStore;
pub use middleware::*;
pub use proxy::Forwarder;
pub use redis_store::RedisStore;
