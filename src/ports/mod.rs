pub mod authenticator;
pub mod http_client;
pub mod kv_store;
