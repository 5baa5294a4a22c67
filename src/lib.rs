//! Tollgate - a self-hosted reverse-proxy gateway with live per-service analytics.
//!
//! Tollgate maps external hostnames to backend services and relays plain HTTP,
//! WebSocket and Server-Sent-Events traffic to them. Every forwarded request is
//! counted into self-expiring time buckets kept in a key-value store and announced to
//! live dashboards through an in-process fan-out hub.
//!
//! # Features
//! - Host-based routing table, reconciled from a desired list and persisted to Redis
//! - REST forwarding with relative-redirect rewriting, line-by-line SSE relay, and
//!   bidirectional WebSocket relay
//! - Minute / hour / day / month analytics buckets that expire through store TTLs
//! - Live update hub that drops slow subscribers instead of stalling
//! - Token-gated management API and structured tracing via `tracing`
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use tollgate::{AppState, GatewayConfig, MemoryStore, build_router};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = GatewayConfig::builder().memory_store().without_auth().build();
//! let state = AppState::assemble(&config, Arc::new(MemoryStore::new()), CancellationToken::new()).await?;
//! let app = build_router(state);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits for the key-value store, the upstream HTTP
//! client and the authenticator) from **adapters** (their implementations plus the
//! axum surface) while the routing, telemetry and hub logic lives in `core`.
//!
//! # Error Handling
//! Components return their own `thiserror` enums; bootstrap code returns
//! `eyre::Result<T>` with context attached through `WrapErr`.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{
        AppState, Forwarder, HttpClientAdapter, MemoryStore, RedisStore, StaticTokenAuthenticator,
        build_router,
    },
    config::GatewayConfig,
    core::{LiveHub, ServiceRegistry, TelemetryStore},
    ports::{http_client::HttpClient, kv_store::KeyValueStore},
    utils::GracefulShutdown,
};
