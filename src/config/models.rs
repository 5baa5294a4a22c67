//! Configuration data structures for Tollgate.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and every section carries defaults so that a minimal config only
//! needs the values that differ from a stock single-node deployment.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Which key-value store backs the registry and the analytics buckets.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// Connection settings for the key-value store.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// `redis://[user:pass@]host[:port][/db]`, `rediss://` for TLS
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

/// Settings for the forwarding engine.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upper bound for a buffered (REST) upstream exchange, parsed by humantime
    pub request_timeout: String,
    /// Forward the client's `Host` header verbatim on REST/SSE calls
    pub preserve_host: bool,
    /// Scheme used when rewriting relative `Location` headers and no
    /// `X-Forwarded-Proto` header is present
    pub public_scheme: String,
    /// Trusted header carrying the client address (e.g. `cf-connecting-ip`)
    pub client_ip_header: Option<String>,
    /// Trusted header carrying the client country (e.g. `cf-ipcountry`)
    pub country_header: Option<String>,
    /// Number of event-stream lines buffered between upstream and client
    pub event_stream_buffer: usize,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout: "30s".to_string(),
            preserve_host: true,
            public_scheme: "https".to_string(),
            client_ip_header: None,
            country_header: None,
            event_stream_buffer: 16,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Deadline for one detached telemetry write, parsed by humantime
    pub write_timeout: String,
}

impl TelemetryConfig {
    pub fn write_timeout(&self) -> Duration {
        humantime::parse_duration(&self.write_timeout).unwrap_or(Duration::from_secs(5))
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            write_timeout: "5s".to_string(),
        }
    }
}

/// Queue sizes of the live update hub.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct LiveConfig {
    /// Events buffered per dashboard subscriber before it is dropped as slow
    pub subscriber_capacity: usize,
    /// Pending add/remove requests
    pub control_capacity: usize,
    /// Pending published events
    pub publish_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 30,
            control_capacity: 5,
            publish_capacity: 30,
        }
    }
}

/// Policy applied when two service links claim the same incoming address.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostConflictPolicy {
    /// Accept the registry; the earliest link wins at resolution time
    #[default]
    FirstMatch,
    /// Refuse the reconciliation
    Reject,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct RegistryConfig {
    pub host_conflicts: HostConflictPolicy,
    pub id_length: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host_conflicts: HostConflictPolicy::FirstMatch,
            id_length: 15,
        }
    }
}

/// Static token authentication for the management endpoints.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// token -> principal name
    pub tokens: HashMap<String, String>,
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tokens: HashMap::new(),
            cookie_name: "session-token".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store: StoreConfig::default(),
            proxy: ProxyConfig::default(),
            telemetry: TelemetryConfig::default(),
            live: LiveConfig::default(),
            registry: RegistryConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Builder for GatewayConfig, mostly used by tests and embedders
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Use the in-process store instead of Redis
    pub fn memory_store(mut self) -> Self {
        self.config.store.backend = StoreBackend::Memory;
        self
    }

    /// Set the Redis URL (implies the redis backend)
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.store.backend = StoreBackend::Redis;
        self.config.store.url = url.into();
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = proxy;
        self
    }

    pub fn live(mut self, live: LiveConfig) -> Self {
        self.config.live = live;
        self
    }

    pub fn host_conflicts(mut self, policy: HostConflictPolicy) -> Self {
        self.config.registry.host_conflicts = policy;
        self
    }

    /// Register a management token for a principal
    pub fn auth_token(mut self, token: impl Into<String>, principal: impl Into<String>) -> Self {
        self.config.auth.enabled = true;
        self.config
            .auth
            .tokens
            .insert(token.into(), principal.into());
        self
    }

    /// Turn off authentication on the management endpoints
    pub fn without_auth(mut self) -> Self {
        self.config.auth.enabled = false;
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}
