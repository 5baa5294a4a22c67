use std::{fmt, str::FromStr};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters used for service ids: URL safe, without look-alikes (l/I, O/0).
pub const SERVICE_ID_CHARSET: &[u8] =
    b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ123456789";

/// Default length of a freshly assigned service id.
pub const SERVICE_ID_LENGTH: usize = 15;

/// Errors related to service addresses
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServiceAddressError {
    #[error("Invalid service address: {0}")]
    InvalidAddress(String),
}

/// Protocol + domain + port of a backend service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub protocol: String,
    pub domain: String,
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(protocol: impl Into<String>, domain: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            domain: domain.into(),
            port,
        }
    }

    /// Whether the backend is reached over TLS
    pub fn is_secure(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("https")
    }

    /// `domain:port`, the value the upstream expects in `Host`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.domain, self.port)
    }

    /// WebSocket form of the address (`http` → `ws`, `https` → `wss`)
    pub fn websocket_base(&self) -> String {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        format!("{scheme}://{}", self.authority())
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.domain, self.port)
    }
}

impl FromStr for ServiceAddress {
    type Err = ServiceAddressError;

    /// Parse `protocol://domain[:port]`; the port defaults from the protocol.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = url::Url::parse(s)
            .map_err(|e| ServiceAddressError::InvalidAddress(format!("{s}: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ServiceAddressError::InvalidAddress(format!(
                "protocol must be http or https, got: {}",
                url.scheme()
            )));
        }
        let domain = url
            .host_str()
            .ok_or_else(|| ServiceAddressError::InvalidAddress(format!("{s}: missing host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ServiceAddressError::InvalidAddress(format!("{s}: missing port")))?;
        Ok(Self::new(url.scheme(), domain, port))
    }
}

/// One routed backend: the hostnames it answers for and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLink {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub incoming_addresses: Vec<String>,
    pub outgoing_address: ServiceAddress,
}

impl ServiceLink {
    /// True when `host` is one of this link's incoming addresses (ASCII case-insensitive)
    pub fn answers_for(&self, host: &str) -> bool {
        self.incoming_addresses
            .iter()
            .any(|incoming| incoming.eq_ignore_ascii_case(host))
    }

    /// Drop duplicate incoming addresses, keeping first occurrences.
    pub fn dedup_incoming(&mut self) {
        let mut seen: Vec<String> = Vec::with_capacity(self.incoming_addresses.len());
        self.incoming_addresses.retain(|address| {
            let lowered = address.to_ascii_lowercase();
            if seen.contains(&lowered) {
                false
            } else {
                seen.push(lowered);
                true
            }
        });
    }
}

/// Draw a fresh opaque id of `length` characters from [`SERVICE_ID_CHARSET`].
pub fn generate_service_id(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| SERVICE_ID_CHARSET[rng.random_range(0..SERVICE_ID_CHARSET.len())] as char)
        .collect()
}
