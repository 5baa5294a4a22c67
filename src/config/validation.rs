#![allow(clippy::collapsible_if)]

use std::net::SocketAddr;

use eyre::Result;

use crate::config::models::{
    AuthConfig, GatewayConfig, LiveConfig, ProxyConfig, StoreBackend, StoreConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid store configuration: {message}")]
    InvalidStore { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, collecting every problem
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_store(&config.store) {
            errors.push(e);
        }

        if let Err(mut proxy_errors) = Self::validate_proxy(&config.proxy) {
            errors.append(&mut proxy_errors);
        }

        if let Err(e) = Self::validate_duration(
            &config.telemetry.write_timeout,
            "telemetry.write_timeout",
        ) {
            errors.push(e);
        }

        if let Err(mut live_errors) = Self::validate_live(&config.live) {
            errors.append(&mut live_errors);
        }

        if config.registry.id_length < 8 {
            errors.push(ValidationError::InvalidField {
                field: "registry.id_length".to_string(),
                message: "Service ids must be at least 8 characters long".to_string(),
            });
        }

        if let Err(e) = Self::validate_auth(&config.auth) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_store(store: &StoreConfig) -> ValidationResult<()> {
        if store.backend == StoreBackend::Memory {
            return Ok(());
        }
        let parsed = url::Url::parse(&store.url).map_err(|e| ValidationError::InvalidStore {
            message: format!("'{}' is not a valid URL: {e}", store.url),
        })?;
        match parsed.scheme() {
            "redis" | "rediss" => Ok(()),
            other => Err(ValidationError::InvalidStore {
                message: format!("Store URL scheme must be redis or rediss, got: {other}"),
            }),
        }
    }

    fn validate_proxy(proxy: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_duration(&proxy.request_timeout, "proxy.request_timeout") {
            errors.push(e);
        }

        if proxy.public_scheme != "http" && proxy.public_scheme != "https" {
            errors.push(ValidationError::InvalidField {
                field: "proxy.public_scheme".to_string(),
                message: format!("Must be 'http' or 'https', got '{}'", proxy.public_scheme),
            });
        }

        for (field, header) in [
            ("proxy.client_ip_header", &proxy.client_ip_header),
            ("proxy.country_header", &proxy.country_header),
        ] {
            if let Some(name) = header {
                if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                    errors.push(ValidationError::InvalidField {
                        field: field.to_string(),
                        message: format!("'{name}' is not a valid header name"),
                    });
                }
            }
        }

        if proxy.event_stream_buffer == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy.event_stream_buffer".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_live(live: &LiveConfig) -> Result<(), Vec<ValidationError>> {
        let errors: Vec<ValidationError> = [
            ("live.subscriber_capacity", live.subscriber_capacity),
            ("live.control_capacity", live.control_capacity),
            ("live.publish_capacity", live.publish_capacity),
        ]
        .into_iter()
        .filter(|(_, capacity)| *capacity == 0)
        .map(|(field, _)| ValidationError::InvalidField {
            field: field.to_string(),
            message: "Queue capacity must be at least 1".to_string(),
        })
        .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_auth(auth: &AuthConfig) -> ValidationResult<()> {
        if auth.enabled && auth.tokens.is_empty() {
            return Err(ValidationError::MissingField {
                field: "auth.tokens (required while auth.enabled = true)".to_string(),
            });
        }
        Ok(())
    }

    fn validate_duration(value: &str, field: &str) -> ValidationResult<()> {
        match humantime::parse_duration(value) {
            Ok(duration) if duration.is_zero() => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "Duration must be greater than zero".to_string(),
            }),
            Ok(_) => Ok(()),
            Err(e) => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("Invalid duration '{value}': {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
