use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging driven by the `[logging]` config section. `RUST_LOG`, when set, takes
/// precedence over `level`.
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.with_ansi(true))
            .try_init()
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(
        "Tollgate logging initialized with level: {}, json: {}",
        level,
        json_format
    );
    Ok(())
}

/// Span for one management or proxied request.
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
    )
}

/// Span for one forwarded exchange with a backend service.
pub fn create_upstream_span(
    service_id: &str,
    method: &str,
    upstream_url: &str,
    kind: &str,
) -> tracing::Span {
    tracing::info_span!(
        "upstream_request",
        service.id = service_id,
        http.method = method,
        upstream.url = upstream_url,
        proxy.kind = kind,
        http.status_code = tracing::field::Empty,
    )
}

/// Span tagging a long-running component task.
pub fn configure_component_tracing(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}
