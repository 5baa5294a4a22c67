use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, RawQuery, Request, State},
    http::StatusCode,
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{any, get, post},
};
use eyre::WrapErr;
use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    adapters::{
        auth::StaticTokenAuthenticator,
        http_client::HttpClientAdapter,
        middleware::{request_id_middleware, request_timing_middleware, require_principal},
        proxy::Forwarder,
    },
    config::GatewayConfig,
    core::{
        hub::{HubError, LiveHub},
        registry::{RegistryError, ServiceRegistry},
        service::ServiceLink,
        telemetry::{AnalyticsBucket, TelemetryStore},
        timescale::TimeScale,
    },
    ports::{
        authenticator::Authenticator,
        http_client::HttpClient,
        kv_store::{KeyValueStore, StoreError},
    },
};

/// Everything the HTTP surface needs, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub telemetry: TelemetryStore,
    pub hub: LiveHub,
    pub forwarder: Forwarder,
    pub authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    /// Wire the gateway components over `store`: restore the registry, start the
    /// live hub (stopped by `shutdown`) and build the forwarding engine.
    pub async fn assemble(
        config: &GatewayConfig,
        store: Arc<dyn KeyValueStore>,
        shutdown: CancellationToken,
    ) -> eyre::Result<Self> {
        let telemetry = TelemetryStore::new(store.clone());
        let registry = Arc::new(
            ServiceRegistry::load(store, telemetry.clone(), config.registry)
                .await
                .wrap_err("Failed to load the service registry")?,
        );
        let hub = LiveHub::spawn(config.live, shutdown);
        let client: Arc<dyn HttpClient> =
            Arc::new(HttpClientAdapter::new().wrap_err("Failed to create HTTP client adapter")?);
        let forwarder = Forwarder::new(
            registry.clone(),
            client,
            telemetry.clone(),
            hub.clone(),
            &config.proxy,
            &config.telemetry,
        );
        let authenticator: Arc<dyn Authenticator> =
            Arc::new(StaticTokenAuthenticator::new(&config.auth));

        Ok(Self {
            registry,
            telemetry,
            hub,
            forwarder,
            authenticator,
        })
    }
}

/// Errors of the management endpoints.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Analytics unavailable: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Registry(RegistryError::HostConflict { .. }) => StatusCode::CONFLICT,
            ApiError::Registry(RegistryError::InvalidAddress { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Hub(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!("Management request failed with {}: {}", status, self);
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Dashboard view of one service: its link plus the buckets of each time step.
#[derive(Debug, Serialize)]
pub struct ServiceData {
    pub hour: BTreeMap<String, AnalyticsBucket>,
    pub day: BTreeMap<String, AnalyticsBucket>,
    pub month: BTreeMap<String, AnalyticsBucket>,
    pub year: BTreeMap<String, AnalyticsBucket>,
    #[serde(flatten)]
    pub link: ServiceLink,
}

impl ServiceData {
    fn new(link: ServiceLink) -> Self {
        Self {
            hour: BTreeMap::new(),
            day: BTreeMap::new(),
            month: BTreeMap::new(),
            year: BTreeMap::new(),
            link,
        }
    }

    fn slot(&mut self, scale: TimeScale) -> &mut BTreeMap<String, AnalyticsBucket> {
        match scale {
            TimeScale::Minute => &mut self.hour,
            TimeScale::Hour => &mut self.day,
            TimeScale::Day => &mut self.month,
            TimeScale::Month => &mut self.year,
        }
    }
}

const SERVICE_PREFIX: &str = "/api/service";

/// Build the gateway router.
///
/// * `/api/service-data`, `/api/services-set`, `/api/service-data-live`: management,
///   behind the authenticator
/// * `/health`: liveness and a few counters
/// * `/api/service/{*path}`: host-routed proxy entry point
/// * anything else outside `/api/`: proxied with its full path
pub fn build_router(state: AppState) -> Router {
    let management = Router::new()
        .route("/api/service-data", get(service_data))
        .route("/api/services-set", post(services_set))
        .route("/api/service-data-live", get(service_data_live))
        .route_layer(middleware::from_fn_with_state(
            state.authenticator.clone(),
            require_principal,
        ));

    Router::new()
        .merge(management)
        .route("/health", get(health))
        .route(SERVICE_PREFIX, any(proxy_service))
        .route("/api/service/", any(proxy_service))
        .route("/api/service/{*path}", any(proxy_service))
        .fallback(proxy_fallback)
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.hub.is_running();
    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if running { "healthy" } else { "degraded" },
        "services": state.registry.len(),
        "live_subscribers": state.hub.subscriber_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (status, Json(body))
}

/// `GET /api/service-data?time-step=<hour|day|month|year>&service=<host or id>`
///
/// Every service is returned with the buckets of the requested time step; services
/// named by `service=` carry all four.
async fn service_data(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Json<Vec<ServiceData>>, ApiError> {
    let mut step = TimeScale::Minute;
    let mut detailed: Vec<String> = Vec::new();
    let query = query.unwrap_or_default();
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match name.as_ref() {
            "time-step" => step = TimeScale::from_time_step(&value),
            "service" => match state.registry.resolve(&value) {
                Ok(link) => detailed.push(link.id),
                Err(e) => debug!("Ignoring service filter {}: {}", value, e),
            },
            _ => {}
        }
    }

    let links = state.registry.snapshot();
    let mut services = Vec::with_capacity(links.len());
    for link in links.iter() {
        let scales: &[TimeScale] = if detailed.contains(&link.id) {
            &TimeScale::ALL
        } else {
            std::slice::from_ref(&step)
        };
        let mut data = ServiceData::new(link.clone());
        for scale in scales {
            *data.slot(*scale) = state.telemetry.query(&link.id, *scale).await?;
        }
        services.push(data);
    }
    Ok(Json(services))
}

/// `POST /api/services-set`: reconcile the registry against the posted list.
async fn services_set(
    State(state): State<AppState>,
    Json(desired): Json<Vec<ServiceLink>>,
) -> Result<Json<Vec<ServiceLink>>, ApiError> {
    let reconciled = state.registry.reconcile(desired).await?;
    info!("Registry now routes {} services", reconciled.len());
    Ok(Json(reconciled))
}

/// `GET /api/service-data-live`: one SSE `data:` frame per forwarded request until
/// the client leaves, the hub drops it as too slow, or the gateway shuts down.
async fn service_data_live(State(state): State<AppState>) -> Result<Response, ApiError> {
    let subscription = state.hub.subscribe().await?;
    debug!("Live dashboard subscribed as {}", subscription.id());

    let events = subscription
        .into_stream()
        .map(|payload| Ok::<_, Infallible>(Event::default().data(String::from_utf8_lossy(&payload))));
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn proxy_service(State(state): State<AppState>, req: Request) -> Response {
    // Raw path: percent-encoding must reach the backend untouched.
    let path = service_path(req.uri().path()).to_string();
    let peer = peer_addr(&req);
    state.forwarder.forward(req, peer, &path).await
}

/// Backend part of a `/api/service...` request path, still percent-encoded.
fn service_path(path: &str) -> &str {
    path.strip_prefix(SERVICE_PREFIX).unwrap_or(path)
}

async fn proxy_fallback(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    if path == "/api" || path.starts_with("/api/") {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }
    let peer = peer_addr(&req);
    state.forwarder.forward(req, peer, &path).await
}

fn peer_addr(req: &Request<Body>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

#[cfg(test)]
mod tests {
    use axum::http::header;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        adapters::memory_store::MemoryStore,
        config::{HostConflictPolicy, RegistryConfig},
        core::{service::ServiceAddress, telemetry::TrafficRecord},
    };

    async fn create_test_state() -> AppState {
        let config = GatewayConfig::builder().memory_store().without_auth().build();
        AppState::assemble(&config, Arc::new(MemoryStore::new()), CancellationToken::new())
            .await
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_handler() {
        let app = build_router(create_test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["services"], 0);
    }

    #[tokio::test]
    async fn test_unknown_api_path_is_not_proxied() {
        let app = build_router(create_test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/nope")
                    .header(header::HOST, "files.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_service_data_fills_requested_scales() {
        let state = create_test_state().await;
        let links = state
            .registry
            .reconcile(vec![
                ServiceLink {
                    id: String::new(),
                    title: "files".to_string(),
                    incoming_addresses: vec!["files.example.com".to_string()],
                    outgoing_address: ServiceAddress::new("http", "10.0.0.5", 8080),
                },
                ServiceLink {
                    id: String::new(),
                    title: "chat".to_string(),
                    incoming_addresses: vec!["chat.example.com".to_string()],
                    outgoing_address: ServiceAddress::new("http", "10.0.0.6", 8080),
                },
            ])
            .await
            .unwrap();
        for link in links.iter() {
            state
                .telemetry
                .record(&TrafficRecord {
                    service_id: link.id.clone(),
                    resource: "/".to_string(),
                    country: "US".to_string(),
                    ip: "1.2.3.4".to_string(),
                    response_code: 200,
                    received_bytes: 0,
                    sent_bytes: 10,
                })
                .await;
        }

        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/service-data?time-step=day&service=files.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        let services = body.as_array().unwrap();
        assert_eq!(services.len(), 2);

        let files = &services[0];
        assert_eq!(files["title"], "files");
        assert_eq!(files["hour"].as_object().unwrap().len(), 1);
        assert_eq!(files["year"].as_object().unwrap().len(), 1);

        let chat = &services[1];
        assert_eq!(chat["title"], "chat");
        assert!(chat["hour"].as_object().unwrap().is_empty());
        let day = chat["day"].as_object().unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day.values().next().unwrap()["quantity"], 1);
    }

    #[tokio::test]
    async fn test_services_set_rejects_conflicts_with_409() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let telemetry = TelemetryStore::new(store.clone());
        let mut state = create_test_state().await;
        state.registry = Arc::new(ServiceRegistry::new(
            store,
            telemetry,
            RegistryConfig {
                host_conflicts: HostConflictPolicy::Reject,
                ..RegistryConfig::default()
            },
        ));

        let link = serde_json::json!({
            "title": "a",
            "incoming_addresses": ["dup.example.com"],
            "outgoing_address": { "protocol": "http", "domain": "10.0.0.5", "port": 80 }
        });
        let body = serde_json::to_vec(&serde_json::json!([link, link])).unwrap();
        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/services-set")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_service_path_keeps_encoding() {
        assert_eq!(service_path("/api/service/docs/my%20file.txt"), "/docs/my%20file.txt");
        assert_eq!(service_path("/api/service/a%2Fb"), "/a%2Fb");
        assert_eq!(service_path("/api/service/"), "/");
        assert_eq!(service_path("/api/service"), "");
    }
}
