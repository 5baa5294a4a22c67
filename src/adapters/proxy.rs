//! The forwarding engine: resolves the target service, relays the exchange over
//! REST, event-stream or WebSocket, and reports every forwarded request to the
//! telemetry store and the live hub.
use std::{convert::Infallible, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{FromRequestParts, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, header},
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use tokio::{io::AsyncBufReadExt, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::{Instrument, debug, warn};

use crate::{
    adapters::websocket::{close_unavailable, connect_upstream, relay},
    config::{ProxyConfig, TelemetryConfig},
    core::{
        forwarding::{
            ForwardError, RequestKind, compose_upstream_url, rewrite_location, strip_hop_by_hop,
            strip_websocket_handshake,
        },
        hub::{LiveHub, LiveUpdateEvent},
        registry::ServiceRegistry,
        service::ServiceLink,
        telemetry::{ClientOrigin, OriginHeaders, TelemetryStore, TrafficRecord},
    },
    ports::http_client::HttpClient,
    tracing_setup::create_upstream_span,
};

const FORWARDED_PROTO: &str = "x-forwarded-proto";

impl IntoResponse for ForwardError {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// What the engine knows about one inbound request once its target is resolved.
struct Exchange {
    link: ServiceLink,
    host: String,
    path: String,
    query: Option<String>,
    origin: ClientOrigin,
}

impl Exchange {
    fn record(&self, response_code: u16, received_bytes: u64, sent_bytes: u64) -> TrafficRecord {
        TrafficRecord {
            service_id: self.link.id.clone(),
            resource: self.path.clone(),
            country: self.origin.country_or_unknown(),
            ip: self.origin.ip_or_unknown(),
            response_code,
            received_bytes,
            sent_bytes,
        }
    }
}

#[derive(Clone)]
pub struct Forwarder {
    registry: Arc<ServiceRegistry>,
    client: Arc<dyn HttpClient>,
    telemetry: TelemetryStore,
    hub: LiveHub,
    proxy: Arc<ProxyConfig>,
    origin_headers: Arc<OriginHeaders>,
    request_timeout: Duration,
    telemetry_timeout: Duration,
}

impl Forwarder {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        client: Arc<dyn HttpClient>,
        telemetry: TelemetryStore,
        hub: LiveHub,
        proxy: &ProxyConfig,
        telemetry_config: &TelemetryConfig,
    ) -> Self {
        let origin_headers = OriginHeaders {
            country: proxy.country_header.clone(),
            client_ip: proxy.client_ip_header.clone(),
        };
        Self {
            registry,
            client,
            telemetry,
            hub,
            request_timeout: proxy.request_timeout(),
            proxy: Arc::new(proxy.clone()),
            origin_headers: Arc::new(origin_headers),
            telemetry_timeout: telemetry_config.write_timeout(),
        }
    }

    /// Forward `req` to the service answering for its host. `path` is the part of the
    /// request path that is relayed to the backend.
    pub async fn forward(
        &self,
        req: Request<Body>,
        peer: Option<SocketAddr>,
        path: &str,
    ) -> Response<Body> {
        let host = match request_host(&req) {
            Some(host) => host,
            None => {
                return ForwardError::Protocol("request carries no host".to_string())
                    .into_response();
            }
        };
        let link = match self.registry.resolve_by_incoming_host(&host) {
            Ok(link) => link,
            Err(e) => {
                debug!("Not forwarding request for {}: {}", host, e);
                return ForwardError::from(e).into_response();
            }
        };

        let exchange = Exchange {
            link,
            host,
            path: format!("/{}", path.trim_start_matches('/')),
            query: req.uri().query().map(str::to_string),
            origin: ClientOrigin::from_headers(req.headers(), &self.origin_headers)
                .or_peer(peer.map(|addr| addr.ip())),
        };

        match RequestKind::classify(req.headers()) {
            RequestKind::Rest => self.forward_rest(req, exchange).await,
            RequestKind::EventStream => self.forward_event_stream(req, exchange).await,
            RequestKind::WebSocket => self.forward_websocket(req, exchange).await,
        }
    }

    async fn forward_rest(&self, req: Request<Body>, exchange: Exchange) -> Response<Body> {
        let url = compose_upstream_url(
            &exchange.link.outgoing_address.to_string(),
            &exchange.path,
            exchange.query.as_deref(),
        );
        let span = create_upstream_span(&exchange.link.id, req.method().as_str(), &url, "rest");

        async {
            let scheme = public_scheme(req.headers(), &self.proxy.public_scheme);
            let (request, received) = match self.upstream_request(req, &url, &exchange).await {
                Ok(prepared) => prepared,
                Err(e) => return self.fail(&exchange, e, 0),
            };

            let response = match self
                .client
                .send_request(request, Some(self.request_timeout))
                .await
            {
                Ok(response) => response,
                Err(e) => return self.fail(&exchange, e.into(), received),
            };

            let (mut parts, body) = response.into_parts();
            let body = match tokio::time::timeout(self.request_timeout, body.collect()).await {
                Ok(Ok(collected)) => collected.to_bytes(),
                Ok(Err(e)) => {
                    return self.fail(&exchange, ForwardError::Body(e.to_string()), received);
                }
                Err(_) => {
                    let message = format!("response body not received within {:?}", self.request_timeout);
                    return self.fail(&exchange, ForwardError::UpstreamUnavailable(message), received);
                }
            };

            let redirect = parts.status.is_redirection();
            if let Some(location) = parts
                .headers
                .get(header::LOCATION)
                .filter(|_| redirect)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| rewrite_location(v, &scheme, &exchange.host))
            {
                match HeaderValue::from_str(&location) {
                    Ok(value) => {
                        debug!("Rewrote relative redirect to {}", location);
                        parts.headers.insert(header::LOCATION, value);
                    }
                    Err(e) => warn!("Leaving unrepresentable redirect {} as-is: {}", location, e),
                }
            }
            strip_hop_by_hop(&mut parts.headers);
            parts.headers.remove(header::TRANSFER_ENCODING);

            tracing::Span::current().record("http.status_code", parts.status.as_u16());
            self.emit(exchange.record(parts.status.as_u16(), received, body.len() as u64));
            Response::from_parts(parts, Body::from(body))
        }
        .instrument(span)
        .await
    }

    async fn forward_event_stream(&self, req: Request<Body>, exchange: Exchange) -> Response<Body> {
        let url = compose_upstream_url(
            &exchange.link.outgoing_address.to_string(),
            &exchange.path,
            exchange.query.as_deref(),
        );
        let span = create_upstream_span(&exchange.link.id, req.method().as_str(), &url, "sse");

        async {
            let (request, received) = match self.upstream_request(req, &url, &exchange).await {
                Ok(prepared) => prepared,
                Err(e) => return self.fail(&exchange, e, 0),
            };
            let response = match self.client.send_request(request, None).await {
                Ok(response) => response,
                Err(e) => return self.fail(&exchange, e.into(), received),
            };

            let (mut parts, body) = response.into_parts();
            tracing::Span::current().record("http.status_code", parts.status.as_u16());
            self.emit(exchange.record(parts.status.as_u16(), received, 0));

            strip_hop_by_hop(&mut parts.headers);
            parts.headers.remove(header::CONTENT_LENGTH);
            parts.headers.remove(header::TRANSFER_ENCODING);

            let (lines_tx, lines_rx) = mpsc::channel(self.proxy.event_stream_buffer.max(1));
            let token = CancellationToken::new();
            tokio::spawn(
                relay_lines(body, lines_tx, token.clone()).instrument(tracing::Span::current()),
            );

            // Dropping the response body (client gone) cancels the relay task.
            let guard = token.drop_guard();
            let stream = ReceiverStream::new(lines_rx).map(move |line| {
                let _connected = &guard;
                Ok::<Bytes, Infallible>(line)
            });
            Response::from_parts(parts, Body::from_stream(stream))
        }
        .instrument(span)
        .await
    }

    async fn forward_websocket(&self, req: Request<Body>, exchange: Exchange) -> Response<Body> {
        let url = compose_upstream_url(
            &exchange.link.outgoing_address.websocket_base(),
            &exchange.path,
            exchange.query.as_deref(),
        );
        let span = create_upstream_span(&exchange.link.id, "GET", &url, "websocket");

        let (mut parts, _body) = req.into_parts();
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => {
                return ForwardError::Protocol(rejection.body_text()).into_response();
            }
        };

        let mut headers = parts.headers;
        // Echo the client's preferred subprotocol so browsers accept the handshake.
        let offered: Vec<String> = headers
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let upgrade = if offered.is_empty() {
            upgrade
        } else {
            upgrade.protocols(offered)
        };
        strip_websocket_handshake(&mut headers);

        let authority = exchange.link.outgoing_address.authority();
        let forwarder = self.clone();
        upgrade.on_upgrade(move |socket| {
            async move {
                match connect_upstream(&url, &headers, &authority).await {
                    Ok(upstream) => {
                        tracing::Span::current()
                            .record("http.status_code", StatusCode::SWITCHING_PROTOCOLS.as_u16());
                        forwarder.emit(exchange.record(
                            StatusCode::SWITCHING_PROTOCOLS.as_u16(),
                            0,
                            0,
                        ));
                        relay(socket, upstream).await;
                        debug!("WebSocket relay to {} closed", url);
                    }
                    Err(e) => {
                        warn!("WebSocket upstream unavailable: {}", e);
                        close_unavailable(socket).await;
                    }
                }
            }
            .instrument(span)
        })
    }

    /// Buffer the client body and rebuild the request against `url`.
    async fn upstream_request(
        &self,
        req: Request<Body>,
        url: &str,
        exchange: &Exchange,
    ) -> Result<(Request<Body>, u64), ForwardError> {
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| {
            ForwardError::InvalidUpstreamUrl {
                url: url.to_string(),
                message: e.to_string(),
            }
        })?;

        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ForwardError::Body(e.to_string()))?
            .to_bytes();
        let received = body.len() as u64;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::TRANSFER_ENCODING);
        if !self.proxy.preserve_host {
            let authority = exchange.link.outgoing_address.authority();
            let value = HeaderValue::from_str(&authority).map_err(|e| {
                ForwardError::InvalidUpstreamUrl {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            })?;
            headers.insert(header::HOST, value);
        }

        let mut request = Request::new(Body::from(body));
        *request.method_mut() = parts.method;
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;
        Ok((request, received))
    }

    /// Answer a failed exchange and count it as a gateway error.
    fn fail(&self, exchange: &Exchange, error: ForwardError, received: u64) -> Response<Body> {
        warn!(
            "Forwarding to service {} ({}) failed: {}",
            exchange.link.id, exchange.link.outgoing_address, error
        );
        let status = match error.status_code() {
            StatusCode::BAD_REQUEST => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        tracing::Span::current().record("http.status_code", status.as_u16());
        self.emit(exchange.record(status.as_u16(), received, 0));
        (status, error.to_string()).into_response()
    }

    /// Publish to live dashboards and write telemetry in a detached task bounded by
    /// the telemetry timeout.
    fn emit(&self, record: TrafficRecord) {
        let event = LiveUpdateEvent::now(
            &record.service_id,
            &record.resource,
            &record.country,
            &record.ip,
            record.response_code,
        );
        if let Err(e) = self.hub.try_publish(event) {
            debug!("Live update for {} not published: {}", record.service_id, e);
        }

        let telemetry = self.telemetry.clone();
        let deadline = self.telemetry_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, telemetry.record(&record)).await {
                Ok(scales) => debug!(
                    "Recorded {} {} for service {} in {} scales",
                    record.response_code, record.resource, record.service_id, scales
                ),
                Err(_) => warn!(
                    "Telemetry write for service {} abandoned after {:?}",
                    record.service_id, deadline
                ),
            }
        });
    }
}

/// Host the client addressed: the `Host` header, else the URI authority.
fn request_host(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .filter(|h| !h.is_empty())
}

fn public_scheme(headers: &HeaderMap, fallback: &str) -> String {
    headers
        .get(FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| v == "http" || v == "https")
        .unwrap_or_else(|| fallback.to_string())
}

/// Copy the upstream event stream to the client one line at a time until the
/// upstream ends, fails, or the client goes away.
async fn relay_lines(body: Body, lines: mpsc::Sender<Bytes>, token: CancellationToken) {
    let reader = StreamReader::new(body.into_data_stream().map(|r| r.map_err(io::Error::other)));
    let mut upstream = reader.lines();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Event stream client disconnected");
                break;
            }
            line = upstream.next_line() => match line {
                Ok(Some(line)) => {
                    let mut chunk = line.into_bytes();
                    chunk.push(b'\n');
                    if lines.send(Bytes::from(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Upstream event stream ended");
                    break;
                }
                Err(e) => {
                    warn!("Upstream event stream failed: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::http::Method;

    use super::*;
    use crate::{
        adapters::memory_store::MemoryStore,
        config::{LiveConfig, RegistryConfig},
        core::{service::ServiceAddress, timescale::TimeScale},
        ports::{
            http_client::{HttpClientError, HttpClientResult},
            kv_store::KeyValueStore,
        },
    };

    /// Records the last request and answers from a canned factory.
    struct StubClient {
        seen: Mutex<Option<(Method, Uri, HeaderMap, Option<Duration>)>>,
        answer: Box<dyn Fn() -> HttpClientResult<Response<Body>> + Send + Sync>,
    }

    impl StubClient {
        fn new(
            answer: impl Fn() -> HttpClientResult<Response<Body>> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(None),
                answer: Box::new(answer),
            })
        }

        fn seen(&self) -> (Method, Uri, HeaderMap, Option<Duration>) {
            self.seen.lock().unwrap().clone().expect("no upstream call")
        }
    }

    #[async_trait]
    impl HttpClient for StubClient {
        async fn send_request(
            &self,
            req: Request<Body>,
            timeout: Option<Duration>,
        ) -> HttpClientResult<Response<Body>> {
            *self.seen.lock().unwrap() = Some((
                req.method().clone(),
                req.uri().clone(),
                req.headers().clone(),
                timeout,
            ));
            (self.answer)()
        }
    }

    async fn forwarder(client: Arc<StubClient>, proxy: ProxyConfig) -> (Forwarder, TelemetryStore, String) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let telemetry = TelemetryStore::new(store.clone());
        let registry = Arc::new(ServiceRegistry::new(
            store,
            telemetry.clone(),
            RegistryConfig::default(),
        ));
        let links = registry
            .reconcile(vec![ServiceLink {
                id: String::new(),
                title: "files".to_string(),
                incoming_addresses: vec!["files.example.com".to_string()],
                outgoing_address: ServiceAddress::new("http", "10.0.0.5", 8080),
            }])
            .await
            .unwrap();
        let hub = LiveHub::spawn(LiveConfig::default(), CancellationToken::new());
        let forwarder = Forwarder::new(
            registry,
            client,
            telemetry.clone(),
            hub,
            &proxy,
            &TelemetryConfig::default(),
        );
        (forwarder, telemetry, links[0].id.clone())
    }

    async fn wait_for_quantity(telemetry: &TelemetryStore, id: &str) -> Option<crate::core::telemetry::AnalyticsBucket> {
        for _ in 0..50 {
            let buckets = telemetry.query(id, TimeScale::Minute).await.unwrap();
            if let Some(bucket) = buckets.into_values().next() {
                return Some(bucket);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    fn request(host: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .header("cf-ipcountry", "US")
            .header("x-forwarded-for", "1.2.3.4, 10.0.0.1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_rest_exchange_is_forwarded_and_counted() {
        let client = StubClient::new(|| {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Body::from("listing"))
                .unwrap())
        });
        let (forwarder, telemetry, id) = forwarder(client.clone(), ProxyConfig::default()).await;

        let response = forwarder
            .forward(request("files.example.com", "/list?page=2"), None, "/list")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"listing");

        let (method, uri, headers, timeout) = client.seen();
        assert_eq!(method, Method::GET);
        assert_eq!(uri.to_string(), "http://10.0.0.5:8080/list?page=2");
        assert_eq!(headers[header::HOST], "files.example.com");
        assert_eq!(timeout, Some(Duration::from_secs(30)));

        let bucket = wait_for_quantity(&telemetry, &id).await.unwrap();
        assert_eq!(bucket.quantity, 1);
        assert_eq!(bucket.sent_bytes, 7);
        assert_eq!(bucket.country.get("US"), Some(&1));
        assert_eq!(bucket.ip.get("1.2.3.4"), Some(&1));
        assert_eq!(bucket.resource.get("/list"), Some(&1));
        assert_eq!(bucket.response_code.get(&200), Some(&1));
    }

    #[tokio::test]
    async fn test_unknown_host_is_not_found_without_telemetry() {
        let client = StubClient::new(|| Ok(Response::new(Body::empty())));
        let (forwarder, telemetry, id) = forwarder(client.clone(), ProxyConfig::default()).await;

        let response = forwarder
            .forward(request("unknown.example.com", "/"), None, "/")
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(client.seen.lock().unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(telemetry.query(&id, TimeScale::Minute).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relative_redirect_is_rewritten() {
        let client = StubClient::new(|| {
            Ok(Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, "/login")
                .body(Body::empty())
                .unwrap())
        });
        let (forwarder, _, _) = forwarder(client, ProxyConfig::default()).await;

        let mut req = request("files.example.com", "/private");
        req.headers_mut()
            .insert(FORWARDED_PROTO, HeaderValue::from_static("http"));
        let response = forwarder.forward(req, None, "/private").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://files.example.com/login"
        );
    }

    #[tokio::test]
    async fn test_location_on_non_redirect_passes_through() {
        let client = StubClient::new(|| {
            Ok(Response::builder()
                .status(StatusCode::CREATED)
                .header(header::LOCATION, "/items/7")
                .body(Body::empty())
                .unwrap())
        });
        let (forwarder, _, _) = forwarder(client, ProxyConfig::default()).await;

        let response = forwarder
            .forward(request("files.example.com", "/items"), None, "/items")
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::LOCATION], "/items/7");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_bad_gateway_and_counted() {
        let client = StubClient::new(|| Err(HttpClientError::ConnectionError("refused".into())));
        let (forwarder, telemetry, id) = forwarder(client, ProxyConfig::default()).await;

        let response = forwarder
            .forward(request("files.example.com", "/list"), None, "/list")
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let bucket = wait_for_quantity(&telemetry, &id).await.unwrap();
        assert_eq!(bucket.response_code.get(&502), Some(&1));
    }

    #[tokio::test]
    async fn test_host_override_when_not_preserved() {
        let client = StubClient::new(|| Ok(Response::new(Body::empty())));
        let proxy = ProxyConfig {
            preserve_host: false,
            ..ProxyConfig::default()
        };
        let (forwarder, _, _) = forwarder(client.clone(), proxy).await;

        forwarder
            .forward(request("FILES.example.com:443", "/"), None, "")
            .await;
        let (_, uri, headers, _) = client.seen();
        assert_eq!(uri.to_string(), "http://10.0.0.5:8080/");
        assert_eq!(headers[header::HOST], "10.0.0.5:8080");
    }

    #[tokio::test]
    async fn test_event_stream_lines_are_relayed_without_timeout() {
        let client = StubClient::new(|| {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(Body::from("data: one\n\ndata: two\r\n\r\n"))
                .unwrap())
        });
        let (forwarder, telemetry, id) = forwarder(client.clone(), ProxyConfig::default()).await;

        let mut req = request("files.example.com", "/events");
        req.headers_mut()
            .insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        let response = forwarder.forward(req, None, "/events").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"data: one\n\ndata: two\n\n");
        assert_eq!(client.seen().3, None);

        let bucket = wait_for_quantity(&telemetry, &id).await.unwrap();
        assert_eq!(bucket.resource.get("/events"), Some(&1));
    }

    #[test]
    fn test_public_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(public_scheme(&headers, "https"), "https");
        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("HTTP, https"));
        assert_eq!(public_scheme(&headers, "https"), "http");
        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("gopher"));
        assert_eq!(public_scheme(&headers, "https"), "https");
    }
}
