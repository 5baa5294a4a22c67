// Shared fixtures for the gateway integration tests
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, body::Body, http::Request};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tollgate::{
    AppState, GatewayConfig, MemoryStore, build_router,
    core::{AnalyticsBucket, ServiceAddress, ServiceLink, TimeScale},
};

pub const ADMIN_TOKEN: &str = "s3cret";

/// Serve `app` on an ephemeral local port.
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

pub struct Gateway {
    pub state: AppState,
    pub app: Router,
    pub shutdown: CancellationToken,
}

pub async fn gateway() -> Gateway {
    gateway_with(GatewayConfig::builder().memory_store().auth_token(ADMIN_TOKEN, "admin").build())
        .await
}

pub async fn gateway_with(config: GatewayConfig) -> Gateway {
    let shutdown = CancellationToken::new();
    let state = AppState::assemble(&config, Arc::new(MemoryStore::new()), shutdown.clone())
        .await
        .unwrap();
    let app = build_router(state.clone());
    Gateway {
        state,
        app,
        shutdown,
    }
}

impl Gateway {
    /// Route `hosts` to `upstream` and return the assigned id.
    pub async fn register(&self, title: &str, hosts: &[&str], upstream: SocketAddr) -> String {
        let links = self
            .state
            .registry
            .reconcile(
                self.state
                    .registry
                    .snapshot()
                    .iter()
                    .cloned()
                    .chain([ServiceLink {
                        id: String::new(),
                        title: title.to_string(),
                        incoming_addresses: hosts.iter().map(|h| h.to_string()).collect(),
                        outgoing_address: ServiceAddress::new(
                            "http",
                            upstream.ip().to_string(),
                            upstream.port(),
                        ),
                    }])
                    .collect(),
            )
            .await
            .unwrap();
        links.last().unwrap().id.clone()
    }

    /// Current minute bucket of a service, waiting for the detached telemetry write.
    pub async fn current_minute(&self, service_id: &str) -> Option<AnalyticsBucket> {
        for _ in 0..100 {
            let buckets = self
                .state
                .telemetry
                .query(service_id, TimeScale::Minute)
                .await
                .unwrap();
            if let Some(bucket) = buckets.into_values().next_back() {
                return Some(bucket);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }
}

pub fn get(host: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("host", host)
        .body(Body::empty())
        .unwrap()
}

pub fn authorized(mut req: Request<Body>) -> Request<Body> {
    req.headers_mut().insert(
        "authorization",
        format!("Bearer {ADMIN_TOKEN}").parse().unwrap(),
    );
    req
}
