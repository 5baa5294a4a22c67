// Integration tests for the management endpoints and the live dashboard feed
mod common;

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    routing::get,
};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{authorized, gateway, get as request, spawn_server};

fn services_set(body: Value) -> Request<Body> {
    authorized(
        Request::builder()
            .method("POST")
            .uri("/api/services-set")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_management_routes_require_a_token() {
    let gw = gateway().await;

    let anonymous = gw
        .app
        .clone()
        .oneshot(request("admin.example.com", "/api/service-data"))
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let mut wrong = request("admin.example.com", "/api/service-data");
    wrong
        .headers_mut()
        .insert(header::COOKIE, "session-token=guess".parse().unwrap());
    let wrong = gw.app.clone().oneshot(wrong).await.unwrap();
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

    let allowed = gw
        .app
        .clone()
        .oneshot(authorized(request("admin.example.com", "/api/service-data")))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(json_body(allowed).await, json!([]));
}

#[tokio::test]
async fn test_health_is_public() {
    let gw = gateway().await;
    let response = gw
        .app
        .clone()
        .oneshot(request("admin.example.com", "/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["live_subscribers"], 0);
}

#[tokio::test]
async fn test_reconcile_through_the_api() {
    let gw = gateway().await;
    let desired = json!([{
        "title": "files",
        "incoming_addresses": ["files.example.com", "FILES.example.com"],
        "outgoing_address": { "protocol": "http", "domain": "10.0.0.5", "port": 8080 }
    }]);

    let response = gw.app.clone().oneshot(services_set(desired)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first = json_body(response).await;
    let id = first[0]["id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 15);
    assert_eq!(first[0]["incoming_addresses"], json!(["files.example.com"]));

    // Posting the result again changes nothing.
    let response = gw
        .app
        .clone()
        .oneshot(services_set(first.clone()))
        .await
        .unwrap();
    assert_eq!(json_body(response).await, first);

    // Renaming keeps the id; an empty list removes the service.
    let mut renamed = first.clone();
    renamed[0]["title"] = json!("archive");
    let response = gw.app.clone().oneshot(services_set(renamed)).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body[0]["id"], json!(id));
    assert_eq!(body[0]["title"], "archive");

    let response = gw.app.clone().oneshot(services_set(json!([]))).await.unwrap();
    assert_eq!(json_body(response).await, json!([]));
    assert!(gw.state.registry.is_empty());
}

#[tokio::test]
async fn test_malformed_service_list_is_rejected() {
    let gw = gateway().await;
    let response = gw
        .app
        .clone()
        .oneshot(services_set(json!({ "not": "a list" })))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
    assert!(gw.state.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_feed_announces_forwarded_requests() {
    let backend = spawn_server(Router::new().route("/ping", get(|| async { "pong" }))).await;
    let gw = gateway().await;
    let id = gw.register("ping", &["ping.example.com"], backend).await;

    let live = gw
        .app
        .clone()
        .oneshot(authorized(request("admin.example.com", "/api/service-data-live")))
        .await
        .unwrap();
    assert_eq!(live.status(), StatusCode::OK);
    assert_eq!(live.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(gw.state.hub.subscriber_count(), 1);

    let mut req = request("ping.example.com", "/ping");
    req.headers_mut()
        .insert("x-real-ip", "5.6.7.8".parse().unwrap());
    let response = gw.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut frames = live.into_body().into_data_stream();
    let frame = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.to_vec()).unwrap();
    let payload = text
        .strip_prefix("data: ")
        .and_then(|rest| rest.strip_suffix("\n\n"))
        .expect("one SSE data frame");
    let event: Value = serde_json::from_str(payload).unwrap();
    assert_eq!(event["id"], json!(id));
    assert_eq!(event["resource"], "/ping");
    assert_eq!(event["ip"], "5.6.7.8");
    assert_eq!(event["country"], "unknown");
    assert_eq!(event["response_code"], 200);
    assert!(event["time"].as_str().unwrap().ends_with(":00Z"));

    drop(frames);
    for _ in 0..50 {
        if gw.state.hub.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(gw.state.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn test_live_feed_ends_on_shutdown() {
    let gw = gateway().await;
    let live = gw
        .app
        .clone()
        .oneshot(authorized(request("admin.example.com", "/api/service-data-live")))
        .await
        .unwrap();

    gw.shutdown.cancel();
    let mut frames = live.into_body().into_data_stream();
    let end = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .unwrap();
    assert!(end.is_none());
}
