//! WebSocket relay between an upgraded client socket and a backend socket.
use std::time::Duration;

use axum::extract::ws::{self, WebSocket};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue, header};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        protocol::{CloseFrame as UpstreamCloseFrame, frame::coding::CloseCode},
    },
};
use tracing::debug;

use crate::core::forwarding::ForwardError;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code sent to the client when the backend cannot be dialed.
pub const UNAVAILABLE_CLOSE_CODE: u16 = 1011;
pub const UNAVAILABLE_CLOSE_REASON: &str = "Internal service unavailable";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Dial the backend with the client's remaining headers and `Host` set to `authority`.
/// `headers` must already be stripped of the client's own handshake headers.
pub async fn connect_upstream(
    url: &str,
    headers: &HeaderMap,
    authority: &str,
) -> Result<UpstreamSocket, ForwardError> {
    let mut request =
        url.into_client_request()
            .map_err(|e| ForwardError::InvalidUpstreamUrl {
                url: url.to_string(),
                message: e.to_string(),
            })?;

    let outgoing = request.headers_mut();
    for (name, value) in headers {
        outgoing.append(name.clone(), value.clone());
    }
    let host = HeaderValue::from_str(authority).map_err(|e| ForwardError::InvalidUpstreamUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    outgoing.insert(header::HOST, host);

    let (socket, response) = connect_async(request)
        .await
        .map_err(|e| ForwardError::UpstreamUnavailable(format!("{url}: {e}")))?;
    debug!("Upstream WebSocket {} answered {}", url, response.status());
    Ok(socket)
}

/// Tell the client its backend is unreachable, then drop the socket.
pub async fn close_unavailable(mut client: WebSocket) {
    let frame = ws::CloseFrame {
        code: UNAVAILABLE_CLOSE_CODE,
        reason: UNAVAILABLE_CLOSE_REASON.into(),
    };
    let _ = tokio::time::timeout(
        CLOSE_TIMEOUT,
        client.send(ws::Message::Close(Some(frame))),
    )
    .await;
}

/// Pump frames both ways until either side closes or fails, then close both.
/// Order is preserved within each direction.
pub async fn relay(client: WebSocket, upstream: UpstreamSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(message) = client_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!("Client WebSocket read failed: {}", e);
                    break;
                }
            };
            let closing = matches!(message, ws::Message::Close(_));
            if let Err(e) = upstream_tx.send(to_upstream(message)).await {
                debug!("Upstream WebSocket write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!("Upstream WebSocket read failed: {}", e);
                    break;
                }
            };
            let Some(message) = to_client(message) else {
                continue;
            };
            let closing = matches!(message, ws::Message::Close(_));
            if let Err(e) = client_tx.send(message).await {
                debug!("Client WebSocket write failed: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    };

    // The first pump to finish cancels the other.
    tokio::select! {
        _ = client_to_upstream => debug!("Client side of WebSocket relay finished"),
        _ = upstream_to_client => debug!("Upstream side of WebSocket relay finished"),
    }

    let _ = tokio::time::timeout(CLOSE_TIMEOUT, upstream_tx.close()).await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, client_tx.close()).await;
}

fn to_upstream(message: ws::Message) -> tungstenite::Message {
    match message {
        ws::Message::Text(text) => tungstenite::Message::Text(text.as_str().to_owned().into()),
        ws::Message::Binary(data) => tungstenite::Message::Binary(data),
        ws::Message::Ping(data) => tungstenite::Message::Ping(data),
        ws::Message::Pong(data) => tungstenite::Message::Pong(data),
        ws::Message::Close(frame) => {
            tungstenite::Message::Close(frame.map(|frame| UpstreamCloseFrame {
                code: CloseCode::from(frame.code),
                reason: frame.reason.as_str().to_owned().into(),
            }))
        }
    }
}

// Raw frames never surface from a read; they have no client-side equivalent.
fn to_client(message: tungstenite::Message) -> Option<ws::Message> {
    let converted = match message {
        tungstenite::Message::Text(text) => ws::Message::Text(text.as_str().to_owned().into()),
        tungstenite::Message::Binary(data) => ws::Message::Binary(data),
        tungstenite::Message::Ping(data) => ws::Message::Ping(data),
        tungstenite::Message::Pong(data) => ws::Message::Pong(data),
        tungstenite::Message::Close(frame) => ws::Message::Close(frame.map(|frame| ws::CloseFrame {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_owned().into(),
        })),
        tungstenite::Message::Frame(_) => return None,
    };
    Some(converted)
}
