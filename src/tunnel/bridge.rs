//! Websocket passthrough between the secondary relay and the local app.
//!
//! On a `websocket` envelope two legs are opened, both tagged with the
//! envelope id: one to the proxy relay endpoint, one to the local app with
//! the caller's headers (minus handshake and edge-proxy headers) and query.
//! Frames are then copied both ways until either side stops.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::executor::join_route;
use super::message::{MultiMap, RequestMessage};
use super::transport::{connect_leg_with_retry, WsStream};
use super::TunnelError;

/// Headers that belong to the original handshake or to the edge proxy and
/// must not be replayed on the dial to the local app. Compared
/// case-insensitively.
const STRIPPED_HEADERS: &[&str] = &[
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
    "sec-websocket-accept",
    "user-agent",
    "x-envoy-attempt-count",
    "x-envoy-expected-rq-timeout-ms",
    "x-envoy-internal",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "x-ratelimit-reset",
    "x-request-id",
];

/// Endpoints a bridge connects.
#[derive(Debug, Clone)]
pub struct BridgeEndpoints {
    /// Secondary relay websocket URL (`wss://host/_/<path>`).
    pub proxy_url: String,
    /// Local app base URL (`http://localhost:3000`).
    pub local_app_host: String,
}

/// Bridge one websocket session. Returns when either leg stops or `shutdown`
/// fires; the error, if any, is the one that ended the session.
pub async fn run_bridge(
    msg: &RequestMessage,
    endpoints: &BridgeEndpoints,
    shutdown: &CancellationToken,
) -> Result<(), TunnelError> {
    let headers = sanitize_headers(&msg.headers)?;
    let app_url = app_websocket_url(&endpoints.local_app_host, &msg.route, &msg.query);

    let proxy = connect_leg_with_retry(&endpoints.proxy_url, &msg.id, &HeaderMap::new())
        .await
        .map_err(|e| TunnelError::ProxyLeg(Box::new(e)))?;
    let app = connect_leg_with_retry(&app_url, &msg.id, &headers)
        .await
        .map_err(|e| TunnelError::AppLeg(Box::new(e)))?;
    debug!(id = %msg.id, %app_url, "websocket bridge established");

    splice(proxy, app, shutdown).await
}

/// Copy frames between two established connections until one side stops.
pub async fn splice(
    proxy: WsStream,
    app: WsStream,
    shutdown: &CancellationToken,
) -> Result<(), TunnelError> {
    let (proxy_sink, proxy_source) = proxy.split();
    let (app_sink, app_source) = app.split();

    let cancel = shutdown.child_token();
    let mut proxy_to_app = tokio::spawn(forward(proxy_source, app_sink, cancel.clone()));
    let mut app_to_proxy = tokio::spawn(forward(app_source, proxy_sink, cancel.clone()));

    let result = tokio::select! {
        joined = &mut proxy_to_app => joined,
        joined = &mut app_to_proxy => joined,
    };
    cancel.cancel();
    match result {
        Ok(result) => result,
        Err(join_err) => {
            debug!("websocket forwarder aborted: {join_err}");
            Ok(())
        }
    }
}

async fn forward(
    mut from: SplitStream<WsStream>,
    mut to: SplitSink<WsStream, Message>,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = from.next() => next,
        };
        match next {
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                to.send(msg).await.map_err(TunnelError::ForwardWrite)?;
            }
            Some(Ok(Message::Close(frame))) => {
                let _ = to.send(Message::Close(frame)).await;
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TunnelError::ForwardRead(e)),
            None => return Err(TunnelError::LegClosed),
        }
    }
}

/// Caller headers minus [`STRIPPED_HEADERS`].
pub fn sanitize_headers(headers: &MultiMap) -> Result<HeaderMap, TunnelError> {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        if STRIPPED_HEADERS
            .iter()
            .any(|stripped| stripped.eq_ignore_ascii_case(name))
        {
            continue;
        }
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            TunnelError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            }
        })?;
        for value in values {
            let value = HeaderValue::from_str(value).map_err(|e| TunnelError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            map.append(header.clone(), value);
        }
    }
    Ok(map)
}

/// `http://localhost:3000` + `/chat` + `{room: [a]}` → `ws://localhost:3000/chat?room=a`.
pub fn app_websocket_url(local_app_host: &str, route: &str, query: &MultiMap) -> String {
    let ws_host = local_app_host.replacen("http", "ws", 1);
    let mut url = join_route(&ws_host, route);
    let mut encoded = url::form_urlencoded::Serializer::new(String::new());
    for (key, values) in query {
        for value in values {
            encoded.append_pair(key, value);
        }
    }
    let encoded = encoded.finish();
    if !encoded.is_empty() {
        url.push('?');
        url.push_str(&encoded);
    }
    url
}
