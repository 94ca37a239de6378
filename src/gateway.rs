//! Local debugger gateway.
//!
//! The developer's app calls remote providers through this HTTP server
//! (`http://localhost:<debugger_port>`). Every request, whatever its method
//! or path, becomes an `execute-remote` envelope on the tunnel; the handler
//! waits for the correlated reply and answers with its status, headers and
//! body.
//!
//! Target selection, from the request's query string:
//!
//! | parameter               | meaning                          |
//! |-------------------------|----------------------------------|
//! | `func`                  | provider (legacy name)           |
//! | `x-neru-debug-provider` | provider, wins over `func`       |
//! | `path`                  | provider path, wins over the URL |
//! | `x-neru-debug-path`     | provider path, wins over `path`  |

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::DefaultBodyLimit;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::tunnel::executor::canonical_header_key;
use crate::tunnel::log::intro;
use crate::tunnel::message::{MultiMap, RemoteCommand, ResponseMessage};
use crate::tunnel::{RemoteRequests, TunnelClient, TunnelError, TunnelSettings};

/// Errors that stop the debug proxy server.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind debugger port {port}: {error}")]
    Bind { port: u16, error: std::io::Error },
    #[error("debugger server error: {0}")]
    Serve(std::io::Error),
    #[error("failed to run websocket connection: {0}")]
    Tunnel(TunnelError),
    #[error("debugger task failed: {0}")]
    Task(String),
}

/// Turns local HTTP calls into remote requests over the tunnel.
#[derive(Clone)]
pub struct RemoteGateway {
    remote: RemoteRequests,
    timeout: Option<Duration>,
}

impl RemoteGateway {
    pub fn new(remote: RemoteRequests, timeout: Option<Duration>) -> Self {
        Self { remote, timeout }
    }

    /// Send `command` and wait for its answer. Only the first value of each
    /// header is forwarded.
    pub async fn send_remote_request(
        &self,
        command: RemoteCommand,
        headers: &HeaderMap,
        query: MultiMap,
    ) -> Result<ResponseMessage, TunnelError> {
        let mut flat = HashMap::new();
        for name in headers.keys() {
            if let Some(value) = headers.get(name) {
                flat.insert(
                    canonical_header_key(name.as_str()),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                );
            }
        }
        self.remote.send(command, flat, query, self.timeout).await
    }

    /// Catch-all router for the debugger port.
    pub fn router(self) -> Router {
        Router::new()
            .fallback(handle_remote_call)
            // Provider payloads are forwarded whole, whatever their size.
            .layer(DefaultBodyLimit::disable())
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

async fn handle_remote_call(
    State(gateway): State<RemoteGateway>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query = parse_query(uri.query().unwrap_or_default());
    let (provider, path) = remote_target(uri.path(), &query);
    let command = RemoteCommand {
        url: format!("http://{provider}{}", clean_path(&path)),
        faas_function: provider,
        method: method.to_string(),
        payload: body.to_vec(),
    };

    match gateway.send_remote_request(command, &headers, query).await {
        Ok(resp) => into_http_response(resp),
        Err(e @ TunnelError::RemoteTimeout { .. }) => {
            warn!("{e}");
            (StatusCode::GATEWAY_TIMEOUT, e.to_string()).into_response()
        }
        Err(e) => {
            warn!("remote request failed: {e}");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

fn into_http_response(resp: ResponseMessage) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, values) in &resp.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!("dropping invalid response header {name:?}");
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    (status, headers, resp.payload).into_response()
}

fn parse_query(raw: &str) -> MultiMap {
    let mut query = MultiMap::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        query
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    query
}

fn first<'a>(query: &'a MultiMap, key: &str) -> &'a str {
    query
        .get(key)
        .and_then(|values| values.first())
        .map_or("", String::as_str)
}

/// Provider and path for a call, honouring the override parameters.
pub fn remote_target(request_path: &str, query: &MultiMap) -> (String, String) {
    let mut provider = first(query, "func");
    let overridden = first(query, "x-neru-debug-provider");
    if !overridden.is_empty() {
        provider = overridden;
    }

    let mut path = request_path;
    for key in ["path", "x-neru-debug-path"] {
        let overridden = first(query, key);
        if !overridden.is_empty() {
            path = overridden;
        }
    }
    (provider.to_string(), path.to_string())
}

/// Rooted, lexically cleaned path: `a/./b/../c/` → `/a/c`.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Settings for [`start_debug_proxy_server`].
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub app_name: String,
    /// Public host of the debug service, shown in the intro banner.
    pub host_address: String,
    pub debugger_port: u16,
    pub shutdown_grace: Duration,
    pub remote_request_timeout: Option<Duration>,
    pub tunnel: TunnelSettings,
}

/// Bind the debugger port and run the gateway and the tunnel together.
///
/// Returns `Ok` after `shutdown` fires and the server drained (or the grace
/// period ran out), or the first error from either side.
pub async fn start_debug_proxy_server(
    settings: ProxySettings,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    let port = settings.debugger_port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|error| ProxyError::Bind { port, error })?;
    serve_debug_proxy(listener, settings, shutdown).await
}

/// [`start_debug_proxy_server`] on an already bound listener.
pub async fn serve_debug_proxy(
    listener: TcpListener,
    settings: ProxySettings,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    let client = TunnelClient::new(settings.tunnel);
    let router =
        RemoteGateway::new(client.remote_requests(), settings.remote_request_timeout).router();

    let stop = shutdown.child_token();
    let mut tunnel = tokio::spawn(client.run(stop.clone()));
    let server_stop = stop.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_stop.cancelled().await })
            .await
    });

    intro(&settings.app_name, &settings.host_address);

    let result = tokio::select! {
        joined = &mut tunnel => {
            stop.cancel();
            drain(&mut server, settings.shutdown_grace).await;
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ProxyError::Tunnel(e)),
                Err(e) => Err(ProxyError::Task(e.to_string())),
            }
        }
        joined = &mut server => {
            stop.cancel();
            let _ = tunnel.await;
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ProxyError::Serve(e)),
                Err(e) => Err(ProxyError::Task(e.to_string())),
            }
        }
    };
    info!("debugger proxy stopped");
    result
}

/// Wait for the server's graceful shutdown, aborting it after `grace`.
async fn drain(
    server: &mut tokio::task::JoinHandle<std::io::Result<()>>,
    grace: Duration,
) {
    if tokio::time::timeout(grace, &mut *server).await.is_err() {
        warn!("debugger server did not drain within {grace:?}, aborting");
        server.abort();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testutil::{http_url, next_json, send_json, spawn_relay, ws_url};

    fn query(pairs: &[(&str, &str)]) -> MultiMap {
        let mut map = MultiMap::new();
        for (k, v) in pairs {
            map.entry((*k).to_string()).or_default().push((*v).to_string());
        }
        map
    }

    #[test]
    fn provider_and_path_precedence() {
        assert_eq!(
            remote_target("/v1/calls", &query(&[("func", "voice")])),
            ("voice".into(), "/v1/calls".into())
        );
        assert_eq!(
            remote_target(
                "/ignored",
                &query(&[
                    ("func", "voice"),
                    ("x-neru-debug-provider", "messages"),
                    ("path", "p"),
                    ("x-neru-debug-path", "q"),
                ])
            ),
            ("messages".into(), "q".into())
        );
        assert_eq!(
            remote_target("/url", &query(&[("path", "from-param"), ("x-neru-debug-path", "")])),
            (String::new(), "from-param".into())
        );
        assert_eq!(
            remote_target("/url", &query(&[("func", "a"), ("x-neru-debug-provider", "")])),
            ("a".into(), "/url".into())
        );
    }

    #[test]
    fn path_cleaning() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("q"), "/q");
        assert_eq!(clean_path("/a/./b/../c/"), "/a/c");
        assert_eq!(clean_path("//x//y"), "/x/y");
        assert_eq!(clean_path("../../etc"), "/etc");
    }

    #[test]
    fn query_keeps_repeated_values() {
        let parsed = parse_query("a=1&b=x+y&a=2");
        assert_eq!(parsed["a"], vec!["1", "2"]);
        assert_eq!(parsed["b"], vec!["x y"]);
    }

    fn settings(relay: std::net::SocketAddr, timeout: Option<Duration>) -> ProxySettings {
        ProxySettings {
            app_name: "app-name".into(),
            host_address: "host-address".into(),
            debugger_port: 0,
            shutdown_grace: Duration::from_secs(5),
            remote_request_timeout: timeout,
            tunnel: TunnelSettings {
                relay_url: ws_url(relay, "/ws"),
                proxy_url: ws_url(relay, "/_/ws"),
                local_app_host: "http://127.0.0.1:9".into(),
                verbose: false,
            },
        }
    }

    #[tokio::test]
    async fn concurrent_calls_answered_out_of_order() {
        let (relay_addr, mut sockets) = spawn_relay().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_debug_proxy(
            listener,
            settings(relay_addr, None),
            shutdown.clone(),
        ));
        let mut socket = sockets.recv().await.unwrap();

        let http = reqwest::Client::new();
        let call = |provider: &'static str| {
            let request = http
                .post(format!("{}/calls?x-neru-debug-provider={provider}", http_url(gateway_addr)))
                .header("X-Trace", "t1")
                .body(provider);
            tokio::spawn(async move { request.send().await.unwrap() })
        };
        let voice = call("voice");
        let messages = call("messages");

        let a = next_json(&mut socket).await;
        let b = next_json(&mut socket).await;
        for req in [&a, &b] {
            assert_eq!(req["operation"], "execute-remote");
            assert_eq!(req["request"]["method"], "POST");
            assert_eq!(req["headers"]["X-Trace"], "t1");
            let provider = req["request"]["faas_function"].as_str().unwrap();
            assert_eq!(req["request"]["url"], format!("http://{provider}/calls"));
            assert_eq!(req["query"]["x-neru-debug-provider"][0], provider);
        }

        for req in [&b, &a] {
            let provider = req["request"]["faas_function"].as_str().unwrap();
            let status = if provider == "voice" { 201 } else { 202 };
            send_json(
                &mut socket,
                json!({
                    "id": req["id"],
                    "operation": "execute-remote",
                    "status": status,
                    "headers": {"Test-Header": ["test-value"]},
                    // Echo the provider's request body.
                    "payload": req["request"]["payload"],
                }),
            )
            .await;
        }

        let voice = voice.await.unwrap();
        assert_eq!(voice.status(), 201);
        assert_eq!(voice.headers()["test-header"], "test-value");
        assert_eq!(voice.text().await.unwrap(), "voice");
        let messages = messages.await.unwrap();
        assert_eq!(messages.status(), 202);
        assert_eq!(messages.text().await.unwrap(), "messages");

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn large_body_reaches_the_tunnel() {
        use base64::Engine;

        let (relay_addr, mut sockets) = spawn_relay().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_debug_proxy(
            listener,
            settings(relay_addr, None),
            shutdown.clone(),
        ));
        let mut socket = sockets.recv().await.unwrap();

        let body = vec![b'x'; 3 * 1024 * 1024];
        let call = tokio::spawn(
            reqwest::Client::new()
                .post(format!("{}/upload?func=assets", http_url(gateway_addr)))
                .body(body)
                .send(),
        );

        let req = next_json(&mut socket).await;
        let payload = base64::engine::general_purpose::STANDARD
            .decode(req["request"]["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(payload.len(), 3 * 1024 * 1024);
        send_json(
            &mut socket,
            json!({"id": req["id"], "operation": "execute-remote", "status": 200, "headers": {}, "payload": ""}),
        )
        .await;

        assert_eq!(call.await.unwrap().unwrap().status(), 200);
        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unanswered_call_times_out_with_504() {
        let (relay_addr, mut sockets) = spawn_relay().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_debug_proxy(
            listener,
            settings(relay_addr, Some(Duration::from_secs(1))),
            shutdown.clone(),
        ));
        let mut socket = sockets.recv().await.unwrap();

        let resp = reqwest::get(format!("{}/?func=voice", http_url(gateway_addr)))
            .await
            .unwrap();
        assert_eq!(next_json(&mut socket).await["operation"], "execute-remote");
        assert_eq!(resp.status(), 504);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tunnel_failure_stops_the_server() {
        let (relay_addr, mut sockets) = spawn_relay().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(serve_debug_proxy(
            listener,
            settings(relay_addr, None),
            CancellationToken::new(),
        ));
        let mut socket = sockets.recv().await.unwrap();

        send_json(&mut socket, json!({"id": "1", "operation": "bogus"})).await;

        let err = server.await.unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to run websocket connection: unknown inbound operation \"bogus\" received"
        );
    }

    #[tokio::test]
    async fn port_in_use_is_reported() {
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut settings = settings(taken.local_addr().unwrap(), None);
        settings.debugger_port = port;
        let err = start_debug_proxy_server(settings, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Bind { port: p, .. } if p == port));
    }
}
