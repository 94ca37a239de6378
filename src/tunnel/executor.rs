//! Runs relayed `execute` requests against the local application.

use std::time::Instant;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use reqwest::Method;
use tracing::info;

use super::message::{MultiMap, Operation, RequestMessage, ResponseMessage};

/// HTTP client bound to the local app's base URL (e.g. `http://localhost:3000`).
#[derive(Clone)]
pub struct LocalApp {
    base_url: String,
    http: reqwest::Client,
}

impl LocalApp {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    /// Call the local app. Always yields a response: failures to build or send
    /// the request become a 500 carrying the error text.
    pub async fn execute(&self, msg: &RequestMessage) -> ResponseMessage {
        match self.try_execute(msg).await {
            Ok(resp) => resp,
            Err(e) => ResponseMessage::local_failure(&msg.id, &e),
        }
    }

    async fn try_execute(&self, msg: &RequestMessage) -> Result<ResponseMessage, ExecuteError> {
        let method = Method::from_bytes(msg.method.as_bytes())
            .map_err(|_| ExecuteError::Method(msg.method.clone()))?;
        let url = join_route(&self.base_url, &msg.route);
        let query: Vec<(&str, &str)> = msg
            .query
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
            .collect();

        let started = Instant::now();
        let resp = self
            .http
            .request(method, &url)
            .query(&query)
            .headers(request_headers(&msg.headers)?)
            .body(msg.payload.clone())
            .send()
            .await?;

        let status = resp.status();
        let path = resp.url().path().to_string();
        let headers = response_headers(resp.headers());
        let payload = resp.bytes().await?.to_vec();

        info!(
            "[vcr-debug] {:3} | {:>13?} | {}  {}",
            status.as_u16(),
            started.elapsed(),
            msg.method,
            path
        );

        Ok(ResponseMessage {
            id: msg.id.clone(),
            operation: Operation::ExecuteResponse,
            status: status.as_u16(),
            headers,
            payload,
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum ExecuteError {
    #[error("invalid method {0:?}")]
    Method(String),
    #[error("invalid header {0:?}")]
    Header(String),
    #[error("{0}")]
    Http(#[from] reqwest::Error),
}

/// Append `route` to `host`, inserting the separating slash when missing.
pub fn join_route(host: &str, route: &str) -> String {
    if route.starts_with('/') {
        format!("{host}{route}")
    } else {
        format!("{host}/{route}")
    }
}

fn request_headers(headers: &MultiMap) -> Result<HeaderMap, ExecuteError> {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ExecuteError::Header(name.clone()))?;
        // Derived by the client for the local hop.
        if name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        for value in values {
            let value =
                HeaderValue::from_str(value).map_err(|_| ExecuteError::Header(name.to_string()))?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}

fn response_headers(headers: &HeaderMap) -> MultiMap {
    let mut map = MultiMap::new();
    for (name, value) in headers {
        map.entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// MIME canonical form: `content-type` → `Content-Type`.
pub fn canonical_header_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use axum::body::Bytes;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use axum::Router;

    use super::*;
    use crate::testutil::{http_url, spawn_server};

    fn execute_msg(route: &str, payload: &[u8]) -> RequestMessage {
        RequestMessage {
            id: "test-id".into(),
            operation: Operation::Execute,
            method: "POST".into(),
            route: route.into(),
            query: MultiMap::from([("test-query".into(), vec!["test-value".into()])]),
            headers: MultiMap::from([
                ("Test-Header".into(), vec!["test-value".into()]),
                ("Host".into(), vec!["public.example.com".into()]),
            ]),
            payload: payload.to_vec(),
        }
    }

    async fn echo(headers: AxumHeaders, uri: axum::http::Uri, body: Bytes) -> (StatusCode, [(&'static str, String); 2], Bytes) {
        let header = headers
            .get("test-header")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        (
            StatusCode::CREATED,
            [("x-seen-header", header), ("x-seen-query", uri.query().unwrap_or_default().to_string())],
            body,
        )
    }

    #[tokio::test]
    async fn echoes_body_back_under_same_id() {
        let addr = spawn_server(Router::new().route("/echo", post(echo))).await;
        let app = LocalApp::new(http_url(addr));

        let resp = app.execute(&execute_msg("echo", b"test-payload")).await;
        assert_eq!(resp.id, "test-id");
        assert_eq!(resp.operation, Operation::ExecuteResponse);
        assert_eq!(resp.status, 201);
        assert_eq!(resp.payload, b"test-payload");
        assert_eq!(resp.headers["X-Seen-Header"], vec!["test-value"]);
        assert_eq!(resp.headers["X-Seen-Query"], vec!["test-query=test-value"]);
    }

    #[tokio::test]
    async fn unreachable_app_yields_500() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let resp = LocalApp::new(http_url(addr))
            .execute(&execute_msg("/echo", b"x"))
            .await;
        assert_eq!(resp.id, "test-id");
        assert_eq!(resp.status, 500);
        assert!(String::from_utf8(resp.payload)
            .unwrap()
            .starts_with("failed to call local app: "));
    }

    #[tokio::test]
    async fn bad_method_yields_500() {
        let mut msg = execute_msg("/", b"");
        msg.method = "NOT A METHOD".into();
        let resp = LocalApp::new("http://127.0.0.1:9").execute(&msg).await;
        assert_eq!(resp.status, 500);
        assert_eq!(
            resp.payload,
            b"failed to call local app: invalid method \"NOT A METHOD\""
        );
    }

    #[test]
    fn route_joining() {
        assert_eq!(join_route("http://h", "a/b"), "http://h/a/b");
        assert_eq!(join_route("http://h", "/a"), "http://h/a");
        assert_eq!(join_route("http://h", ""), "http://h/");
    }

    #[test]
    fn canonical_keys() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("x-neru-debug-path"), "X-Neru-Debug-Path");
        assert_eq!(canonical_header_key("ETAG"), "Etag");
    }
}
