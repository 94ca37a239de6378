//! Reconnecting websocket transport.
//!
//! [`ReconnectingTransport`] owns the single live connection to the relay.
//! Reads and writes go through [`ReconnectingTransport::read_message`] and
//! [`ReconnectingTransport::write_json`], which reconnect with the
//! [`BACKOFF_LADDER`] and retry on any failure other than a normal closure.
//!
//! A connection is never repaired in place: a reconnect installs a fresh
//! [`Connection`] with the next generation number and retires the old one.
//! Reader and writer may both notice the same broken connection; the
//! generation check makes the second one reuse the replacement instead of
//! dialing again.
//!
//! Websocket legs opened by the bridge use [`connect_leg_with_retry`], which
//! tags the dial with `X-Connection-Id` and gives up at once when the relay
//! answers 404.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::TunnelError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Delays between dial attempts. One more attempt follows the last step.
pub const BACKOFF_LADDER: [Duration; 5] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
    Duration::from_millis(800),
    Duration::from_millis(1000),
];

/// Header carrying the bridge session id on leg dials.
pub const CONNECTION_ID_HEADER: &str = "X-Connection-Id";

/// Run `attempt` until it succeeds, sleeping through [`BACKOFF_LADDER`]
/// between failures, then make one final attempt.
///
/// Non-retryable errors are returned immediately. Exhausting the ladder wraps
/// the last error in [`TunnelError::RetriesExhausted`].
pub async fn retry_with_backoff<T, F, Fut>(mut attempt: F) -> Result<T, TunnelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TunnelError>>,
{
    for delay in BACKOFF_LADDER {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_non_retryable() => return Err(e),
            Err(e) => debug!("dial failed: {e}, retrying in {delay:?}"),
        }
        tokio::time::sleep(delay).await;
    }
    attempt().await.map_err(|e| {
        if e.is_non_retryable() {
            e
        } else {
            TunnelError::RetriesExhausted {
                attempts: BACKOFF_LADDER.len(),
                last: Box::new(e),
            }
        }
    })
}

/// Dial `url` once with extra handshake headers.
///
/// With `leg = true` an HTTP 404 answer is classified as
/// [`TunnelError::ConnectionIdNotFound`].
async fn dial(url: &str, headers: &HeaderMap, leg: bool) -> Result<WsStream, TunnelError> {
    let mut request = url.into_client_request().map_err(TunnelError::Dial)?;
    for (name, value) in headers {
        request.headers_mut().append(name.clone(), value.clone());
    }
    match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _response)) => Ok(ws),
        Err(tungstenite::Error::Http(response)) => {
            if leg && response.status() == StatusCode::NOT_FOUND {
                return Err(TunnelError::ConnectionIdNotFound);
            }
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            Err(TunnelError::BadResponse(format!(
                "{} {}",
                response.status(),
                body
            )))
        }
        Err(e) => Err(TunnelError::Dial(e)),
    }
}

/// Dial a bridge leg tagged with `connection_id`, retrying with the ladder.
pub async fn connect_leg_with_retry(
    url: &str,
    connection_id: &str,
    headers: &HeaderMap,
) -> Result<WsStream, TunnelError> {
    let mut headers = headers.clone();
    let value = HeaderValue::from_str(connection_id).map_err(|e| TunnelError::InvalidHeader {
        name: CONNECTION_ID_HEADER.to_string(),
        reason: e.to_string(),
    })?;
    headers.insert(CONNECTION_ID_HEADER, value);
    retry_with_backoff(|| dial(url, &headers, true)).await
}

/// One live relay connection. Replaced, never mutated, on reconnect.
struct Connection {
    generation: u64,
    sink: Mutex<WsSink>,
    source: Mutex<WsSource>,
    /// Cancelled when a newer connection takes over.
    retired: CancellationToken,
    /// Set once the reader saw close code 1000.
    closed_normally: AtomicBool,
}

impl Connection {
    fn new(generation: u64, ws: WsStream) -> Self {
        let (sink, source) = ws.split();
        Self {
            generation,
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            retired: CancellationToken::new(),
            closed_normally: AtomicBool::new(false),
        }
    }
}

/// The tunnel's connection to the relay, transparently re-established.
pub struct ReconnectingTransport {
    url: String,
    current: Mutex<Option<Arc<Connection>>>,
}

impl ReconnectingTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            current: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Single dial attempt. On success the new connection replaces any
    /// previous one.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let ws = dial(&self.url, &HeaderMap::new(), false).await?;
        self.install(ws).await;
        Ok(())
    }

    /// Dial with the backoff ladder. On success the new connection replaces
    /// any previous one.
    pub async fn connect_with_retry(&self) -> Result<(), TunnelError> {
        let ws = self.dial_with_retry().await?;
        self.install(ws).await;
        Ok(())
    }

    async fn dial_with_retry(&self) -> Result<WsStream, TunnelError> {
        let headers = HeaderMap::new();
        retry_with_backoff(|| dial(&self.url, &headers, false)).await
    }

    async fn install(&self, ws: WsStream) {
        let mut current = self.current.lock().await;
        let generation = current.as_ref().map_or(0, |c| c.generation) + 1;
        if let Some(old) = current.take() {
            old.retired.cancel();
        }
        *current = Some(Arc::new(Connection::new(generation, ws)));
    }

    /// Current connection, dialing first if there is none yet.
    async fn live(&self) -> Result<Arc<Connection>, TunnelError> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            return Ok(Arc::clone(conn));
        }
        let ws = self.dial_with_retry().await?;
        let conn = Arc::new(Connection::new(1, ws));
        *current = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Replace `failed` unless someone already did.
    async fn reconnect(&self, failed: &Connection) -> Result<(), TunnelError> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.generation != failed.generation {
                return Ok(());
            }
        }
        failed.retired.cancel();
        let ws = self.dial_with_retry().await?;
        *current = Some(Arc::new(Connection::new(failed.generation + 1, ws)));
        debug!(generation = failed.generation + 1, "reconnected to {}", self.url);
        Ok(())
    }

    /// Next frame from the relay.
    ///
    /// A close frame with code 1000 ends the session with
    /// [`TunnelError::NormalClosure`]. Any other failure reconnects and reads
    /// again; only a failed reconnect is returned.
    pub async fn read_message(&self) -> Result<Message, TunnelError> {
        loop {
            let conn = self.live().await?;
            let next = {
                let mut source = conn.source.lock().await;
                tokio::select! {
                    () = conn.retired.cancelled() => None,
                    next = source.next() => Some(next),
                }
            };
            let Some(next) = next else {
                continue;
            };
            match next {
                Some(Ok(Message::Close(frame))) => {
                    if is_normal_closure(frame.as_ref()) {
                        conn.closed_normally.store(true, Ordering::Release);
                        return Err(TunnelError::NormalClosure);
                    }
                    warn!("relay closed the tunnel ({frame:?}), reconnecting");
                    self.reconnect(&conn).await?;
                }
                Some(Ok(msg)) => return Ok(msg),
                Some(Err(e)) => {
                    warn!("tunnel read failed: {e}, reconnecting");
                    self.reconnect(&conn).await?;
                }
                None => {
                    warn!("tunnel stream ended, reconnecting");
                    self.reconnect(&conn).await?;
                }
            }
        }
    }

    /// Send `value` as a JSON text frame, reconnecting on failure.
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), TunnelError> {
        let text = serde_json::to_string(value).map_err(TunnelError::Encode)?;
        loop {
            let conn = self.live().await?;
            let result = conn
                .sink
                .lock()
                .await
                .send(Message::Text(text.clone().into()))
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(_) if conn.closed_normally.load(Ordering::Acquire) => {
                    return Err(TunnelError::NormalClosure);
                }
                Err(e) => {
                    warn!("tunnel write failed: {e}, reconnecting");
                    self.reconnect(&conn).await?;
                }
            }
        }
    }

    /// Close the live connection, if any, with a normal closure.
    pub async fn close(&self) {
        let conn = self.current.lock().await.take();
        if let Some(conn) = conn {
            conn.retired.cancel();
            let _ = conn.sink.lock().await.close().await;
        }
    }
}

fn is_normal_closure(frame: Option<&CloseFrame>) -> bool {
    frame.is_some_and(|f| f.code == CloseCode::Normal)
}
