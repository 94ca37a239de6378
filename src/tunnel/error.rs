//! Error taxonomy for the tunnel.
//!
//! Each variant's message embeds the error it wraps, so `to_string()` yields
//! the whole chain (`error reading inbound debugger message: retried
//! connecting 5 times: failed to dial server: ...`) and names the stage that
//! failed.

use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to dial server: {0}")]
    Dial(tungstenite::Error),

    #[error("bad response from server: {0}")]
    BadResponse(String),

    /// The relay answered a leg dial with 404: it already discarded this
    /// session. Never retried.
    #[error("remote user connection removed: connection id not found")]
    ConnectionIdNotFound,

    #[error("retried connecting {attempts} times: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<TunnelError>,
    },

    /// Close code 1000 from the relay. Terminal for the session.
    #[error("websocket: close 1000 (normal)")]
    NormalClosure,

    #[error("failed to connect to websocket server: {0}")]
    Connect(Box<TunnelError>),

    #[error("error reading inbound debugger message: {0}")]
    Read(Box<TunnelError>),

    #[error("failed to write response back to websocket server: {0}")]
    WriteResponse(Box<TunnelError>),

    #[error("failed to write remote request to websocket server: {0}")]
    WriteRemoteRequest(Box<TunnelError>),

    #[error("failed to connect to remote websocket debugger server: {0}")]
    ProxyLeg(Box<TunnelError>),

    #[error("failed to connect to local app server: {0}")]
    AppLeg(Box<TunnelError>),

    #[error("error reading inbound message: {0}")]
    ForwardRead(tungstenite::Error),

    #[error("failed to write response back: {0}")]
    ForwardWrite(tungstenite::Error),

    #[error("websocket leg closed")]
    LegClosed,

    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),

    #[error("unknown inbound operation {0:?} received")]
    UnknownOperation(String),

    #[error("missing remote response channel for id {0:?}")]
    OrphanResponse(String),

    #[error("request id {0:?} is already pending")]
    DuplicateRequestId(String),

    #[error("no remote response for id {id:?} within {secs}s")]
    RemoteTimeout { id: String, secs: u64 },

    #[error("tunnel is not running")]
    OutboundClosed,

    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },
}

impl TunnelError {
    /// Whether retrying the dial can never succeed.
    pub fn is_non_retryable(&self) -> bool {
        matches!(self, TunnelError::ConnectionIdNotFound)
    }

    /// Whether the relay closed the session with a normal closure, at any
    /// depth of the chain.
    pub fn is_normal_closure(&self) -> bool {
        match self {
            TunnelError::NormalClosure => true,
            TunnelError::Read(inner)
            | TunnelError::WriteResponse(inner)
            | TunnelError::WriteRemoteRequest(inner) => inner.is_normal_closure(),
            _ => false,
        }
    }
}
