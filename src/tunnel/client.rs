//! Tunnel client: the dispatcher between the relay and the local side.
//!
//! [`TunnelClient::run`] connects to the relay and runs two loops until
//! shutdown or the first unrecoverable error:
//!
//! - **inbound** reads envelopes and dispatches on `operation`: `execute`
//!   spawns a call to the local app, `websocket` spawns a bridge,
//!   `execute-remote` completes a pending [`RemoteRequests::send`].
//! - **outbound** is the only writer of the connection. It drains the
//!   response queue and the remote-request queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bridge::{run_bridge, BridgeEndpoints};
use super::executor::LocalApp;
use super::log::MessageLog;
use super::message::{
    peek_operation, MultiMap, Operation, RemoteCommand, RemoteRequestMessage, RequestMessage,
    ResponseMessage,
};
use super::registry::PendingResponses;
use super::transport::ReconnectingTransport;
use super::TunnelError;

/// Capacity of the response and remote-request queues.
pub const QUEUE_CAPACITY: usize = 100;

/// Where the tunnel connects and what it serves.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Relay websocket URL (`wss://host/<path>`).
    pub relay_url: String,
    /// Secondary relay URL for websocket bridges (`wss://host/_/<path>`).
    pub proxy_url: String,
    /// Local app base URL (`http://localhost:3000`).
    pub local_app_host: String,
    pub verbose: bool,
}

pub struct TunnelClient {
    transport: Arc<ReconnectingTransport>,
    app: LocalApp,
    endpoints: Arc<BridgeEndpoints>,
    registry: PendingResponses,
    remote_tx: mpsc::Sender<RemoteRequestMessage>,
    remote_rx: mpsc::Receiver<RemoteRequestMessage>,
    log: MessageLog,
}

impl TunnelClient {
    pub fn new(settings: TunnelSettings) -> Self {
        let (remote_tx, remote_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            transport: Arc::new(ReconnectingTransport::new(settings.relay_url)),
            app: LocalApp::new(settings.local_app_host.clone()),
            endpoints: Arc::new(BridgeEndpoints {
                proxy_url: settings.proxy_url,
                local_app_host: settings.local_app_host,
            }),
            registry: PendingResponses::new(),
            remote_tx,
            remote_rx,
            log: MessageLog::new(settings.verbose),
        }
    }

    /// Handle for issuing remote-provider calls over this tunnel.
    pub fn remote_requests(&self) -> RemoteRequests {
        RemoteRequests {
            registry: self.registry.clone(),
            outbound: self.remote_tx.clone(),
            log: self.log,
        }
    }

    /// Connect and serve until `shutdown` fires (`Ok`) or a loop fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        let TunnelClient {
            transport,
            app,
            endpoints,
            registry,
            remote_tx,
            remote_rx,
            log,
        } = self;
        drop(remote_tx);

        transport
            .connect_with_retry()
            .await
            .map_err(|e| TunnelError::Connect(Box::new(e)))?;
        info!("connected to debug relay at {}", transport.url());

        let (resp_tx, resp_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (err_tx, mut err_rx) = mpsc::channel(2);
        let sessions = shutdown.child_token();

        let dispatcher = Dispatcher {
            app,
            endpoints,
            registry,
            responses: resp_tx,
            sessions: sessions.clone(),
            log,
        };
        let inbound = tokio::spawn(inbound_loop(
            Arc::clone(&transport),
            dispatcher,
            err_tx.clone(),
        ));
        let outbound = tokio::spawn(outbound_loop(
            Arc::clone(&transport),
            resp_rx,
            remote_rx,
            err_tx,
        ));

        let result = tokio::select! {
            () = shutdown.cancelled() => Ok(()),
            Some(err) = err_rx.recv() => Err(err),
        };

        sessions.cancel();
        inbound.abort();
        outbound.abort();
        let _ = inbound.await;
        let _ = outbound.await;
        transport.close().await;
        result
    }
}

/// Per-envelope handlers, shared by the inbound loop.
struct Dispatcher {
    app: LocalApp,
    endpoints: Arc<BridgeEndpoints>,
    registry: PendingResponses,
    responses: mpsc::Sender<ResponseMessage>,
    /// Cancelled when the tunnel stops; ends running bridges.
    sessions: CancellationToken,
    log: MessageLog,
}

impl Dispatcher {
    /// Route one text frame. Only an unknown operation is an error; anything
    /// wrong with a single envelope is logged and dropped.
    async fn dispatch(&self, text: &str) -> Result<(), TunnelError> {
        let operation = match peek_operation(text) {
            Ok(op) => op,
            Err(e) => {
                warn!("{}", TunnelError::Decode(e));
                return Ok(());
            }
        };
        match Operation::parse(&operation) {
            Some(Operation::Execute) => {
                if let Some(req) = self.decode::<RequestMessage>(text) {
                    self.execute(req);
                }
            }
            Some(Operation::Websocket) => {
                if let Some(req) = self.decode::<RequestMessage>(text) {
                    self.open_bridge(req);
                }
            }
            Some(Operation::ExecuteRemote) => {
                if let Some(resp) = self.decode::<ResponseMessage>(text) {
                    self.log.inbound_response(&resp);
                    if let Err(e) = self.registry.resolve(resp).await {
                        warn!("{e}");
                    }
                }
            }
            Some(Operation::ExecuteResponse) | None => {
                return Err(TunnelError::UnknownOperation(operation));
            }
        }
        Ok(())
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, text: &str) -> Option<T> {
        match serde_json::from_str(text) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{}", TunnelError::Decode(e));
                None
            }
        }
    }

    fn execute(&self, req: RequestMessage) {
        let app = self.app.clone();
        let responses = self.responses.clone();
        let log = self.log;
        tokio::spawn(async move {
            log.inbound_request(&req);
            let resp = app.execute(&req).await;
            log.outbound_response(&resp);
            if responses.send(resp).await.is_err() {
                debug!(id = %req.id, "tunnel stopped before the response could be queued");
            }
        });
    }

    fn open_bridge(&self, req: RequestMessage) {
        let endpoints = Arc::clone(&self.endpoints);
        let sessions = self.sessions.clone();
        let log = self.log;
        tokio::spawn(async move {
            log.inbound_request(&req);
            match run_bridge(&req, &endpoints, &sessions).await {
                Ok(()) => debug!(id = %req.id, "websocket bridge closed"),
                Err(e) => {
                    warn!(id = %req.id, "websocket bridge ended: {e}");
                    log.failure(&e);
                }
            }
        });
    }
}

async fn inbound_loop(
    transport: Arc<ReconnectingTransport>,
    dispatcher: Dispatcher,
    errors: mpsc::Sender<TunnelError>,
) {
    loop {
        let msg = match transport.read_message().await {
            Ok(msg) => msg,
            Err(e) => {
                let _ = errors.send(TunnelError::Read(Box::new(e))).await;
                return;
            }
        };
        let Message::Text(text) = msg else {
            continue;
        };
        if let Err(e) = dispatcher.dispatch(text.as_str()).await {
            let _ = errors.send(e).await;
            return;
        }
    }
}

async fn outbound_loop(
    transport: Arc<ReconnectingTransport>,
    mut responses: mpsc::Receiver<ResponseMessage>,
    mut remote: mpsc::Receiver<RemoteRequestMessage>,
    errors: mpsc::Sender<TunnelError>,
) {
    loop {
        let result = tokio::select! {
            Some(resp) = responses.recv() => transport
                .write_json(&resp)
                .await
                .map_err(|e| TunnelError::WriteResponse(Box::new(e))),
            Some(req) = remote.recv() => transport
                .write_json(&req)
                .await
                .map_err(|e| TunnelError::WriteRemoteRequest(Box::new(e))),
            else => return,
        };
        if let Err(e) = result {
            let _ = errors.send(e).await;
            return;
        }
    }
}

/// Sends `execute-remote` envelopes and waits for their correlated reply.
#[derive(Clone)]
pub struct RemoteRequests {
    registry: PendingResponses,
    outbound: mpsc::Sender<RemoteRequestMessage>,
    log: MessageLog,
}

impl RemoteRequests {
    /// Issue `command` under a fresh id and wait for the relay's answer.
    ///
    /// The id is registered before the envelope is queued, so an answer can
    /// never beat its own registration. With `timeout` set, an unanswered
    /// request is forgotten and [`TunnelError::RemoteTimeout`] is returned;
    /// without it the wait lasts as long as the caller does.
    pub async fn send(
        &self,
        command: RemoteCommand,
        headers: HashMap<String, String>,
        query: MultiMap,
        timeout: Option<Duration>,
    ) -> Result<ResponseMessage, TunnelError> {
        let id = Uuid::new_v4().to_string();
        let reply = self.registry.register(&id).await?;
        // Cleans up after a caller that is dropped while waiting.
        let slot = self.registry.guard(&id);

        let msg = RemoteRequestMessage {
            id: id.clone(),
            operation: Operation::ExecuteRemote,
            request: command,
            headers,
            query,
        };
        self.log.outbound_request(&msg);
        if self.outbound.send(msg).await.is_err() {
            return Err(TunnelError::OutboundClosed);
        }

        let answered = match timeout {
            None => reply.await,
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(answered) => answered,
                Err(_) => {
                    return Err(TunnelError::RemoteTimeout {
                        id,
                        secs: limit.as_secs(),
                    });
                }
            },
        };
        slot.disarm();
        // The registry lives as long as `self`, so a sender is only dropped
        // unsent when the slot was removed out from under us.
        answered.map_err(|_| TunnelError::OutboundClosed)
    }

    pub fn registry(&self) -> &PendingResponses {
        &self.registry
    }
}
