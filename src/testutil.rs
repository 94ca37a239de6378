//! In-process servers standing in for the relay and the local app in tests.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Serve `router` on an ephemeral localhost port.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn accept(State(sockets): State<mpsc::Sender<WebSocket>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let _ = sockets.send(socket).await;
    })
}

/// Fake relay on `/ws` handing every accepted tunnel socket to the test.
pub async fn spawn_relay() -> (SocketAddr, mpsc::Receiver<WebSocket>) {
    let (tx, rx) = mpsc::channel(4);
    let router = Router::new().route("/ws", get(accept)).with_state(tx);
    (spawn_server(router).await, rx)
}

/// Next JSON text frame on a relay-side socket, skipping other frames.
pub async fn next_json(socket: &mut WebSocket) -> Value {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => {}
            other => panic!("relay socket ended: {other:?}"),
        }
    }
}

pub async fn send_json(socket: &mut WebSocket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

pub fn ws_url(addr: SocketAddr, path: &str) -> String {
    format!("ws://{addr}{path}")
}

pub fn http_url(addr: SocketAddr) -> String {
    format!("http://{addr}")
}
