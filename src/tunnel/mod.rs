//! Bidirectional debug tunnel.
//!
//! A single websocket to the relay carries three kinds of traffic:
//!
//! - **execute**: HTTP requests from the cloud, replayed against the local
//!   app by [`executor::LocalApp`].
//! - **websocket**: websocket sessions from the cloud, spliced onto the local
//!   app by [`bridge`] over two extra connections.
//! - **execute-remote**: calls from the local app to remote providers, issued
//!   through [`client::RemoteRequests`] and answered on the same tunnel.
//!
//! [`client::TunnelClient`] owns the connection and dispatches between them.

pub mod bridge;
pub mod client;
pub mod error;
pub mod executor;
pub mod log;
pub mod message;
pub mod registry;
pub mod transport;

pub use client::{RemoteRequests, TunnelClient, TunnelSettings};
pub use error::TunnelError;
