//! Verbose per-message tracing.
//!
//! Enabled by `debugger.verbose`; the flag travels with [`MessageLog`] into
//! every component that traces messages.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{error, info};

use super::message::{MultiMap, RemoteRequestMessage, RequestMessage, ResponseMessage};

/// Payloads above this size are not rendered.
const MAX_RENDERED_PAYLOAD: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageLog {
    verbose: bool,
}

impl MessageLog {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn inbound_request(self, req: &RequestMessage) {
        if self.verbose {
            info!(
                id = %req.id,
                method = %req.method,
                path = %req.route,
                query = %flatten(&req.query),
                headers = %flatten(&req.headers),
                payload = %render_payload(&req.payload),
                "➡️  Inbound request to client app"
            );
        }
    }

    pub fn outbound_response(self, resp: &ResponseMessage) {
        if self.verbose {
            info!(
                id = %resp.id,
                status = resp.status,
                headers = %flatten(&resp.headers),
                payload = %render_payload(&resp.payload),
                "⬅️  Outbound response from client app"
            );
        }
    }

    pub fn outbound_request(self, req: &RemoteRequestMessage) {
        if self.verbose {
            let headers: BTreeMap<&String, &String> = req.headers.iter().collect();
            info!(
                id = %req.id,
                provider = %req.request.faas_function.trim_end_matches(".neru"),
                headers = %pretty(&headers),
                query = %flatten(&req.query),
                payload = %render_payload(&req.request.payload),
                "⬅️  Outbound request to provider"
            );
        }
    }

    pub fn inbound_response(self, resp: &ResponseMessage) {
        if self.verbose {
            info!(
                id = %resp.id,
                status = resp.status,
                headers = %flatten(&resp.headers),
                payload = %render_payload(&resp.payload),
                "➡️  Inbound response from provider"
            );
        }
    }

    pub fn failure(self, err: &dyn std::fmt::Display) {
        if self.verbose {
            error!("{err}");
        }
    }
}

/// Banner printed once the local proxy is up.
pub fn intro(app_name: &str, host: &str) {
    info!("🐞 Debugger proxy connection established - have a play around!");
    info!("Application name: {app_name}");
    info!("Application host: {host}");
}

/// Single-valued entries shown as plain strings, others as arrays.
fn flatten(map: &MultiMap) -> String {
    let flat: HashMap<&String, Value> = map
        .iter()
        .map(|(k, v)| {
            let value = match v.as_slice() {
                [single] => Value::from(single.as_str()),
                many => Value::from(many.to_vec()),
            };
            (k, value)
        })
        .collect();
    pretty(&flat)
}

fn pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn render_payload(payload: &[u8]) -> String {
    if payload.is_empty() {
        return String::new();
    }
    if payload.len() > MAX_RENDERED_PAYLOAD {
        return "[Too big to display]".to_string();
    }
    let Ok(text) = std::str::from_utf8(payload) else {
        return "[Binary payload]".to_string();
    };
    match serde_json::from_str::<Value>(text) {
        Ok(json) => pretty(&json),
        Err(_) => text.to_string(),
    }
}
