//! Debug session orchestration.
//!
//! A session deploys (or adopts) a debug service, waits for it to become
//! ready, derives the relay URLs from the region's host template, starts the
//! local debugger proxy, launches the developer's app and then waits for an
//! interrupt or a proxy failure. Teardown always kills the app tree and
//! removes the debug service.
//!
//! The deployment API and the region catalogue are collaborators behind
//! [`DebugServiceApi`] and [`RegionLookup`]; [`PreDeployedService`] satisfies
//! both from configuration.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::gateway::{start_debug_proxy_server, ProxyError, ProxySettings};
use crate::process::{resolve_environment, CommandGenerator, EnvVar, LaunchError, LaunchSpec};
use crate::tunnel::TunnelSettings;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pauses between readiness polls.
pub const READY_INTERVALS: [Duration; 14] = [
    Duration::from_secs(1),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(5),
    Duration::from_secs(5),
    Duration::from_secs(5),
    Duration::from_secs(5),
    Duration::from_secs(5),
    Duration::from_secs(5),
    Duration::from_secs(5),
];

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to deploy debug server: {0}")]
    Deploy(BoxError),
    #[error("timed out waiting for debug server to deploy")]
    ReadyTimeout,
    #[error("{0}")]
    Api(BoxError),
    #[error("failed to get region: {0}")]
    Region(BoxError),
    #[error("failed to get http and websocket urls: {0}")]
    Urls(Box<SessionError>),
    #[error("invalid host template {template:?}: {reason}")]
    HostTemplate { template: String, reason: String },
    #[error("websocket path is empty")]
    EmptyWebsocketPath,
    #[error("failed to inject debug environment variables: {0}")]
    Environment(LaunchError),
    #[error("failed to run local debug process: {0}")]
    Launch(LaunchError),
    #[error("failed to run local debug proxy: {0}")]
    Proxy(ProxyError),
    #[error("failed to remove debug server: {0}")]
    Remove(BoxError),
}

/// What the deployment API needs to create a debug service.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub region: String,
    pub application_id: String,
    /// Optional fixed name; gives the service a deterministic URL.
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub service_name: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub websocket_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Region {
    #[serde(default)]
    pub name: String,
    pub alias: String,
    #[serde(default)]
    pub endpoint_url_scheme: String,
    #[serde(default)]
    pub debugger_url_scheme: String,
    pub host_template: String,
}

#[async_trait]
pub trait DebugServiceApi: Send + Sync {
    async fn deploy_debug_service(&self, request: &DeployRequest)
        -> Result<DeployResponse, BoxError>;

    async fn service_ready(&self, service_name: &str) -> Result<bool, BoxError>;

    async fn delete_debug_service(
        &self,
        service_name: &str,
        preserve_data: bool,
    ) -> Result<(), BoxError>;
}

#[async_trait]
pub trait RegionLookup: Send + Sync {
    async fn region(&self, alias: &str) -> Result<Region, BoxError>;
}

/// A debug service that already exists, described by configuration.
///
/// Deploying returns the configured service, it is always ready, and it is
/// left in place when the session ends.
#[derive(Debug, Clone)]
pub struct PreDeployedService {
    pub service: DeployResponse,
    pub region: Region,
}

#[async_trait]
impl DebugServiceApi for PreDeployedService {
    async fn deploy_debug_service(
        &self,
        _request: &DeployRequest,
    ) -> Result<DeployResponse, BoxError> {
        if self.service.service_name.is_empty() {
            return Err("service.service_name is not configured".into());
        }
        Ok(self.service.clone())
    }

    async fn service_ready(&self, _service_name: &str) -> Result<bool, BoxError> {
        Ok(true)
    }

    async fn delete_debug_service(
        &self,
        service_name: &str,
        _preserve_data: bool,
    ) -> Result<(), BoxError> {
        info!("leaving pre-deployed debug service {service_name} in place");
        Ok(())
    }
}

#[async_trait]
impl RegionLookup for PreDeployedService {
    async fn region(&self, alias: &str) -> Result<Region, BoxError> {
        if self.region.host_template.is_empty() {
            return Err(format!("no host template configured for region {alias:?}").into());
        }
        Ok(self.region.clone())
    }
}

/// Poll until the service reports ready, pausing per `intervals`.
pub async fn wait_for_service_ready(
    api: &dyn DebugServiceApi,
    service_name: &str,
    intervals: &[Duration],
) -> Result<(), SessionError> {
    for pause in intervals {
        if api
            .service_ready(service_name)
            .await
            .map_err(SessionError::Api)?
        {
            return Ok(());
        }
        tokio::time::sleep(*pause).await;
    }
    Err(SessionError::ReadyTimeout)
}

/// Substitute `{{.ServiceName}}` in a region host template.
pub fn expand_host_template(service_name: &str, template: &str) -> Result<String, SessionError> {
    let invalid = |reason: &str| SessionError::HostTemplate {
        template: template.to_string(),
        reason: reason.to_string(),
    };
    let mut out = String::with_capacity(template.len() + service_name.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| invalid("unclosed action"))?;
        match after[..end].trim() {
            ".ServiceName" => out.push_str(service_name),
            other => return Err(invalid(&format!("unknown field {other:?}"))),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Public endpoints of a debug service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUrls {
    /// `https://<service host>`
    pub http: String,
    /// `wss://<service host>/<websocket path>`
    pub websocket: String,
    /// `wss://<service host>/_/<websocket path>`
    pub proxy_websocket: String,
}

pub fn relay_urls(
    service_name: &str,
    host_template: &str,
    websocket_path: &str,
) -> Result<RelayUrls, SessionError> {
    let http = expand_host_template(service_name, host_template)?;
    if websocket_path.is_empty() {
        return Err(SessionError::EmptyWebsocketPath);
    }
    let path = websocket_path.trim_start_matches('/');
    let ws_host = http.replacen("http", "ws", 1);
    Ok(RelayUrls {
        websocket: format!("{ws_host}/{path}"),
        proxy_websocket: format!("{ws_host}/_/{path}"),
        http,
    })
}

/// Everything a session needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub region: String,
    pub application_id: String,
    pub name: String,
    pub entrypoint: Vec<String>,
    pub working_dir: PathBuf,
    pub api_key: String,
    pub api_secret: String,
    pub app_host: String,
    pub app_port: u16,
    pub debugger_port: u16,
    pub preserve_data: bool,
    pub verbose: bool,
    pub shutdown_grace: Duration,
    pub remote_request_timeout: Option<Duration>,
    pub ready_intervals: Vec<Duration>,
    /// User variables for the app, resolved before anything is deployed.
    pub environment: Vec<EnvVar>,
}

/// Run one debug session until `shutdown` fires or the proxy fails.
///
/// Any failure after the service was deployed removes it before returning.
/// A proxy failure is returned after the app was killed and the service
/// removed.
pub async fn run_debug_session(
    api: &dyn DebugServiceApi,
    regions: &dyn RegionLookup,
    options: SessionOptions,
    shutdown: CancellationToken,
) -> Result<(), SessionError> {
    let user_environment = resolve_environment(&options.environment, |name| {
        std::env::var(name).ok()
    })
    .map_err(SessionError::Environment)?;
    let service = deploy_debug_server(api, &options).await?;
    let name = service.service_name.clone();

    let region = match regions.region(&options.region).await {
        Ok(region) => region,
        Err(e) => return Err(cleanup(api, &name, &options, SessionError::Region(e)).await),
    };
    let urls = match relay_urls(&name, &region.host_template, &service.websocket_path) {
        Ok(urls) => urls,
        Err(e) => {
            return Err(cleanup(api, &name, &options, SessionError::Urls(Box::new(e))).await)
        }
    };

    let proxy_stop = CancellationToken::new();
    let mut proxy = tokio::spawn(start_debug_proxy_server(
        ProxySettings {
            app_name: name.clone(),
            host_address: urls.http.clone(),
            debugger_port: options.debugger_port,
            shutdown_grace: options.shutdown_grace,
            remote_request_timeout: options.remote_request_timeout,
            tunnel: TunnelSettings {
                relay_url: urls.websocket.clone(),
                proxy_url: urls.proxy_websocket.clone(),
                local_app_host: format!("http://{}:{}", options.app_host, options.app_port),
                verbose: options.verbose,
            },
        },
        proxy_stop.clone(),
    ));

    let launched = CommandGenerator::new(LaunchSpec {
        entrypoint: options.entrypoint.clone(),
        working_dir: options.working_dir.clone(),
        instance_id: service.instance_id.clone(),
        service_name: name.clone(),
        api_key: options.api_key.clone(),
        api_secret: options.api_secret.clone(),
        application_id: options.application_id.clone(),
        application_port: options.app_port,
        private_key: service.private_key.clone(),
        region_alias: region.alias.clone(),
        public_url: urls.http.clone(),
        endpoint_url_scheme: region.endpoint_url_scheme.clone(),
        debugger_url_scheme: region.debugger_url_scheme.clone(),
        user_environment,
    })
    .and_then(|gen| gen.spawn());
    let mut app = match launched {
        Ok(app) => app,
        Err(e) => {
            proxy_stop.cancel();
            let _ = proxy.await;
            return Err(cleanup(api, &name, &options, SessionError::Launch(e)).await);
        }
    };

    let proxy_failure = tokio::select! {
        () = shutdown.cancelled() => {
            info!("shutting down debug session");
            None
        }
        joined = &mut proxy => match joined {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                error!("failed to run local debug proxy: {e}");
                Some(e)
            }
            Err(e) => Some(ProxyError::Task(e.to_string())),
        },
    };

    if let Err(e) = app.kill_tree().await {
        error!("failed to kill debug process: {e}");
    }
    proxy_stop.cancel();
    if !proxy.is_finished() {
        let _ = proxy.await;
    }

    api.delete_debug_service(&name, options.preserve_data)
        .await
        .map_err(SessionError::Remove)?;
    info!("debugger removed");

    match proxy_failure {
        Some(e) => Err(SessionError::Proxy(e)),
        None => Ok(()),
    }
}

async fn deploy_debug_server(
    api: &dyn DebugServiceApi,
    options: &SessionOptions,
) -> Result<DeployResponse, SessionError> {
    let request = DeployRequest {
        region: options.region.clone(),
        application_id: options.application_id.clone(),
        name: options.name.clone(),
    };
    let service = api
        .deploy_debug_service(&request)
        .await
        .map_err(SessionError::Deploy)?;

    if let Err(e) =
        wait_for_service_ready(api, &service.service_name, &options.ready_intervals).await
    {
        let err = SessionError::Deploy(Box::new(e));
        return Err(cleanup(api, &service.service_name, options, err).await);
    }
    info!(service_name = %service.service_name, "debug server deployed");
    Ok(service)
}

/// Remove the service after a failed step. The removal error, if any, wins.
async fn cleanup(
    api: &dyn DebugServiceApi,
    service_name: &str,
    options: &SessionOptions,
    cause: SessionError,
) -> SessionError {
    match api
        .delete_debug_service(service_name, options.preserve_data)
        .await
    {
        Ok(()) => cause,
        Err(e) => {
            warn!("{cause}");
            SessionError::Remove(e)
        }
    }
}
