#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # vcr-debug
//!
//! Runs an application locally against its cloud debug service.
//!
//! ## Subcommands
//!
//! - `vcr-debug run [PATH]` (default): start the debugger proxy, launch the
//!   app from `[app] entrypoint` in PATH, and tear both down on Ctrl+C
//! - `vcr-debug proxy`: run only the tunnel and the local gateway, for an app
//!   started by other means
//!
//! ## Ports
//!
//! | Port            | Default | Who listens                             |
//! |-----------------|---------|-----------------------------------------|
//! | `app_port`      | 3000    | the developer's app                     |
//! | `debugger_port` | 3001    | gateway for calls to remote providers   |

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vcr_debug::config::Config;
use vcr_debug::gateway::{start_debug_proxy_server, ProxySettings};
use vcr_debug::session::{relay_urls, run_debug_session};
use vcr_debug::tunnel::TunnelSettings;

/// Run your application locally in debug mode with live cloud integration.
#[derive(Parser)]
#[command(name = "vcr-debug", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the debugger and the app (default when no subcommand given).
    Run(RunArgs),
    /// Run only the tunnel and the local gateway.
    Proxy(ProxyArgs),
}

#[derive(Args, Default)]
struct RunArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Trace every tunnel message.
    #[arg(short, long)]
    verbose: bool,
    /// Local port your application listens on.
    #[arg(short, long)]
    app_port: Option<u16>,
    /// Local port for the debugger gateway.
    #[arg(short, long)]
    debugger_port: Option<u16>,
    /// Keep debug session data after stopping.
    #[arg(long)]
    preserve_data: bool,
    /// Project directory (overrides `[app] working_dir`).
    path: Option<PathBuf>,
}

#[derive(Args)]
struct ProxyArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Trace every tunnel message.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(args)) => run(args).await,
        Some(Commands::Proxy(args)) => proxy(args).await,
        None => run(cli.run).await,
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if args.verbose {
        config.debugger.verbose = true;
    }
    if let Some(port) = args.app_port {
        config.debugger.app_port = port;
    }
    if let Some(port) = args.debugger_port {
        config.debugger.debugger_port = port;
    }
    if args.preserve_data {
        config.debugger.preserve_data = true;
    }
    if let Some(path) = args.path {
        config.app.working_dir = path;
    }
    config.app.working_dir = std::fs::canonicalize(&config.app.working_dir).with_context(|| {
        format!(
            "failed to get absolute path of {:?}",
            config.app.working_dir.display()
        )
    })?;

    init_tracing(&config);
    info!("vcr-debug v{} starting", env!("CARGO_PKG_VERSION"));

    let service = config.pre_deployed_service();
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    run_debug_session(&service, &service, config.session_options(), shutdown).await?;
    info!("Goodbye");
    Ok(())
}

async fn proxy(args: ProxyArgs) -> anyhow::Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if args.verbose {
        config.debugger.verbose = true;
    }
    init_tracing(&config);

    if config.service.service_name.is_empty() {
        bail!("service.service_name is not configured");
    }
    let urls = relay_urls(
        &config.service.service_name,
        &config.region.host_template,
        &config.service.websocket_path,
    )
    .context("failed to get http and websocket urls")?;
    let options = config.session_options();

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    start_debug_proxy_server(
        ProxySettings {
            app_name: config.service.service_name.clone(),
            host_address: urls.http,
            debugger_port: options.debugger_port,
            shutdown_grace: options.shutdown_grace,
            remote_request_timeout: options.remote_request_timeout,
            tunnel: TunnelSettings {
                relay_url: urls.websocket,
                proxy_url: urls.proxy_websocket,
                local_app_host: format!("http://{}:{}", options.app_host, options.app_port),
                verbose: options.verbose,
            },
        },
        shutdown,
    )
    .await?;
    info!("Goodbye");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
    shutdown.cancel();
}
