//! xlang-proxy daemon
//!
//! # Usage
//!
//! ```bash
//! xlang-proxy serve --listen 127.0.0.1:4389
//! xlang-proxy serve --config ./proxy.toml --websocket-listen 127.0.0.1:4390
//! xlang-proxy check-config
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use xlang_proxy::cli::{Cli, Command, ServeArgs};
use xlang_proxy::{spawn_reaper, Proxy, ProxyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve(args) => serve(config, args).await,
        Command::CheckConfig => {
            print!("{}", config.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ProxyConfig> {
    let config = match path {
        Some(path) => ProxyConfig::load_from(path),
        None => ProxyConfig::load(),
    };
    config.context("failed to load configuration")
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("xlang_proxy={}", level).parse()?),
        )
        .init();
    Ok(())
}

async fn serve(mut config: ProxyConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(addr) = args.websocket_listen {
        config.websocket_listen = Some(addr);
    }
    if let Some(secs) = args.idle_timeout {
        config.sessions.idle_timeout_secs = secs;
    }
    if args.quiet_errors {
        config.logging.log_tracked_errors = false;
    }
    config.validate()?;
    init_tracing(&config.logging.level)?;

    let proxy = Arc::new(Proxy::from_config(&config));
    if config.backends.is_empty() {
        tracing::warn!("No backends configured; every initialize will fail");
    }

    let reaper = spawn_reaper(
        proxy.registry().clone(),
        config.sessions.reap_interval(),
        config.sessions.idle_timeout(),
    );

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let mut lsp = tokio::spawn(proxy.clone().serve(listener));

    let websocket = match &config.websocket_listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {}", addr))?;
            Some(tokio::spawn(proxy.clone().serve_websocket(listener)))
        }
        None => None,
    };

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down");
            signal.context("failed to listen for interrupt")
        }
        served = &mut lsp => {
            match served {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("listener failed")),
                Err(e) => Err(anyhow::Error::new(e).context("listener task failed")),
            }
        }
    };

    lsp.abort();
    if let Some(websocket) = websocket {
        websocket.abort();
    }
    reaper.abort();
    proxy.shutdown().await;
    outcome
}
