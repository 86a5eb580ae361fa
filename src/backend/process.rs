//! Backends as child processes speaking JSON-RPC on stdio

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{BackendIo, BackendLauncher};
use crate::config::BackendCommand;
use crate::error::{ProxyError, Result};
use crate::session::SessionKey;

/// Launches the configured command for a session's mode
///
/// The workspace is passed to the backend in `initialize`; the environment
/// additionally carries `XLANG_MODE` and `XLANG_ROOT` for wrappers that
/// need them before the handshake.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    commands: BTreeMap<String, BackendCommand>,
}

impl ProcessLauncher {
    pub fn new(commands: BTreeMap<String, BackendCommand>) -> Self {
        Self { commands }
    }

    /// Modes with a configured backend
    pub fn modes(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn launch(&self, key: &SessionKey) -> Result<BackendIo> {
        let configured = self
            .commands
            .get(&key.mode)
            .ok_or_else(|| ProxyError::UnknownMode {
                mode: key.mode.clone(),
            })?;
        let spawn_error = |message: String| ProxyError::Spawn {
            mode: key.mode.clone(),
            message,
        };

        let mut child = Command::new(&configured.command)
            .args(&configured.args)
            .envs(&configured.env)
            .env("XLANG_MODE", &key.mode)
            .env("XLANG_ROOT", key.root.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(format!("{}: {}", configured.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let label = key.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "xlang_proxy::backend", "[{}] {}", label, line);
                }
            });
        }

        tracing::info!(
            "Spawned {} backend (pid {:?}) for {}",
            key.mode,
            child.id(),
            key.root
        );

        Ok(BackendIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}
