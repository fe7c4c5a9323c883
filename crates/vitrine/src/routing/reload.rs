//! Proxy reload signal.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use std::process::Stdio;
use tokio::process::Command;

/// Tells the proxy that the routing document changed.
#[async_trait]
pub trait ProxyReloader: Send + Sync {
    async fn reload(&self) -> Result<()>;
}

/// The proxy watches the file itself.
#[derive(Debug, Clone, Default)]
pub struct NoopReloader;

#[async_trait]
impl ProxyReloader for NoopReloader {
    async fn reload(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs a configured command, e.g. `docker kill -s HUP traefik`.
#[derive(Debug, Clone)]
pub struct CommandReloader {
    program: String,
    args: Vec<String>,
}

impl CommandReloader {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a `[program, args...]` list; `None` if it is empty.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl ProxyReloader for CommandReloader {
    async fn reload(&self) -> Result<()> {
        debug!("Reloading proxy: {} {:?}", self.program, self.args);
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running reload command {}", self.program))?;

        if !output.status.success() {
            bail!(
                "reload command {} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
