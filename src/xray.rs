//! The managed xray process
//!
//! The live configuration is rendered from the enabled inbounds in the store.
//! A restart rewrites the config file and replaces the running process.

use crate::config::XrayConfig;
use crate::db::{Database, Inbound};
use crate::restart::ManagedProxy;
use crate::settings::{InboundSettings, Protocol, Sniffing, StreamSettings};
use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct RenderedConfig<'a> {
    log: LogSection<'a>,
    inbounds: Vec<RenderedInbound<'a>>,
    outbounds: [Outbound; 2],
}

#[derive(Serialize)]
struct LogSection<'a> {
    loglevel: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderedInbound<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    listen: Option<&'a str>,
    port: u16,
    protocol: Protocol,
    settings: &'a InboundSettings,
    stream_settings: &'a StreamSettings,
    sniffing: &'a Sniffing,
    tag: &'a str,
}

impl<'a> From<&'a Inbound> for RenderedInbound<'a> {
    fn from(inbound: &'a Inbound) -> Self {
        Self {
            listen: Some(inbound.listen.as_str()).filter(|l| !l.is_empty()),
            port: inbound.port,
            protocol: inbound.protocol,
            settings: &inbound.settings,
            stream_settings: &inbound.stream_settings,
            sniffing: &inbound.sniffing,
            tag: &inbound.tag,
        }
    }
}

#[derive(Serialize)]
struct Outbound {
    protocol: &'static str,
    tag: &'static str,
}

const OUTBOUNDS: [Outbound; 2] = [
    Outbound {
        protocol: "freedom",
        tag: "direct",
    },
    Outbound {
        protocol: "blackhole",
        tag: "blocked",
    },
];

/// Render the proxy configuration for a set of inbounds
pub fn render_config(log_level: &str, inbounds: &[Inbound]) -> anyhow::Result<Vec<u8>> {
    let config = RenderedConfig {
        log: LogSection { loglevel: log_level },
        inbounds: inbounds.iter().map(RenderedInbound::from).collect(),
        outbounds: OUTBOUNDS,
    };
    serde_json::to_vec_pretty(&config).context("Failed to render xray config")
}

/// Replace `path` with `contents` without exposing a partially written file
pub fn write_config(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create config directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub struct XrayProcess {
    config: XrayConfig,
    db: Database,
    child: Mutex<Option<Child>>,
}

impl XrayProcess {
    pub fn new(config: XrayConfig, db: Database) -> Self {
        Self {
            config,
            db,
            child: Mutex::new(None),
        }
    }

    /// Start the process if it is not already running
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                debug!("xray already running");
                return Ok(());
            }
        }
        *slot = Some(self.launch().await?);
        Ok(())
    }

    /// Stop the process, waiting up to the grace period before killing it
    pub async fn stop(&self) {
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            self.terminate(&mut child).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    /// Write the config for the currently enabled inbounds
    pub fn write_current_config(&self) -> anyhow::Result<usize> {
        let inbounds = self.db.list_enabled_inbounds()?;
        let rendered = render_config(&self.config.log_level, &inbounds)?;
        write_config(Path::new(&self.config.config_path), &rendered)?;
        debug!(
            path = %self.config.config_path,
            inbounds = inbounds.len(),
            "Wrote xray config"
        );
        Ok(inbounds.len())
    }

    async fn launch(&self) -> anyhow::Result<Child> {
        self.write_current_config()?;

        let args = self.config.effective_args();
        info!(command = %self.config.command, ?args, "Starting xray");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.command))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, true));
        }

        tokio::time::sleep(self.config.startup_check()).await;
        if let Some(status) = child.try_wait()? {
            anyhow::bail!("xray exited during startup with {}", status);
        }

        info!(pid = child.id().unwrap_or(0), "xray started");
        Ok(child)
    }

    async fn terminate(&self, child: &mut Child) {
        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to xray");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "xray exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for xray to exit");
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

#[async_trait]
impl ManagedProxy for XrayProcess {
    async fn restart(&self) -> anyhow::Result<()> {
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            self.terminate(&mut child).await;
        }
        *slot = Some(self.launch().await?);
        Ok(())
    }
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(target: "xray", "{}", line);
        } else {
            info!(target: "xray", "{}", line);
        }
    }
}
