//! The debug-bridge contract. `DeviceBridge` implementations wrap the
//! platform's CLI debug tool (adb or equivalent); the core only ever
//! calls through this trait, never spawns a device subprocess directly.
//!
//! Grounded in the event recorder's own subprocess usage (spawn `adb`,
//! pipe stdout, read lines) generalized into a small async trait so the
//! recorder/player/ui modules depend on an interface, not a binary path.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// A handle to a line stream from a long-running subprocess, plus a way
/// to tear it down. `StreamLines` callers poll `rx` and call `kill()` on
/// cancellation.
pub struct LineStream {
    pub rx: mpsc::Receiver<String>,
    child: Child,
}

impl LineStream {
    pub async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

/// `Exec(deviceID, args) -> bytes`, `StreamLines(deviceID, args) -> chan string`,
/// `Push/Pull(local, remote)` — the entire surface the core needs from the
/// bridge. Implementations run against the actual platform tool.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    async fn exec(&self, device_id: &str, args: &[&str]) -> CoreResult<Vec<u8>>;

    async fn stream_lines(&self, device_id: &str, args: &[&str]) -> CoreResult<LineStream>;

    async fn push(&self, device_id: &str, local: &str, remote: &str) -> CoreResult<()>;

    async fn pull(&self, device_id: &str, remote: &str, local: &str) -> CoreResult<()>;
}

/// Default `DeviceBridge` backed by an external `adb`-compatible binary.
pub struct AdbBridge {
    binary: String,
}

impl AdbBridge {
    pub fn new(binary: impl Into<String>) -> Self {
        AdbBridge { binary: binary.into() }
    }
}

impl Default for AdbBridge {
    fn default() -> Self {
        AdbBridge::new("adb")
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn exec(&self, device_id: &str, args: &[&str]) -> CoreResult<Vec<u8>> {
        let output = Command::new(&self.binary)
            .arg("-s")
            .arg(device_id)
            .args(args)
            .output()
            .await
            .map_err(|e| CoreError::transient(format!("spawn {} failed: {e}", self.binary), 1))?;

        if !output.status.success() {
            return Err(CoreError::transient(
                String::from_utf8_lossy(&output.stderr).into_owned(),
                1,
            )
            .with_context("exit_code", output.status.code().unwrap_or(-1).to_string()));
        }
        Ok(output.stdout)
    }

    async fn stream_lines(&self, device_id: &str, args: &[&str]) -> CoreResult<LineStream> {
        let mut child = Command::new(&self.binary)
            .arg("-s")
            .arg(device_id)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CoreError::transient(format!("spawn {} failed: {e}", self.binary), 1))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::transient("no stdout handle", 1))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        Ok(LineStream { rx, child })
    }

    async fn push(&self, device_id: &str, local: &str, remote: &str) -> CoreResult<()> {
        self.exec(device_id, &["push", local, remote]).await?;
        Ok(())
    }

    async fn pull(&self, device_id: &str, remote: &str, local: &str) -> CoreResult<()> {
        // pull is a top-level adb subcommand, not routed through `exec`'s
        // `-s <device> <args>` shape for remote/local positional args.
        let output = Command::new(&self.binary)
            .arg("-s")
            .arg(device_id)
            .arg("pull")
            .arg(remote)
            .arg(local)
            .output()
            .await
            .map_err(|e| CoreError::transient(format!("spawn {} failed: {e}", self.binary), 1))?;
        if !output.status.success() {
            return Err(CoreError::transient(
                String::from_utf8_lossy(&output.stderr).into_owned(),
                1,
            ));
        }
        Ok(())
    }
}
