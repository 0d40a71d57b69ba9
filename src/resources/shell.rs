//! Shell collaborator: run an external program and capture its output.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::HarvestError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
    /// `stdout` holds base64 of output that was not UTF-8.
    #[serde(default)]
    pub is_base64: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Keep program output intact, base64-encoding it when it is not UTF-8.
    pub fn set_stdout(&mut self, bytes: Vec<u8>) {
        match String::from_utf8(bytes) {
            Ok(text) => {
                self.stdout = text;
                self.is_base64 = false;
            }
            Err(err) => {
                self.stdout = base64::engine::general_purpose::STANDARD.encode(err.into_bytes());
                self.is_base64 = true;
            }
        }
    }
}

#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<ShellOutput>;
}

/// Runs programs with `tokio::process`, killing them on timeout.
pub struct ProcessRunner;

#[async_trait]
impl ShellRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<ShellOutput> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start '{}'", program))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.with_context(|| format!("Failed to run '{}'", program))?,
            Err(_) => {
                return Err(HarvestError::TransientFetch {
                    uri: program.to_string(),
                    reason: format!("timed out after {}s", timeout.as_secs()),
                }
                .into())
            }
        };

        let mut shell_output = ShellOutput {
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status.code().unwrap_or(-1),
            ..Default::default()
        };
        shell_output.set_stdout(output.stdout);
        Ok(shell_output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let output = ProcessRunner
            .run("echo", &["hello".to_string()], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn keeps_binary_stdout() {
        let output = ProcessRunner
            .run(
                "printf",
                &["\\211PNG\\r\\n\\032\\n".to_string()],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(output.is_base64);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&output.stdout)
            .unwrap();
        assert_eq!(bytes, b"\x89PNG\r\n\x1a\n");
    }

    #[tokio::test]
    async fn reports_non_zero_exit() {
        let output = ProcessRunner
            .run("sh", &["-c".to_string(), "exit 3".to_string()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.status, 3);
    }
}
