//! External-process scanner backend
//!
//! The payload is written to the child's stdin. Exit code 0 is clean, a
//! configured match code is a finding, anything else is `Unavailable`.
//! Scanner output never leaves this module: it may quote the secret.

use crate::config::ProcessScannerConfig;
use crate::error::{Error, Result};
use crate::scanner::{Finding, ScanVerdict, SecretScanner};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Scanner that shells out to an external binary
pub struct ProcessScanner {
    command: String,
    args: Vec<String>,
    match_exit_codes: Vec<i32>,
}

impl ProcessScanner {
    /// Create a new process scanner
    pub fn new(command: impl Into<String>, args: Vec<String>, match_exit_codes: Vec<i32>) -> Self {
        Self {
            command: command.into(),
            args,
            match_exit_codes,
        }
    }

    pub fn from_config(config: &ProcessScannerConfig) -> Result<Self> {
        if config.command.trim().is_empty() {
            return Err(Error::Config(
                "scanner.process.command must not be empty".to_string(),
            ));
        }
        if config.match_exit_codes.contains(&0) {
            return Err(Error::Config(
                "scanner.process.match_exit_codes must not contain 0".to_string(),
            ));
        }
        Ok(Self::new(
            config.command.clone(),
            config.args.clone(),
            config.match_exit_codes.clone(),
        ))
    }

    async fn run(&self, data: &[u8]) -> Result<std::process::Output> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Scanner(format!("Failed to spawn {}: {}", self.command, e)))?;

        // Feed stdin while draining stdout and stderr, so a scanner that
        // writes before it reads cannot fill its pipes and stall.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok::<(), std::io::Error>(());
            };
            stdin.write_all(data).await?;
            stdin.shutdown().await
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        match fed {
            Ok(()) => {}
            // Scanner decided before reading everything; its exit code still counts
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(Error::Scanner(format!("Failed to write to scanner: {}", e))),
        }
        output.map_err(|e| Error::Scanner(format!("Scanner process failed: {}", e)))
    }
}

#[async_trait]
impl SecretScanner for ProcessScanner {
    async fn scan(&self, data: &[u8]) -> ScanVerdict {
        let output = match self.run(data).await {
            Ok(output) => output,
            Err(e) => return ScanVerdict::Unavailable(e.to_string()),
        };

        match output.status.code() {
            Some(0) => ScanVerdict::Clean,
            Some(code) if self.match_exit_codes.contains(&code) => {
                tracing::debug!(
                    command = %self.command,
                    code,
                    report_bytes = output.stdout.len(),
                    "External scanner reported a finding"
                );
                ScanVerdict::Match(vec![Finding {
                    rule: self.command.clone(),
                    redacted: "[REDACTED]".to_string(),
                    start: 0,
                    end: 0,
                    backend: "process".to_string(),
                }])
            }
            Some(code) => {
                tracing::warn!(
                    command = %self.command,
                    code,
                    stderr_bytes = output.stderr.len(),
                    "External scanner failed"
                );
                ScanVerdict::Unavailable(format!("{} exited with {}", self.command, code))
            }
            None => ScanVerdict::Unavailable(format!("{} killed by signal", self.command)),
        }
    }

    fn name(&self) -> &str {
        "process"
    }
}
