//! Secret scanner capability
//!
//! Both enforcement engines consult the same capability:
//! `scan(bytes) -> clean | match(findings) | unavailable`, always bounded
//! by a caller-enforced timeout.
//!
//! ## Architecture
//!
//! ```text
//! bytes → BoundedScanner (timeout) → CompositeScanner
//!                                       ├─ PatternScanner  (in-process regex)
//!                                       ├─ HttpScanner     (analysis service)
//!                                       └─ ProcessScanner  (external binary)
//! ```
//!
//! Only a unanimous `Clean` is clean. Any backend that errors, times out or
//! cannot be reached turns the whole scan into `Unavailable`, which both
//! engines treat as a denial.

pub mod patterns;
pub mod process;
pub mod remote;

pub use patterns::{default_secret_patterns, PatternScanner, PatternSet, SecretPattern};
pub use process::ProcessScanner;
pub use remote::HttpScanner;

use crate::config::{ScannerBackendKind, ScannerConfig};
use crate::error::{Error, Result};
use crate::policy::PolicyStore;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// A single credential finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Rule or scanner name that matched
    pub rule: String,
    /// Redacted form of the matched text
    pub redacted: String,
    /// Start byte offset in the scanned payload (0 when unknown)
    pub start: usize,
    /// End byte offset in the scanned payload (0 when unknown)
    pub end: usize,
    /// Which backend produced this finding
    pub backend: String,
}

/// Result of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    /// No credential-shaped content found
    Clean,
    /// At least one finding
    Match(Vec<Finding>),
    /// The scan could not be completed
    Unavailable(String),
}

impl ScanVerdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    /// Comma-separated rule names, for reasons and logs.
    pub fn summary(&self) -> String {
        match self {
            Self::Clean => "clean".to_string(),
            Self::Match(findings) => {
                let mut rules: Vec<&str> = findings.iter().map(|f| f.rule.as_str()).collect();
                rules.dedup();
                rules.join(", ")
            }
            Self::Unavailable(reason) => reason.clone(),
        }
    }
}

/// Pluggable scanning backend.
#[async_trait]
pub trait SecretScanner: Send + Sync {
    /// Scan a payload.
    async fn scan(&self, data: &[u8]) -> ScanVerdict;

    /// Human-readable name for this backend (used in logs and findings).
    fn name(&self) -> &str;
}

/// Chains several backends; the strictest verdict wins.
pub struct CompositeScanner {
    backends: Vec<Arc<dyn SecretScanner>>,
}

impl CompositeScanner {
    pub fn new(backends: Vec<Arc<dyn SecretScanner>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl SecretScanner for CompositeScanner {
    async fn scan(&self, data: &[u8]) -> ScanVerdict {
        if self.backends.is_empty() {
            return ScanVerdict::Unavailable("no scanner backends configured".to_string());
        }

        let mut findings = Vec::new();
        let mut unavailable = Vec::new();

        for backend in &self.backends {
            match backend.scan(data).await {
                ScanVerdict::Clean => {}
                ScanVerdict::Match(found) => findings.extend(found),
                ScanVerdict::Unavailable(reason) => {
                    unavailable.push(format!("{}: {}", backend.name(), reason))
                }
            }
        }

        if !findings.is_empty() {
            ScanVerdict::Match(findings)
        } else if !unavailable.is_empty() {
            ScanVerdict::Unavailable(unavailable.join("; "))
        } else {
            ScanVerdict::Clean
        }
    }

    fn name(&self) -> &str {
        "composite"
    }
}

/// The capability handed to the engines: a scanner plus its deadline.
#[derive(Clone)]
pub struct BoundedScanner {
    inner: Arc<dyn SecretScanner>,
    timeout: Duration,
}

impl BoundedScanner {
    pub fn new(inner: Arc<dyn SecretScanner>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Scan with the deadline applied; expiry is `Unavailable`.
    pub async fn scan(&self, data: &[u8]) -> ScanVerdict {
        match tokio::time::timeout(self.timeout, self.inner.scan(data)).await {
            Ok(verdict) => verdict,
            Err(_) => {
                tracing::warn!(
                    scanner = %self.inner.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Secret scan timed out"
                );
                ScanVerdict::Unavailable(format!(
                    "{} timed out after {}ms",
                    self.inner.name(),
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

/// Build the configured backend chain.
pub fn build_scanner(config: &ScannerConfig, store: Arc<PolicyStore>) -> Result<BoundedScanner> {
    let mut backends: Vec<Arc<dyn SecretScanner>> = Vec::new();

    for kind in &config.backends {
        match kind {
            ScannerBackendKind::Patterns => {
                backends.push(Arc::new(PatternScanner::live(store.clone())));
            }
            ScannerBackendKind::Http => {
                let http = config.http.as_ref().ok_or_else(|| {
                    Error::Config("scanner backend 'http' requires [scanner.http]".to_string())
                })?;
                backends.push(Arc::new(HttpScanner::from_config(http)?));
            }
            ScannerBackendKind::Process => {
                let process = config.process.as_ref().ok_or_else(|| {
                    Error::Config(
                        "scanner backend 'process' requires [scanner.process]".to_string(),
                    )
                })?;
                backends.push(Arc::new(ProcessScanner::from_config(process)?));
            }
        }
    }

    let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
    tracing::info!(backends = ?names, timeout_ms = config.timeout_ms, "Secret scanner ready");

    Ok(BoundedScanner::new(
        Arc::new(CompositeScanner::new(backends)),
        Duration::from_millis(config.timeout_ms),
    ))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn finding(rule: &str) -> Finding {
        Finding {
            rule: rule.to_string(),
            redacted: "[REDACTED]".to_string(),
            start: 0,
            end: 0,
            backend: "fixed".to_string(),
        }
    }

    #[tokio::test]
    async fn test_composite_all_clean() {
        let scanner = CompositeScanner::new(vec![
            Arc::new(FixedScanner(ScanVerdict::Clean)),
            Arc::new(PatternScanner::with_defaults().unwrap()),
        ]);
        assert_eq!(scanner.scan(b"nothing here").await, ScanVerdict::Clean);
    }

    #[tokio::test]
    async fn test_composite_unavailable_is_not_clean() {
        let scanner = CompositeScanner::new(vec![
            Arc::new(FixedScanner(ScanVerdict::Clean)),
            Arc::new(FixedScanner(ScanVerdict::Unavailable("down".to_string()))),
        ]);
        assert!(matches!(
            scanner.scan(b"nothing here").await,
            ScanVerdict::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_composite_match_wins() {
        let scanner = CompositeScanner::new(vec![
            Arc::new(FixedScanner(ScanVerdict::Unavailable("down".to_string()))),
            Arc::new(FixedScanner(ScanVerdict::Match(vec![finding("x")]))),
        ]);
        let verdict = scanner.scan(b"data").await;
        assert_eq!(verdict.summary(), "x");
    }

    #[tokio::test]
    async fn test_composite_empty_fails_closed() {
        let scanner = CompositeScanner::new(vec![]);
        assert!(matches!(
            scanner.scan(b"data").await,
            ScanVerdict::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_bounded_timeout_is_unavailable() {
        let scanner = BoundedScanner::new(Arc::new(HangingScanner), Duration::from_millis(20));
        let verdict = scanner.scan(b"data").await;
        match verdict {
            ScanVerdict::Unavailable(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected unavailable, got {:?}", other),
        }
    }
}
