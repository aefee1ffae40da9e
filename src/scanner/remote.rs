//! HTTP analysis-service scanner backend
//!
//! Posts the payload as a prompt to `{url}/analyze/prompt` and reads back
//! per-scanner scores. A score under the threshold is a finding; anything
//! other than a well-formed answer is `Unavailable`.

use crate::config::HttpScannerConfig;
use crate::error::{Error, Result};
use crate::scanner::{Finding, ScanVerdict, SecretScanner};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use zeroize::Zeroizing;

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    is_valid: Option<bool>,
    #[serde(default)]
    scanners: BTreeMap<String, f64>,
}

/// Scanner backed by an external analysis service
pub struct HttpScanner {
    client: reqwest::Client,
    endpoint: String,
    token: Option<Zeroizing<String>>,
    min_length: usize,
    score_threshold: f64,
}

impl HttpScanner {
    /// Create a new HTTP scanner
    pub fn new(url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/analyze/prompt", url.trim_end_matches('/')),
            token: token.map(Zeroizing::new),
            min_length: 10,
            score_threshold: 1.0,
        }
    }

    /// Build from configuration, resolving the token from the environment.
    pub fn from_config(config: &HttpScannerConfig) -> Result<Self> {
        let token = match &config.token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::Config(format!(
                    "Failed to resolve scanner token from env var: {}",
                    var
                ))
            })?),
            None => None,
        };

        let mut scanner = Self::new(&config.url, token);
        scanner.min_length = config.min_length;
        scanner.score_threshold = config.score_threshold;
        Ok(scanner)
    }

    fn interpret(&self, response: AnalyzeResponse) -> ScanVerdict {
        let Some(is_valid) = response.is_valid else {
            return ScanVerdict::Unavailable("response missing is_valid".to_string());
        };

        let flagged: Vec<Finding> = response
            .scanners
            .iter()
            .filter(|(_, score)| **score < self.score_threshold)
            .map(|(name, score)| Finding {
                rule: name.clone(),
                redacted: format!("score {:.2}", score),
                start: 0,
                end: 0,
                backend: "http".to_string(),
            })
            .collect();

        if !flagged.is_empty() {
            ScanVerdict::Match(flagged)
        } else if !is_valid {
            ScanVerdict::Match(vec![Finding {
                rule: "analysis_service".to_string(),
                redacted: "[REDACTED]".to_string(),
                start: 0,
                end: 0,
                backend: "http".to_string(),
            }])
        } else {
            ScanVerdict::Clean
        }
    }
}

#[async_trait]
impl SecretScanner for HttpScanner {
    async fn scan(&self, data: &[u8]) -> ScanVerdict {
        if data.len() < self.min_length {
            return ScanVerdict::Clean;
        }

        let prompt = String::from_utf8_lossy(data);
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "prompt": prompt }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.as_str());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Scanner service unreachable");
                return ScanVerdict::Unavailable(format!("request failed: {}", e));
            }
        };

        if !response.status().is_success() {
            return ScanVerdict::Unavailable(format!(
                "service returned HTTP {}",
                response.status()
            ));
        }

        match response.json::<AnalyzeResponse>().await {
            Ok(body) => self.interpret(body),
            Err(e) => ScanVerdict::Unavailable(format!("invalid response: {}", e)),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn response(body: &str) -> AnalyzeResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_interpret_scores() {
        let scanner = HttpScanner::new("http://scanner", None);

        let clean = response(r#"{"is_valid": true, "scanners": {"Secrets": 1.0}}"#);
        assert_eq!(scanner.interpret(clean), ScanVerdict::Clean);

        let flagged = response(r#"{"is_valid": false, "scanners": {"Secrets": 0.0}}"#);
        match scanner.interpret(flagged) {
            ScanVerdict::Match(findings) => assert_eq!(findings[0].rule, "Secrets"),
            other => panic!("expected match, got {:?}", other),
        }

        let missing = response(r#"{"scanners": {}}"#);
        assert!(matches!(
            scanner.interpret(missing),
            ScanVerdict::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_short_payload_skipped() {
        let scanner = HttpScanner::new("http://127.0.0.1:1", None);
        assert_eq!(scanner.scan(b"short").await, ScanVerdict::Clean);
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        let scanner = HttpScanner::new("http://127.0.0.1:1", None);
        assert!(matches!(
            scanner.scan(b"long enough payload to send").await,
            ScanVerdict::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_against_service() {
        let router = Router::new().route(
            "/analyze/prompt",
            post(|Json(body): Json<serde_json::Value>| async move {
                let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
                let score = if prompt.contains("ghp_") { 0.0 } else { 1.0 };
                Json(serde_json::json!({
                    "is_valid": score >= 1.0,
                    "scanners": { "Secrets": score }
                }))
            }),
        );
        let url = serve(router).await;
        let scanner = HttpScanner::new(&url, Some("t0ken".to_string()));

        assert_eq!(
            scanner.scan(b"just a normal commit message").await,
            ScanVerdict::Clean
        );
        assert!(matches!(
            scanner.scan(b"token ghp_1234567890abcdef").await,
            ScanVerdict::Match(_)
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let router = Router::new().route(
            "/analyze/prompt",
            post(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let url = serve(router).await;
        let scanner = HttpScanner::new(&url, None);
        assert!(matches!(
            scanner.scan(b"a payload of some length").await,
            ScanVerdict::Unavailable(_)
        ));
    }
}
