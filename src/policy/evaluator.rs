//! Two-stage traffic policy
//!
//! ```text
//! TrafficRequest ─► route rules ─► domain rules ─► default action
//!                       │ deny         │ deny           │ deny
//!                       ▼              ▼                ▼
//!                  blocked-route  blocked-domain   blocked-domain
//!
//!          allow ─► content scan ─► clean ⇒ ALLOW
//!                                   match ⇒ DENY secret-match
//!                                   unavailable ⇒ DENY scanner-unavailable
//! ```

use super::domain::{RuleAction, RuleMatch};
use super::store::{PolicySnapshot, PolicyStore};
use crate::scanner::{BoundedScanner, ScanVerdict};
use crate::traffic::request::{percent_decode, TrafficRequest};
use crate::verdict::{DenyReason, Verdict};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Shortest run of base64 alphabet worth decoding
const MIN_BASE64_LEN: usize = 16;

/// Decides every intercepted request.
#[derive(Clone)]
pub struct TrafficPolicy {
    store: Arc<PolicyStore>,
    scanner: BoundedScanner,
}

impl TrafficPolicy {
    /// Create a new traffic policy
    pub fn new(store: Arc<PolicyStore>, scanner: BoundedScanner) -> Self {
        Self { store, scanner }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Evaluate one request. Nothing in here degrades into an allow.
    pub async fn evaluate(&self, request: &TrafficRequest) -> Verdict {
        let snapshot = self.store.snapshot();

        let body = (!is_content_encoded(request)).then_some(&request.body[..]);
        match snapshot
            .table
            .decide(&request.method, &request.host, &request.path, body)
        {
            RuleMatch::Route {
                action: RuleAction::Deny,
                label,
            } => {
                return Verdict::deny(
                    DenyReason::BlockedRoute,
                    format!(
                        "{} {}{} is blocked ({})",
                        request.method, request.host, request.path, label
                    ),
                );
            }
            RuleMatch::Domain {
                action: RuleAction::Deny,
                label,
            } => {
                return Verdict::deny(
                    DenyReason::BlockedDomain,
                    format!("{} is blocked by domain rule '{}'", request.host, label),
                );
            }
            RuleMatch::Default(RuleAction::Deny) => {
                return Verdict::deny(
                    DenyReason::BlockedDomain,
                    format!("{} is not on the allow list", request.host),
                );
            }
            _ => {}
        }

        let payload = content_payload(request, &snapshot);
        match self.scanner.scan(&payload).await {
            ScanVerdict::Clean => Verdict::Allow,
            verdict @ ScanVerdict::Match(_) => Verdict::deny(
                DenyReason::SecretMatch,
                format!(
                    "request to {} contains credential-shaped content ({})",
                    request.host,
                    verdict.summary()
                ),
            ),
            ScanVerdict::Unavailable(reason) => Verdict::deny(
                DenyReason::ScannerUnavailable,
                format!("secret scanner unavailable: {}", reason),
            ),
        }
    }
}

/// Whether the body is compressed or otherwise not readable as sent.
fn is_content_encoded(request: &TrafficRequest) -> bool {
    request
        .headers
        .get_str("content-encoding")
        .is_some_and(|encoding| !encoding.is_empty() && !encoding.eq_ignore_ascii_case("identity"))
}

/// Everything the session controls in one buffer, newline separated:
/// non-exempt headers, path, query (raw and decoded), body, then decoded
/// base64 runs found in any of those.
fn content_payload(request: &TrafficRequest, snapshot: &PolicySnapshot) -> Vec<u8> {
    let mut payload = Vec::with_capacity(request.body.len() + 512);

    for (name, value) in request.headers.iter() {
        if snapshot.table.is_exempt(&request.host, name) {
            continue;
        }
        payload.extend_from_slice(name.as_bytes());
        payload.extend_from_slice(b": ");
        payload.extend_from_slice(value);
        payload.push(b'\n');
    }

    payload.extend_from_slice(request.path.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(&percent_decode(&request.path));
    payload.push(b'\n');

    if let Some(query) = &request.query {
        payload.extend_from_slice(query.as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(&percent_decode(query));
        payload.push(b'\n');
    }

    payload.extend_from_slice(&request.body);

    if snapshot.decode_base64 {
        let decoded = decode_base64_runs(&payload);
        if !decoded.is_empty() {
            payload.push(b'\n');
            payload.extend_from_slice(&decoded);
        }
    }

    payload
}

fn base64_run() -> Option<&'static Regex> {
    static RUN: OnceLock<Option<Regex>> = OnceLock::new();
    RUN.get_or_init(|| {
        Regex::new(&format!("[A-Za-z0-9+/_-]{{{},}}={{0,2}}", MIN_BASE64_LEN)).ok()
    })
    .as_ref()
}

/// Decode every base64-looking run in `data`, in either alphabet.
fn decode_base64_runs(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let Some(re) = base64_run() else {
        return out;
    };
    let text = String::from_utf8_lossy(data);

    for run in re.find_iter(&text) {
        let run = run.as_str();
        let decoded = [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(run).ok());
        if let Some(bytes) = decoded {
            out.extend_from_slice(&bytes);
            out.push(b'\n');
        }
    }
    out
}
