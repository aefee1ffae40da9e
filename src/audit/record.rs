//! Decision records and hash chaining

use crate::command::Category;
use crate::error::{Error, Result};
use crate::verdict::{DenyReason, Verdict, VerdictKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first record
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What was decided on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    /// A git or gh invocation
    Command {
        program: String,
        args: Vec<String>,
        cwd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verb: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<Category>,
    },
    /// An intercepted HTTP request
    Request {
        method: String,
        scheme: String,
        host: String,
        port: u16,
        /// Path only; queries can carry the very secrets that were denied
        path: String,
    },
}

/// One persisted decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub id: String,
    /// Position in the log, starting at 0
    pub sequence: u64,
    /// Unix milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub session_id: Option<String>,
    pub subject: Subject,
    pub verdict: VerdictKind,
    #[serde(default)]
    pub reason_code: Option<DenyReason>,
    /// Denial message or warning text
    #[serde(default)]
    pub reason: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

impl DecisionRecord {
    /// Build an unchained record; `sequence`, `prev_hash` and `hash` are
    /// filled in by [`DecisionRecord::chain`].
    pub fn new(session_id: Option<String>, subject: Subject, verdict: &Verdict) -> Self {
        let reason = match verdict {
            Verdict::Allow => None,
            Verdict::AllowWithWarning { warning } => Some(warning.clone()),
            Verdict::Deny { message, .. } => Some(message.clone()),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
            session_id,
            subject,
            verdict: verdict.kind(),
            reason_code: verdict.deny_reason(),
            reason,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    /// Link this record after (`sequence`, `prev_hash`).
    pub fn chain(&mut self, sequence: u64, prev_hash: &str) -> Result<()> {
        self.sequence = sequence;
        self.prev_hash = prev_hash.to_string();
        self.hash = self.compute_hash()?;
        Ok(())
    }

    /// SHA-256 over the record's JSON with an empty `hash` field.
    pub fn compute_hash(&self) -> Result<String> {
        let mut unhashed = self.clone();
        unhashed.hash = String::new();
        let bytes = serde_json::to_vec(&unhashed)?;
        Ok(hex(&Sha256::digest(&bytes)))
    }

    pub fn is_deny(&self) -> bool {
        self.verdict == VerdictKind::Deny
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Check sequence numbers, links and hashes of a contiguous run of
/// records. Returns the number of records checked.
pub fn verify_chain<'a>(records: impl IntoIterator<Item = &'a DecisionRecord>) -> Result<usize> {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut expected_seq = 0u64;
    let mut count = 0;

    for record in records {
        if record.sequence != expected_seq {
            return Err(Error::Audit(format!(
                "sequence gap: expected {}, found {}",
                expected_seq, record.sequence
            )));
        }
        if record.prev_hash != expected_prev {
            return Err(Error::Audit(format!(
                "record {} does not link to its predecessor",
                record.sequence
            )));
        }
        if record.compute_hash()? != record.hash {
            return Err(Error::Audit(format!(
                "record {} has been modified",
                record.sequence
            )));
        }
        expected_prev = record.hash.clone();
        expected_seq += 1;
        count += 1;
    }
    Ok(count)
}
