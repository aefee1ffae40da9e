//! Append-only decision log
//!
//! ```text
//! engines ──record()──► mpsc ──► writer task ──► decisions.jsonl
//!                                    │
//!                                    ├──► recent window (queries)
//!                                    └──► broadcast (live subscribers)
//! ```
//!
//! A single writer task owns the chain head, so sequence numbers and
//! hash links are assigned in one place.

use super::record::{verify_chain, DecisionRecord, Subject, GENESIS_HASH};
use crate::config::AuditConfig;
use crate::error::{Error, Result};
use crate::verdict::{Verdict, VerdictKind};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

const CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_QUERY_LIMIT: usize = 100;

/// Filter for [`DecisionLog::recent`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionQuery {
    pub session: Option<String>,
    pub verdict: Option<VerdictKind>,
    pub limit: Option<usize>,
}

enum LogCommand {
    Record {
        record: Box<DecisionRecord>,
        ack: oneshot::Sender<Result<()>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Chain head carried by the writer task
struct Head {
    sequence: u64,
    hash: String,
}

/// The decision log handle shared by both engines and the API.
pub struct DecisionLog {
    tx: mpsc::Sender<LogCommand>,
    events: broadcast::Sender<DecisionRecord>,
    recent: Arc<RwLock<VecDeque<DecisionRecord>>>,
    path: Option<PathBuf>,
}

impl DecisionLog {
    /// Open the configured log, resuming the chain from the last record on
    /// disk.
    pub async fn open(config: &AuditConfig) -> Result<Arc<Self>> {
        let mut window = VecDeque::with_capacity(config.recent_capacity);
        let mut head = Head {
            sequence: 0,
            hash: GENESIS_HASH.to_string(),
        };

        let file = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        Error::Audit(format!(
                            "Failed to create audit directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }

                let existing = read_records(path).await?;
                if let Some(last) = existing.last() {
                    head = Head {
                        sequence: last.sequence + 1,
                        hash: last.hash.clone(),
                    };
                }
                let skip = existing.len().saturating_sub(config.recent_capacity);
                window.extend(existing.into_iter().skip(skip));

                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| {
                        Error::Audit(format!("Failed to open {}: {}", path.display(), e))
                    })?;
                tracing::info!(
                    path = %path.display(),
                    next_sequence = head.sequence,
                    "Decision log opened"
                );
                Some(file)
            }
            None => None,
        };

        Ok(Self::spawn(
            file,
            head,
            window,
            config.recent_capacity,
            config.broadcast_capacity,
            config.path.clone(),
        ))
    }

    /// A log that is never written to disk.
    pub fn in_memory(capacity: usize) -> Arc<Self> {
        Self::spawn(
            None,
            Head {
                sequence: 0,
                hash: GENESIS_HASH.to_string(),
            },
            VecDeque::with_capacity(capacity),
            capacity,
            256,
            None,
        )
    }

    fn spawn(
        file: Option<tokio::fs::File>,
        head: Head,
        window: VecDeque<DecisionRecord>,
        capacity: usize,
        broadcast_capacity: usize,
        path: Option<PathBuf>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(broadcast_capacity.max(1));
        let recent = Arc::new(RwLock::new(window));

        tokio::spawn(writer(
            rx,
            file,
            head,
            recent.clone(),
            capacity.max(1),
            events.clone(),
        ));

        Arc::new(Self {
            tx,
            events,
            recent,
            path,
        })
    }

    /// Append a decision. Resolves once the record is written.
    pub async fn record(
        &self,
        session_id: Option<String>,
        subject: Subject,
        verdict: &Verdict,
    ) -> Result<()> {
        let (ack, done) = oneshot::channel();
        let record = Box::new(DecisionRecord::new(session_id, subject, verdict));
        self.tx
            .send(LogCommand::Record { record, ack })
            .await
            .map_err(|_| Error::Audit("decision log writer has stopped".to_string()))?;
        done.await
            .map_err(|_| Error::Audit("decision log writer has stopped".to_string()))?
    }

    /// Wait until everything submitted so far has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Live feed of new records.
    pub fn subscribe(&self) -> broadcast::Receiver<DecisionRecord> {
        self.events.subscribe()
    }

    /// Most recent decisions first.
    pub async fn recent(&self, query: &DecisionQuery) -> Vec<DecisionRecord> {
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let recent = self.recent.read().await;
        recent
            .iter()
            .rev()
            .filter(|r| {
                query
                    .session
                    .as_ref()
                    .map_or(true, |s| r.session_id.as_deref() == Some(s.as_str()))
            })
            .filter(|r| query.verdict.map_or(true, |v| r.verdict == v))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

async fn writer(
    mut rx: mpsc::Receiver<LogCommand>,
    mut file: Option<tokio::fs::File>,
    mut head: Head,
    recent: Arc<RwLock<VecDeque<DecisionRecord>>>,
    capacity: usize,
    events: broadcast::Sender<DecisionRecord>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            LogCommand::Record { mut record, ack } => {
                let result = append(&mut record, &mut head, file.as_mut()).await;
                if result.is_ok() {
                    let record = *record;
                    {
                        let mut recent = recent.write().await;
                        if recent.len() >= capacity {
                            recent.pop_front();
                        }
                        recent.push_back(record.clone());
                    }
                    // No subscribers is fine
                    let _ = events.send(record);
                } else if let Err(e) = &result {
                    tracing::error!(error = %e, "Failed to append decision record");
                }
                let _ = ack.send(result);
            }
            LogCommand::Flush(done) => {
                if let Some(file) = file.as_mut() {
                    if let Err(e) = file.flush().await {
                        tracing::error!(error = %e, "Failed to flush decision log");
                    }
                }
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Decision log writer stopped");
}

async fn append(
    record: &mut DecisionRecord,
    head: &mut Head,
    file: Option<&mut tokio::fs::File>,
) -> Result<()> {
    record.chain(head.sequence, &head.hash)?;

    if let Some(file) = file {
        let mut line = serde_json::to_vec(&*record)?;
        line.push(b'\n');
        file.write_all(&line)
            .await
            .map_err(|e| Error::Audit(format!("Failed to write decision record: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| Error::Audit(format!("Failed to flush decision record: {}", e)))?;
    }

    head.sequence += 1;
    head.hash = record.hash.clone();
    Ok(())
}

/// Read every record from a JSON lines file; a missing file is empty.
pub async fn read_records(path: &Path) -> Result<Vec<DecisionRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::Audit(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                Error::Audit(format!("{}:{}: invalid record: {}", path.display(), n + 1, e))
            })
        })
        .collect()
}

/// Verify the chain stored in `path`.
pub async fn verify_file(path: &Path) -> Result<usize> {
    let records = read_records(path).await?;
    verify_chain(&records)
}
