//! Decision audit log
//!
//! Every verdict from either engine becomes a [`DecisionRecord`]: session,
//! subject, verdict, reason code and message, chained with SHA-256 so that
//! edits and deletions in the JSON lines file are detectable.

pub mod handler;
pub mod log;
pub mod record;

pub use handler::{audit_router, AuditState};
pub use log::{read_records, verify_file, DecisionLog, DecisionQuery};
pub use record::{verify_chain, DecisionRecord, Subject, GENESIS_HASH};
