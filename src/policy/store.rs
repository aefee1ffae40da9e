//! Atomically swapped policy snapshots

use super::domain::RuleTable;
use crate::config::PolicyConfig;
use crate::error::Result;
use crate::scanner::PatternSet;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Everything the traffic policy and pattern scanner read per request
#[derive(Debug)]
pub struct PolicySnapshot {
    pub table: RuleTable,
    pub patterns: Arc<PatternSet>,
    pub decode_base64: bool,
    /// Incremented on every successful reload
    pub generation: u64,
}

impl PolicySnapshot {
    fn compile(config: &PolicyConfig, generation: u64) -> Result<Self> {
        Ok(Self {
            table: RuleTable::compile(
                &config.route_rules,
                &config.domain_rules,
                &config.header_exemptions,
                config.default_action,
            )?,
            patterns: Arc::new(PatternSet::compile(&config.secret_patterns)?),
            decode_base64: config.decode_base64,
            generation,
        })
    }
}

/// Holder of the current policy; readers never block and never see a
/// half-applied reload.
pub struct PolicyStore {
    current: ArcSwap<PolicySnapshot>,
}

impl PolicyStore {
    /// Compile the initial policy.
    pub fn new(config: &PolicyConfig) -> Result<Self> {
        Ok(Self {
            current: ArcSwap::from_pointee(PolicySnapshot::compile(config, 0)?),
        })
    }

    /// The snapshot in force right now.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    /// Compile `config` off to the side and swap it in. On error the
    /// previous policy stays active.
    pub fn reload(&self, config: &PolicyConfig) -> Result<u64> {
        let generation = self.current.load().generation + 1;
        let snapshot = match PolicySnapshot::compile(config, generation) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Policy reload failed; keeping previous policy");
                return Err(e);
            }
        };

        tracing::info!(
            generation,
            routes = snapshot.table.route_count(),
            domains = snapshot.table.domain_count(),
            patterns = snapshot.patterns.len(),
            "Policy reloaded"
        );
        self.current.store(Arc::new(snapshot));
        Ok(generation)
    }
}
