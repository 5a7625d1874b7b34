//! Redo log manager
//!
//! When a consistency level is enabled, DDL events are journaled before
//! downstream application so a replacement owner can replay them. The
//! durable storage backend (log shipping) is an external collaborator;
//! this manager keeps the policy and the journal interface.

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{ConsistentConfig, ConsistentLevel};
use crate::error::Result;
use crate::model::DdlEvent;

/// Whether the given level requires redo logging.
pub fn is_consistent_enabled(level: ConsistentLevel) -> bool {
    level != ConsistentLevel::None
}

/// Per-changefeed redo log manager.
#[derive(Debug)]
pub struct RedoManager {
    level: ConsistentLevel,
    journal: Mutex<Vec<DdlEvent>>,
}

impl RedoManager {
    pub fn new(consistent: &ConsistentConfig) -> Self {
        Self {
            level: consistent.level,
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        is_consistent_enabled(self.level)
    }

    /// Journal a DDL event ahead of downstream application.
    pub fn emit_ddl_event(&self, ddl: &DdlEvent) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        debug!(commit_ts = ddl.commit_ts, query = %ddl.query, "redo journal DDL");
        self.journal.lock().push(ddl.clone());
        Ok(())
    }

    /// Remove all redo logs; called when the changefeed is removed.
    pub fn cleanup(&self) -> Result<()> {
        let drained = self.journal.lock().drain(..).count();
        if drained > 0 {
            info!(events = drained, "cleaned up redo logs");
        }
        Ok(())
    }

    /// Journaled events, oldest first.
    pub fn journaled(&self) -> Vec<DdlEvent> {
        self.journal.lock().clone()
    }
}
