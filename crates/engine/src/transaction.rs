//! Session transactions
//!
//! A [`Transaction`] wraps one store transaction and collects the
//! synchronizations registered while it runs: cache access strategies
//! publish inserted entries, end invalidations or evict again once the
//! outcome is known.
//!
//! A persistence failure marks the transaction rollback-only; commit then
//! refuses and the caller must roll back.

use std::fmt;

use tracing::{debug, warn};

use dormant_core::{Result, Synchronization, SynchronizationRegistry, TransactionOutcome, TxId};

/// Lifecycle status of a session transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Running
    Active,
    /// Running, but can only roll back
    MarkedRollback,
    /// Committed
    Committed,
    /// Rolled back
    RolledBack,
}

/// One store transaction of a session
pub struct Transaction {
    id: TxId,
    started_at: u64,
    synchronizations: Vec<Box<dyn Synchronization>>,
    rollback_only: bool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("synchronizations", &self.synchronizations.len())
            .field("rollback_only", &self.rollback_only)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(id: TxId, started_at: u64) -> Self {
        Self {
            id,
            started_at,
            synchronizations: Vec::new(),
            rollback_only: false,
        }
    }

    /// Store transaction id
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Clock time the transaction started at, in milliseconds
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    /// Whether only rollback is possible
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Forbid commit
    pub fn set_rollback_only(&mut self) {
        if !self.rollback_only {
            debug!(target: "dormant::session", tx = %self.id, "Transaction marked rollback-only");
        }
        self.rollback_only = true;
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        if self.rollback_only {
            TransactionStatus::MarkedRollback
        } else {
            TransactionStatus::Active
        }
    }

    /// Number of registered synchronizations
    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.len()
    }

    /// Run `before_completion` on every synchronization, stopping at the
    /// first failure
    pub(crate) fn before_completion(&mut self) -> Result<()> {
        for synchronization in &mut self.synchronizations {
            synchronization.before_completion()?;
        }
        Ok(())
    }

    /// Notify every synchronization of the outcome, consuming the transaction
    pub(crate) fn after_completion(self, outcome: TransactionOutcome) {
        debug!(
            target: "dormant::session",
            tx = %self.id,
            ?outcome,
            synchronizations = self.synchronizations.len(),
            "Transaction completed"
        );
        for mut synchronization in self.synchronizations {
            synchronization.after_completion(outcome);
        }
    }
}

impl SynchronizationRegistry for Transaction {
    fn register_synchronization(&mut self, synchronization: Box<dyn Synchronization>) {
        if self.rollback_only {
            warn!(target: "dormant::session", tx = %self.id, "Synchronization registered on rollback-only transaction");
        }
        self.synchronizations.push(synchronization);
    }
}
