//! Transactions and closing

use tracing::{debug, warn};

use dormant_core::{Error, Result, Synchronization, SynchronizationRegistry, TransactionOutcome};

use super::Session;
use crate::config::FlushMode;
use crate::transaction::{Transaction, TransactionStatus};

impl Session {
    /// Start a transaction
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if one is already active.
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(tx) = &self.transaction {
            return Err(Error::Transaction(format!("{} is already active", tx.id())));
        }
        let id = self.factory.next_transaction_id();
        self.factory.store().begin(id)?;
        self.transaction = Some(Transaction::new(id, self.factory.clock().now_millis()));
        self.factory.stats().record_transaction();
        debug!(target: "dormant::session", tx = %id, "Transaction started");
        Ok(())
    }

    /// Flush (in [`FlushMode::Commit`]) and commit the active transaction
    ///
    /// On any failure the transaction is rolled back and the persistence
    /// context cleared before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::TransactionRequired`] without an active transaction
    /// - [`Error::Transaction`] if the transaction was marked rollback-only
    /// - the flush or store error that prevented the commit
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let Some(tx) = &self.transaction else {
            return Err(Error::TransactionRequired);
        };
        if tx.is_rollback_only() {
            let id = tx.id();
            self.rollback()?;
            return Err(Error::Transaction(format!("{} was marked rollback-only", id)));
        }

        if self.flush_mode == FlushMode::Commit {
            if let Err(e) = self.flush() {
                self.rollback_after_failure();
                return Err(e);
            }
        }
        let before = match self.transaction.as_mut() {
            Some(tx) => tx.before_completion(),
            None => Err(Error::TransactionRequired),
        };
        if let Err(e) = before {
            self.rollback_after_failure();
            return Err(e);
        }

        let Some(tx) = self.transaction.take() else {
            return Err(Error::TransactionRequired);
        };
        let id = tx.id();
        if let Err(e) = self.factory.store().commit(id) {
            warn!(target: "dormant::session", tx = %id, error = %e, "Commit failed");
            if e.is_optimistic_lock_failure() {
                self.factory.stats().record_optimistic_failure();
            }
            tx.after_completion(TransactionOutcome::RolledBack);
            self.forget_inserted();
            self.discard_context()?;
            self.context.after_transaction_completion();
            self.factory.stats().record_rollback();
            return Err(e);
        }
        tx.after_completion(TransactionOutcome::Committed);
        self.context.after_transaction_completion();
        self.factory.stats().record_commit();
        debug!(target: "dormant::session", tx = %id, "Transaction committed");
        Ok(())
    }

    /// Roll back the active transaction
    ///
    /// Every managed instance is detached. Instances inserted by the
    /// transaction lose their generated identifiers.
    pub fn rollback(&mut self) -> Result<()> {
        let Some(tx) = self.transaction.take() else {
            return Err(Error::TransactionRequired);
        };
        let id = tx.id();
        let result = self.factory.store().rollback(id);
        tx.after_completion(TransactionOutcome::RolledBack);
        self.forget_inserted();
        self.discard_context()?;
        self.context.after_transaction_completion();
        self.factory.stats().record_rollback();
        debug!(target: "dormant::session", tx = %id, "Transaction rolled back");
        result
    }

    fn rollback_after_failure(&mut self) {
        if let Err(e) = self.rollback() {
            warn!(target: "dormant::session", error = %e, "Rollback after failure failed");
        }
    }

    /// Rows inserted by a rolled back transaction never existed
    fn forget_inserted(&mut self) {
        let inserted: Vec<_> = self
            .context
            .inserted_keys()
            .filter_map(|key| self.context.instance_for(key))
            .collect();
        for id in inserted {
            if let Ok(instance) = self.instances.get_mut(id) {
                instance.forget_identity();
            }
        }
    }

    /// Register a callback for the completion of the active transaction
    pub fn register_synchronization(&mut self, synchronization: Box<dyn Synchronization>) -> Result<()> {
        match self.transaction.as_mut() {
            Some(tx) => {
                tx.register_synchronization(synchronization);
                Ok(())
            }
            None => Err(Error::TransactionRequired),
        }
    }

    /// Status of the active transaction, `None` outside one
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.transaction.as_ref().map(Transaction::status)
    }

    /// Whether a transaction is active
    pub fn is_transaction_active(&self) -> bool {
        self.transaction.is_some()
    }

    /// Mark the active transaction rollback-only
    pub fn set_rollback_only(&mut self) -> Result<()> {
        match self.transaction.as_mut() {
            Some(tx) => {
                tx.set_rollback_only();
                Ok(())
            }
            None => Err(Error::TransactionRequired),
        }
    }

    /// Close the session, rolling back an active transaction
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    /// Whether the session was closed
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = if self.transaction.is_some() {
            self.rollback()
        } else {
            Ok(())
        };
        self.closed = true;
        self.factory.stats().record_session_closed();
        debug!(target: "dormant::session", "Session closed");
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            warn!(target: "dormant::session", "Session dropped with an active transaction; rolling back");
        }
        if let Err(e) = self.shutdown() {
            warn!(target: "dormant::session", error = %e, "Rollback on drop failed");
        }
    }
}
