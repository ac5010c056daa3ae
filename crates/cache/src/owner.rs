//! Owners of pending puts and invalidations

use dormant_core::TxId;
use std::fmt;
use std::thread::{self, ThreadId};

/// Who registered a pending put or started an invalidation
///
/// Work done inside a transaction is owned by the transaction so that the
/// matching synchronization can end it from any thread; work done outside a
/// transaction is owned by the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    /// A store transaction
    Transaction(TxId),
    /// A thread running without a transaction
    Thread(ThreadId),
}

impl LockOwner {
    /// The transaction if there is one, otherwise the current thread
    pub fn current(tx: Option<TxId>) -> Self {
        match tx {
            Some(tx) => LockOwner::Transaction(tx),
            None => LockOwner::Thread(thread::current().id()),
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Transaction(tx) => write!(f, "{}", tx),
            LockOwner::Thread(id) => write!(f, "{:?}", id),
        }
    }
}
