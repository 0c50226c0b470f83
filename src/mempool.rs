//! Staging area for admitted, not yet sealed transactions.

use thiserror::Error;

use crate::types::{Hash, Transaction};

pub const DEFAULT_MEMPOOL_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MempoolError {
    #[error("Mempool is full ({capacity} pending transactions)")]
    Full { capacity: usize },
}

/// Bounded FIFO of pending transactions.
///
/// Nothing is deduplicated or reordered here. `drain` is the only way
/// transactions leave.
#[derive(Debug, Clone)]
pub struct Mempool {
    pending: Vec<Transaction>,
    capacity: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMPOOL_CAPACITY)
    }
}

impl Mempool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Vec::new(),
            capacity,
        }
    }

    pub fn add(&mut self, tx: Transaction) -> Result<Hash, MempoolError> {
        if self.pending.len() >= self.capacity {
            return Err(MempoolError::Full {
                capacity: self.capacity,
            });
        }
        let id = tx.id;
        self.pending.push(tx);
        Ok(id)
    }

    /// Take every pending transaction, in insertion order, leaving the pool empty.
    pub fn drain(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.pending)
    }

    /// Put drained transactions back in front of anything added since.
    pub(crate) fn restore(&mut self, mut drained: Vec<Transaction>) {
        drained.append(&mut self.pending);
        self.pending = drained;
    }

    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn find(&self, id: &Hash) -> Option<&Transaction> {
        self.pending.iter().find(|tx| &tx.id == id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
