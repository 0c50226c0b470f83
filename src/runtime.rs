use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::consensus::{ConsensusEngine, ProofOfWork, SearchBudget};
use crate::ledger::{self, Ledger, LedgerError, TransactionStatus};
use crate::signature::{AdmissionError, SharedSecretVerifier, SignatureVerifier, Verifier};
use crate::types::{format_hex, Block, Hash, Transaction, TransactionClaim};
use crate::validator::ChainReport;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Admission error: {0}")]
    AdmissionError(#[from] AdmissionError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Ledger lock poisoned")]
    LockPoisoned,
    #[error("Sealing task failed: {0}")]
    SealTaskFailed(String),
}

/// An owned copy of a transaction and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// `None` while the transaction is still pending
    pub block_index: Option<u64>,
    pub transaction: Transaction,
}

/// Summary of the chain for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStatus {
    pub height: u64,
    pub pending: usize,
    pub tip_hash: Hash,
}

/// Shared handle to one ledger.
///
/// All mutation goes through a single `RwLock`. Submissions hold the write
/// lock only long enough to queue a transaction; sealing searches for a nonce
/// without any lock and takes the write lock just to commit the block.
/// [`Runtime::cancel_seals`] interrupts every running and future search.
pub struct Runtime<V: Verifier = SharedSecretVerifier, E: ConsensusEngine = ProofOfWork> {
    ledger: Arc<RwLock<Ledger>>,
    verifier: Arc<SignatureVerifier<V>>,
    engine: Arc<E>,
    cancel: Arc<AtomicBool>,
}

impl<V: Verifier, E: ConsensusEngine> Clone for Runtime<V, E> {
    fn clone(&self) -> Self {
        Runtime {
            ledger: Arc::clone(&self.ledger),
            verifier: Arc::clone(&self.verifier),
            engine: Arc::clone(&self.engine),
            cancel: Arc::clone(&self.cancel),
        }
    }
}

impl<V: Verifier + 'static, E: ConsensusEngine + 'static> Runtime<V, E> {
    /// [`Runtime::seal_with_timeout`] on tokio's blocking pool, so the
    /// nonce search never stalls async request handling.
    pub async fn seal_blocking(&self, timeout: Option<Duration>) -> Result<Block, RuntimeError> {
        let runtime = self.clone();
        tokio::task::spawn_blocking(move || runtime.seal_with_timeout(timeout))
            .await
            .map_err(|e| RuntimeError::SealTaskFailed(e.to_string()))?
    }
}

impl<V: Verifier, E: ConsensusEngine> Runtime<V, E> {
    pub fn new(ledger: Ledger, verifier: SignatureVerifier<V>, engine: E) -> Self {
        Runtime {
            ledger: Arc::new(RwLock::new(ledger)),
            verifier: Arc::new(verifier),
            engine: Arc::new(engine),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Authenticate a claim and queue it for the next block.
    pub fn submit(&self, claim: TransactionClaim, signature: String) -> Result<Hash, RuntimeError> {
        let tx = self.verifier.admit(claim, signature)?;
        let id = self.write()?.submit(tx)?;
        Ok(id)
    }

    /// Seal the mempool into a new block.
    ///
    /// The nonce search runs against a snapshot of the tip. If another block
    /// was committed in the meantime the result is thrown away and the search
    /// restarts against the new tip, within the same budget.
    pub fn seal(&self, budget: &SearchBudget) -> Result<Block, RuntimeError> {
        loop {
            let parent = self.read()?.tip_snapshot();
            debug!(parent = parent.index, "searching for nonce");
            let nonce = ledger::search(self.engine.as_ref(), parent.nonce, budget)?;

            match self.write()?.commit(self.engine.as_ref(), &parent, nonce) {
                Ok(block) => return Ok(block),
                Err(LedgerError::StaleTip { expected, actual }) => {
                    info!(expected, actual, "chain tip moved during search; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Seal under `timeout`, stopping early with `SealCancelled` once
    /// [`Runtime::cancel_seals`] has been called.
    pub fn seal_with_timeout(&self, timeout: Option<Duration>) -> Result<Block, RuntimeError> {
        let budget = match timeout {
            Some(timeout) => SearchBudget::with_timeout(timeout),
            None => SearchBudget::unbounded(),
        };
        self.seal(&budget.with_cancel(Arc::clone(&self.cancel)))
    }

    /// Abort in-flight nonce searches and refuse new ones. Used on shutdown.
    pub fn cancel_seals(&self) {
        if !self.cancel.swap(true, Ordering::AcqRel) {
            info!("sealing cancelled");
        }
    }

    pub fn chain(&self) -> Result<Vec<Block>, RuntimeError> {
        Ok(self.read()?.blocks().to_vec())
    }

    pub fn pending(&self) -> Result<Vec<Transaction>, RuntimeError> {
        Ok(self.read()?.pending().to_vec())
    }

    pub fn status(&self) -> Result<ChainStatus, RuntimeError> {
        let ledger = self.read()?;
        Ok(ChainStatus {
            height: ledger.tip().index,
            pending: ledger.pending().len(),
            tip_hash: ledger.tip_hash(),
        })
    }

    pub fn validate(&self) -> Result<ChainReport, RuntimeError> {
        Ok(self.read()?.validate(self.engine.as_ref()))
    }

    pub fn find_transaction(&self, id: &Hash) -> Result<Option<TransactionRecord>, RuntimeError> {
        let ledger = self.read()?;
        let record = ledger.find_transaction(id).map(|status| match status {
            TransactionStatus::Pending(tx) => TransactionRecord {
                block_index: None,
                transaction: tx.clone(),
            },
            TransactionStatus::Sealed {
                block_index,
                transaction,
            } => TransactionRecord {
                block_index: Some(block_index),
                transaction: transaction.clone(),
            },
        });
        if record.is_none() {
            debug!(id = %format_hex(id), "transaction not found");
        }
        Ok(record)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Ledger>, RuntimeError> {
        self.ledger.read().map_err(|_| RuntimeError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Ledger>, RuntimeError> {
        self.ledger.write().map_err(|_| RuntimeError::LockPoisoned)
    }
}
