use thiserror::Error;
use tracing::{debug, info};

use crate::consensus::{ConsensusEngine, SearchBudget, SearchOutcome};
use crate::mempool::{Mempool, MempoolError};
use crate::types::{current_timestamp_millis, format_hex, Block, CryptoError, Hash, Transaction};
use crate::validator::{self, ChainReport};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Mempool error: {0}")]
    MempoolError(#[from] MempoolError),
    #[error("Chain tip moved from block #{expected} to #{actual} while sealing")]
    StaleTip { expected: u64, actual: u64 },
    #[error("Nonce {nonce} does not satisfy the difficulty after block #{index}")]
    InvalidProof { index: u64, nonce: u64 },
    #[error("Proof-of-work search timed out")]
    SealTimeout,
    #[error("Proof-of-work search was cancelled")]
    SealCancelled,
    #[error("Proof-of-work nonce space exhausted")]
    NonceSpaceExhausted,
}

impl LedgerError {
    /// Whether the caller may simply try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::SealTimeout | LedgerError::SealCancelled | LedgerError::StaleTip { .. }
        )
    }
}

/// What a sealer needs to know about the chain tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipSnapshot {
    pub index: u64,
    pub nonce: u64,
    pub hash: Hash,
}

/// Where a transaction currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus<'a> {
    Pending(&'a Transaction),
    Sealed {
        block_index: u64,
        transaction: &'a Transaction,
    },
}

/// The append-only chain together with its mempool.
///
/// The chain is never empty: it starts with the genesis block and only ever
/// grows through [`Ledger::seal`] or [`Ledger::commit`].
#[derive(Debug, Clone)]
pub struct Ledger {
    blocks: Vec<Block>,
    mempool: Mempool,
    tip_hash: Hash,
}

impl Ledger {
    pub fn initialize(mempool: Mempool) -> Result<Self, LedgerError> {
        Self::with_genesis_timestamp(mempool, current_timestamp_millis())
    }

    pub fn with_genesis_timestamp(mempool: Mempool, timestamp: u64) -> Result<Self, LedgerError> {
        let genesis = Block::genesis(timestamp);
        let tip_hash = Self::digest(&genesis)?;
        info!(hash = %format_hex(&tip_hash), "chain initialized with genesis block");
        Ok(Ledger {
            blocks: vec![genesis],
            mempool,
            tip_hash,
        })
    }

    /// Canonical digest of a block; see [`Block::calculate_hash`].
    pub fn digest(block: &Block) -> Result<Hash, LedgerError> {
        Ok(block.calculate_hash()?)
    }

    /// Queue an already admitted transaction for the next block.
    pub fn submit(&mut self, tx: Transaction) -> Result<Hash, LedgerError> {
        let id = self.mempool.add(tx)?;
        debug!(id = %format_hex(&id), pending = self.mempool.len(), "transaction queued");
        Ok(id)
    }

    pub fn tip(&self) -> &Block {
        // `blocks` always holds at least the genesis block.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn tip_hash(&self) -> Hash {
        self.tip_hash
    }

    pub fn tip_snapshot(&self) -> TipSnapshot {
        let tip = self.tip();
        TipSnapshot {
            index: tip.index,
            nonce: tip.nonce,
            hash: self.tip_hash,
        }
    }

    /// Solve the puzzle against the current tip and append a block holding
    /// the whole mempool. Requires exclusive access for the entire search.
    ///
    /// On any failure the chain and the mempool are left untouched.
    pub fn seal<E>(&mut self, engine: &E, budget: &SearchBudget) -> Result<Block, LedgerError>
    where
        E: ConsensusEngine + ?Sized,
    {
        let parent = self.tip_snapshot();
        let nonce = search(engine, parent.nonce, budget)?;
        self.commit(engine, &parent, nonce)
    }

    /// Append a block for a nonce found against `parent`.
    ///
    /// Fails with `StaleTip` if another block was appended since `parent` was
    /// taken; the caller must then search again.
    pub fn commit<E>(
        &mut self,
        engine: &E,
        parent: &TipSnapshot,
        nonce: u64,
    ) -> Result<Block, LedgerError>
    where
        E: ConsensusEngine + ?Sized,
    {
        let current = self.tip_snapshot();
        if current != *parent {
            return Err(LedgerError::StaleTip {
                expected: parent.index,
                actual: current.index,
            });
        }
        if !engine.verify(parent.nonce, nonce) {
            return Err(LedgerError::InvalidProof {
                index: parent.index,
                nonce,
            });
        }

        let block = Block {
            index: parent.index + 1,
            timestamp: current_timestamp_millis(),
            transactions: self.mempool.drain(),
            nonce,
            previous_hash: parent.hash,
        };
        let hash = match Self::digest(&block) {
            Ok(hash) => hash,
            Err(e) => {
                self.mempool.restore(block.transactions);
                return Err(e);
            }
        };

        self.blocks.push(block.clone());
        self.tip_hash = hash;
        info!(
            index = block.index,
            transactions = block.transactions.len(),
            hash = %format_hex(&hash),
            "block sealed"
        );
        Ok(block)
    }

    pub fn validate<E>(&self, engine: &E) -> ChainReport
    where
        E: ConsensusEngine + ?Sized,
    {
        validator::validate(&self.blocks, engine)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn pending(&self) -> &[Transaction] {
        self.mempool.pending()
    }

    pub fn find_transaction(&self, id: &Hash) -> Option<TransactionStatus<'_>> {
        if let Some(tx) = self.mempool.find(id) {
            return Some(TransactionStatus::Pending(tx));
        }
        self.blocks.iter().rev().find_map(|block| {
            block
                .transactions
                .iter()
                .find(|tx| &tx.id == id)
                .map(|transaction| TransactionStatus::Sealed {
                    block_index: block.index,
                    transaction,
                })
        })
    }
}

pub(crate) fn search<E>(engine: &E, previous_nonce: u64, budget: &SearchBudget) -> Result<u64, LedgerError>
where
    E: ConsensusEngine + ?Sized,
{
    match engine.solve(previous_nonce, budget) {
        SearchOutcome::Found(nonce) => Ok(nonce),
        SearchOutcome::TimedOut => Err(LedgerError::SealTimeout),
        SearchOutcome::Cancelled => Err(LedgerError::SealCancelled),
        SearchOutcome::Exhausted => Err(LedgerError::NonceSpaceExhausted),
    }
}
