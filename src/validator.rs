//! Full-chain audit.
//!
//! Walks the chain from the second block on, checking sequence contiguity,
//! hash linkage and the proof-of-work over each pair of stored nonces. Every
//! block's transactions must also still match their content-derived ids. The
//! first failure decides the report; nothing after it is trusted.

use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::consensus::ConsensusEngine;
use crate::types::Block;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    MissingGenesis,
    SequenceGap,
    PreviousHashMismatch,
    ProofOfWorkInvalid,
    TransactionIdMismatch,
    Unhashable,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidReason::MissingGenesis => "chain has no genesis block",
            InvalidReason::SequenceGap => "block sequence number is out of order",
            InvalidReason::PreviousHashMismatch => "previous hash does not match the previous block",
            InvalidReason::ProofOfWorkInvalid => "proof of work does not meet the difficulty",
            InvalidReason::TransactionIdMismatch => "transaction content does not match its id",
            InvalidReason::Unhashable => "block could not be serialized for hashing",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainReport {
    Valid,
    Invalid {
        at_sequence: u64,
        reason: InvalidReason,
    },
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainReport::Valid)
    }

    pub fn failing_sequence(&self) -> Option<u64> {
        match self {
            ChainReport::Valid => None,
            ChainReport::Invalid { at_sequence, .. } => Some(*at_sequence),
        }
    }

    pub fn reason(&self) -> Option<InvalidReason> {
        match self {
            ChainReport::Valid => None,
            ChainReport::Invalid { reason, .. } => Some(*reason),
        }
    }
}

/// Audit `blocks`, which must start at genesis.
///
/// Failures are reported by position in the chain (1-based), which is the
/// sequence number the block at that position is supposed to carry.
pub fn validate<E>(blocks: &[Block], engine: &E) -> ChainReport
where
    E: ConsensusEngine + ?Sized,
{
    let report = walk(blocks, engine);
    match report {
        ChainReport::Valid => debug!(blocks = blocks.len(), "chain is valid"),
        ChainReport::Invalid {
            at_sequence,
            reason,
        } => warn!(at_sequence, %reason, "chain is invalid"),
    }
    report
}

fn walk<E>(blocks: &[Block], engine: &E) -> ChainReport
where
    E: ConsensusEngine + ?Sized,
{
    let invalid = |at_sequence: usize, reason| ChainReport::Invalid {
        at_sequence: at_sequence as u64,
        reason,
    };

    let Some(genesis) = blocks.first() else {
        return invalid(1, InvalidReason::MissingGenesis);
    };
    if genesis.index != 1 {
        return invalid(1, InvalidReason::SequenceGap);
    }
    if !genesis.transactions.iter().all(|tx| tx.has_valid_id()) {
        return invalid(1, InvalidReason::TransactionIdMismatch);
    }
    let Ok(mut previous_hash) = genesis.calculate_hash() else {
        return invalid(1, InvalidReason::Unhashable);
    };

    for (position, pair) in blocks.windows(2).enumerate() {
        let (previous, block) = (&pair[0], &pair[1]);
        let sequence = position + 2;

        if block.index != previous.index + 1 {
            return invalid(sequence, InvalidReason::SequenceGap);
        }
        if block.previous_hash != previous_hash {
            return invalid(sequence, InvalidReason::PreviousHashMismatch);
        }
        if !engine.verify(previous.nonce, block.nonce) {
            return invalid(sequence, InvalidReason::ProofOfWorkInvalid);
        }
        if !block.transactions.iter().all(|tx| tx.has_valid_id()) {
            return invalid(sequence, InvalidReason::TransactionIdMismatch);
        }
        previous_hash = match block.calculate_hash() {
            Ok(hash) => hash,
            Err(_) => return invalid(sequence, InvalidReason::Unhashable),
        };
    }

    ChainReport::Valid
}
