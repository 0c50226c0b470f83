//! Proof-of-work sequencing.
//!
//! A nonce is accepted when `SHA-256(decimal(previous_nonce) ++ decimal(nonce))`
//! starts with the configured number of zero bits. The search is a pure CPU
//! loop over ascending nonces, bounded by an optional deadline and an optional
//! cancel flag so that no caller can be blocked forever.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::types::Hash;

/// How many attempts run between deadline/cancel checks.
const CHECK_INTERVAL: u64 = 1024;

/// Required number of leading zero symbols in a proof hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Leading zero hex digits (4 bits each)
    HexZeros(u32),
    /// Leading zero bits
    Bits(u32),
}

impl Difficulty {
    pub fn zero_bits(self) -> u32 {
        match self {
            Difficulty::HexZeros(n) => n.saturating_mul(4),
            Difficulty::Bits(n) => n,
        }
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty::HexZeros(4)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difficulty::HexZeros(n) => write!(f, "{n} hex zeros"),
            Difficulty::Bits(n) => write!(f, "{n} zero bits"),
        }
    }
}

/// Hash of the proof input for a pair of nonces.
pub fn proof_hash(previous_nonce: u64, nonce: u64) -> Hash {
    Sha256::digest(format!("{previous_nonce}{nonce}")).into()
}

pub fn leading_zero_bits(hash: &Hash) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

pub fn meets_difficulty(hash: &Hash, difficulty: Difficulty) -> bool {
    leading_zero_bits(hash) >= difficulty.zero_bits()
}

/// Limits on a single nonce search.
#[derive(Debug, Clone, Default)]
pub struct SearchBudget {
    deadline: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
}

impl SearchBudget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::until(Instant::now() + timeout)
    }

    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The outcome to stop with, if the budget no longer allows searching.
    pub fn interrupted(&self) -> Option<SearchOutcome> {
        if let Some(cancel) = &self.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Some(SearchOutcome::Cancelled);
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(SearchOutcome::TimedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(u64),
    TimedOut,
    Cancelled,
    /// Every nonce up to `u64::MAX` was tried
    Exhausted,
}

pub trait ConsensusEngine: Send + Sync {
    fn difficulty(&self) -> Difficulty;

    /// Search for a nonce to follow `previous_nonce`.
    fn solve(&self, previous_nonce: u64, budget: &SearchBudget) -> SearchOutcome;

    /// Check a stored pair of nonces.
    fn verify(&self, previous_nonce: u64, nonce: u64) -> bool;
}

/// Fixed-difficulty proof-of-work.
///
/// With more than one worker the nonce space is split in strides across
/// scoped threads and the first hit wins, so the returned nonce is valid but
/// not necessarily the smallest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty: Difficulty,
    workers: usize,
}

impl Default for ProofOfWork {
    fn default() -> Self {
        Self::new(Difficulty::default())
    }
}

impl ProofOfWork {
    pub fn new(difficulty: Difficulty) -> Self {
        Self {
            difficulty,
            workers: 1,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Deterministic ascending search starting at 0.
    pub fn solve_sequential(&self, previous_nonce: u64, budget: &SearchBudget) -> SearchOutcome {
        let mut input = String::with_capacity(40);
        let mut nonce: u64 = 0;
        loop {
            if nonce % CHECK_INTERVAL == 0 {
                if let Some(outcome) = budget.interrupted() {
                    return outcome;
                }
            }
            if self.attempt(&mut input, previous_nonce, nonce) {
                return SearchOutcome::Found(nonce);
            }
            nonce = match nonce.checked_add(1) {
                Some(n) => n,
                None => return SearchOutcome::Exhausted,
            };
        }
    }

    pub fn solve_parallel(
        &self,
        previous_nonce: u64,
        workers: usize,
        budget: &SearchBudget,
    ) -> SearchOutcome {
        let workers = workers.max(1) as u64;
        let found = AtomicBool::new(false);
        let winner = AtomicU64::new(0);

        thread::scope(|scope| {
            for offset in 0..workers {
                let found = &found;
                let winner = &winner;
                scope.spawn(move || {
                    let mut input = String::with_capacity(40);
                    let mut nonce = offset;
                    let mut attempts: u64 = 0;
                    loop {
                        if found.load(Ordering::Relaxed) {
                            return;
                        }
                        if attempts % CHECK_INTERVAL == 0 && budget.interrupted().is_some() {
                            return;
                        }
                        if self.attempt(&mut input, previous_nonce, nonce) {
                            if found
                                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                                .is_ok()
                            {
                                winner.store(nonce, Ordering::Release);
                            }
                            return;
                        }
                        attempts += 1;
                        nonce = match nonce.checked_add(workers) {
                            Some(n) => n,
                            None => return,
                        };
                    }
                });
            }
        });

        if found.load(Ordering::Acquire) {
            SearchOutcome::Found(winner.load(Ordering::Acquire))
        } else {
            budget.interrupted().unwrap_or(SearchOutcome::Exhausted)
        }
    }

    fn attempt(&self, input: &mut String, previous_nonce: u64, nonce: u64) -> bool {
        input.clear();
        // Writing into a String cannot fail.
        let _ = write!(input, "{previous_nonce}{nonce}");
        let hash: Hash = Sha256::digest(input.as_bytes()).into();
        meets_difficulty(&hash, self.difficulty)
    }
}

impl ConsensusEngine for ProofOfWork {
    fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    fn solve(&self, previous_nonce: u64, budget: &SearchBudget) -> SearchOutcome {
        if self.workers > 1 {
            self.solve_parallel(previous_nonce, self.workers, budget)
        } else {
            self.solve_sequential(previous_nonce, budget)
        }
    }

    fn verify(&self, previous_nonce: u64, nonce: u64) -> bool {
        meets_difficulty(&proof_hash(previous_nonce, nonce), self.difficulty)
    }
}
