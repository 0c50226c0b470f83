//! Core type definitions for the prescription ledger.
//!
//! This module contains the fundamental data structures shared by every other
//! component: transactions (signed prescriptions), blocks, and the digest
//! helpers that give both of them a canonical, reproducible identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// A SHA-256 digest.
pub type Hash = [u8; 32];

/// Previous-hash sentinel carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: Hash = [0; 32];

/// Nonce the genesis block is created with.
pub const GENESIS_NONCE: u64 = 1;

/// Errors that can occur while computing or parsing digests.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Hash conversion error: {0}")]
    HashConversionError(#[from] bincode::Error),
    #[error("Invalid hash encoding: {0}")]
    InvalidHash(#[from] hex::FromHexError),
}

/// Format a 32-byte hash as a lowercase hexadecimal string.
pub fn format_hex(bytes: &Hash) -> String {
    hex::encode(bytes)
}

/// Parse a 64-character hexadecimal string into a hash.
pub fn parse_hex(s: &str) -> Result<Hash, CryptoError> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s.trim(), &mut out)?;
    Ok(out)
}

/// Milliseconds since the unix epoch, saturating to 0 on a pre-epoch clock.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Canonical field encoding: every field is written as its byte length
/// (u64, little endian) followed by the bytes themselves.
pub fn canonical_encoding<'a, I>(fields: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    for field in fields {
        out.extend_from_slice(&(field.len() as u64).to_le_bytes());
        out.extend_from_slice(field);
    }
    out
}

/// Domain payload of a prescription. Opaque to the ledger apart from its
/// canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prescription {
    pub drug_name: String,
    pub dosage: String,
    pub quantity: String,
}

/// An unsigned prescription as claimed by its writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionClaim {
    /// Registered writer (prescriber) identity.
    pub writer: String,
    /// Dispensing counterparty (pharmacy), if any.
    pub counterparty: Option<String>,
    /// Subject (patient) identity.
    pub subject: String,
    pub payload: Prescription,
}

impl TransactionClaim {
    /// Fields in signing order: writer, counterparty, subject, drug name,
    /// dosage, quantity. An absent counterparty is an empty field.
    pub fn canonical_fields(&self) -> [&str; 6] {
        [
            self.writer.as_str(),
            self.counterparty.as_deref().unwrap_or(""),
            self.subject.as_str(),
            self.payload.drug_name.as_str(),
            self.payload.dosage.as_str(),
            self.payload.quantity.as_str(),
        ]
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_encoding(self.canonical_fields().into_iter().map(str::as_bytes))
    }

    /// Content-derived transaction id. Independent of any signature.
    pub fn calculate_id(&self) -> Hash {
        Sha256::digest(self.canonical_bytes()).into()
    }

    /// Attach a signature, producing the transaction that would be admitted.
    pub fn into_transaction(self, signature: String) -> Transaction {
        Transaction {
            id: self.calculate_id(),
            writer: self.writer,
            counterparty: self.counterparty,
            subject: self.subject,
            payload: self.payload,
            signature,
        }
    }
}

/// An admitted prescription. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Digest of the claim fields (see [`TransactionClaim::calculate_id`])
    #[serde(with = "hex")]
    pub id: Hash,
    pub writer: String,
    pub counterparty: Option<String>,
    pub subject: String,
    pub payload: Prescription,
    /// Writer's signature over the claim, lowercase hex
    pub signature: String,
}

impl Transaction {
    pub fn claim(&self) -> TransactionClaim {
        TransactionClaim {
            writer: self.writer.clone(),
            counterparty: self.counterparty.clone(),
            subject: self.subject.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Whether the stored id still matches the transaction content.
    pub fn has_valid_id(&self) -> bool {
        self.claim().calculate_id() == self.id
    }
}

/// A block in the chain.
///
/// Blocks are never mutated after they are appended; the digest of a block is
/// recomputed from these fields whenever it is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Sequence number, 1 for genesis
    pub index: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Transactions in mempool order
    pub transactions: Vec<Transaction>,
    /// Proof-of-work nonce
    pub nonce: u64,
    /// Digest of the previous block
    #[serde(with = "hex")]
    pub previous_hash: Hash,
}

impl Block {
    pub fn genesis(timestamp: u64) -> Self {
        Block {
            index: 1,
            timestamp,
            transactions: Vec::new(),
            nonce: GENESIS_NONCE,
            previous_hash: GENESIS_PREVIOUS_HASH,
        }
    }

    /// Calculate the SHA-256 digest of the block.
    ///
    /// Header fields are hashed in a fixed order (index, timestamp, nonce,
    /// previous hash) followed by the bincode encoding of the transaction list.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HashConversionError` if serialization fails.
    pub fn calculate_hash(&self) -> Result<Hash, CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.previous_hash);

        let serialized_txns = bincode::serialize(&self.transactions)?;
        hasher.update(serialized_txns);

        Ok(hasher.finalize().into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_claim(subject: &str) -> TransactionClaim {
        TransactionClaim {
            writer: "doctor_alex".to_string(),
            counterparty: Some("pharmacy_01".to_string()),
            subject: subject.to_string(),
            payload: Prescription {
                drug_name: "amoxicillin".to_string(),
                dosage: "500mg".to_string(),
                quantity: "21".to_string(),
            },
        }
    }

    #[test]
    fn test_block_hash_calculation() {
        let tx1 = sample_claim("patient_1").into_transaction("aa".to_string());
        let tx2 = sample_claim("patient_2").into_transaction("bb".to_string());

        let block = Block {
            index: 2,
            timestamp: 1_700_000_000_000,
            transactions: vec![tx1, tx2],
            nonce: 42,
            previous_hash: [7; 32],
        };

        let hash1 = block.calculate_hash().unwrap();

        // Changing a field should change the hash
        let mut modified = block.clone();
        modified.timestamp += 1;
        assert_ne!(hash1, modified.calculate_hash().unwrap());

        let mut reordered = block.clone();
        reordered.transactions.reverse();
        assert_ne!(hash1, reordered.calculate_hash().unwrap());

        // Same content should yield same hash
        assert_eq!(hash1, block.clone().calculate_hash().unwrap());
    }

    #[test]
    fn test_transaction_id_ignores_signature() {
        let a = sample_claim("patient_1").into_transaction("aa".to_string());
        let b = sample_claim("patient_1").into_transaction("bb".to_string());
        assert_eq!(a.id, b.id);
        assert!(a.has_valid_id());

        let mut tampered = a.clone();
        tampered.payload.quantity = "210".to_string();
        assert!(!tampered.has_valid_id());
    }

    #[test]
    fn test_canonical_encoding_is_unambiguous() {
        let mut left = sample_claim("ab");
        left.payload.drug_name = "c".to_string();
        let mut right = sample_claim("a");
        right.payload.drug_name = "bc".to_string();
        assert_ne!(left.canonical_bytes(), right.canonical_bytes());
        assert_ne!(left.calculate_id(), right.calculate_id());
    }

    #[test]
    fn test_missing_counterparty_encodes_as_empty_field() {
        let mut claim = sample_claim("patient_1");
        claim.counterparty = None;
        assert_eq!(claim.canonical_fields()[1], "");
    }

    #[test]
    fn test_hash_hex_round_trip_through_json() {
        let block = Block::genesis(1);
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["previous_hash"], format_hex(&GENESIS_PREVIOUS_HASH));
        let back: Block = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
        assert_eq!(parse_hex(&format_hex(&[9; 32])).unwrap(), [9; 32]);
    }
}
