//! Writer authentication.
//!
//! A submitted claim is admitted only if its writer is registered, its
//! counterparty (when present) is approved, and the attached signature matches
//! what the writer's credential produces over the claim's canonical bytes.
//!
//! The signing scheme sits behind the [`Verifier`] trait. The shared-secret
//! implementation signs `SHA-256(canonical_bytes(claim) || field(secret))`,
//! where `canonical_bytes` is the length-prefixed encoding of writer,
//! counterparty, subject, drug name, dosage and quantity, in that order.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{canonical_encoding, format_hex, Transaction, TransactionClaim};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Unknown writer: {0}")]
    UnknownWriter(String),
    #[error("Counterparty is not approved: {0}")]
    UnapprovedCounterparty(String),
    #[error("Invalid signature from {0}; data may have been tampered with")]
    SignatureMismatch(String),
}

/// Capability to check a writer's signature over a payload.
pub trait Verifier: Send + Sync {
    fn is_registered(&self, writer: &str) -> bool;
    fn verify(&self, writer: &str, payload: &[u8], signature: &str) -> bool;
}

/// Signature of `payload` under a shared secret, lowercase hex.
pub fn shared_secret_signature(payload: &[u8], secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(canonical_encoding([secret.as_bytes()]));
    hex::encode(hasher.finalize())
}

/// Client-side signing of a claim. Never exposed by the server.
pub fn sign_claim(claim: &TransactionClaim, secret: &str) -> String {
    shared_secret_signature(&claim.canonical_bytes(), secret)
}

/// Shared-secret verifier backed by a static writer → secret table.
#[derive(Debug, Clone, Default)]
pub struct SharedSecretVerifier {
    secrets: BTreeMap<String, String>,
}

impl SharedSecretVerifier {
    pub fn new(secrets: BTreeMap<String, String>) -> Self {
        Self { secrets }
    }
}

impl Verifier for SharedSecretVerifier {
    fn is_registered(&self, writer: &str) -> bool {
        self.secrets.contains_key(writer)
    }

    fn verify(&self, writer: &str, payload: &[u8], signature: &str) -> bool {
        let Some(secret) = self.secrets.get(writer) else {
            return false;
        };
        let expected = shared_secret_signature(payload, secret);
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }
}

/// Admission gate in front of the mempool.
pub struct SignatureVerifier<V: Verifier = SharedSecretVerifier> {
    verifier: V,
    approved_counterparties: BTreeSet<String>,
}

impl<V: Verifier> SignatureVerifier<V> {
    pub fn new(verifier: V, approved_counterparties: impl IntoIterator<Item = String>) -> Self {
        Self {
            verifier,
            approved_counterparties: approved_counterparties.into_iter().collect(),
        }
    }

    pub fn is_approved_counterparty(&self, counterparty: &str) -> bool {
        self.approved_counterparties.contains(counterparty)
    }

    /// Authenticate a claim and turn it into a transaction.
    ///
    /// Rejections are final; a forged or tampered claim is never retried.
    pub fn admit(
        &self,
        claim: TransactionClaim,
        signature: String,
    ) -> Result<Transaction, AdmissionError> {
        if !self.verifier.is_registered(&claim.writer) {
            return Err(AdmissionError::UnknownWriter(claim.writer));
        }

        if let Some(counterparty) = &claim.counterparty {
            if !self.is_approved_counterparty(counterparty) {
                return Err(AdmissionError::UnapprovedCounterparty(counterparty.clone()));
            }
        }

        if !self
            .verifier
            .verify(&claim.writer, &claim.canonical_bytes(), &signature)
        {
            warn!(
                target: "security",
                writer = %claim.writer,
                subject = %claim.subject,
                "invalid signature detected"
            );
            return Err(AdmissionError::SignatureMismatch(claim.writer));
        }

        let tx = claim.into_transaction(signature);
        debug!(id = %format_hex(&tx.id), writer = %tx.writer, "transaction admitted");
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::sample_claim;

    fn verifier() -> SignatureVerifier {
        let secrets = BTreeMap::from([
            ("doctor_alex".to_string(), "alex-secret123".to_string()),
            ("doctor_kim".to_string(), "kim-key-987".to_string()),
        ]);
        SignatureVerifier::new(
            SharedSecretVerifier::new(secrets),
            ["pharmacy_01".to_string(), "pharmacy_downtown".to_string()],
        )
    }

    #[test]
    fn test_admit_correctly_signed_claim() {
        let claim = sample_claim("patient_1");
        let signature = sign_claim(&claim, "alex-secret123");
        let tx = verifier().admit(claim.clone(), signature.clone()).unwrap();
        assert_eq!(tx.id, claim.calculate_id());
        assert_eq!(tx.signature, signature);
    }

    #[test]
    fn test_unknown_writer_rejected() {
        let mut claim = sample_claim("patient_1");
        claim.writer = "doctor_who".to_string();
        let signature = sign_claim(&claim, "alex-secret123");
        assert_eq!(
            verifier().admit(claim, signature),
            Err(AdmissionError::UnknownWriter("doctor_who".to_string()))
        );
    }

    #[test]
    fn test_unapproved_counterparty_rejected() {
        let mut claim = sample_claim("patient_1");
        claim.counterparty = Some("pharmacy_shady".to_string());
        let signature = sign_claim(&claim, "alex-secret123");
        assert_eq!(
            verifier().admit(claim, signature),
            Err(AdmissionError::UnapprovedCounterparty(
                "pharmacy_shady".to_string()
            ))
        );
    }

    #[test]
    fn test_claim_without_counterparty_is_admitted() {
        let mut claim = sample_claim("patient_1");
        claim.counterparty = None;
        let signature = sign_claim(&claim, "alex-secret123");
        assert!(verifier().admit(claim, signature).is_ok());
    }

    #[test]
    fn test_other_writers_secret_is_a_mismatch() {
        let claim = sample_claim("patient_1");
        let signature = sign_claim(&claim, "kim-key-987");
        assert_eq!(
            verifier().admit(claim, signature),
            Err(AdmissionError::SignatureMismatch("doctor_alex".to_string()))
        );
    }

    #[test]
    fn test_tampered_payload_is_a_mismatch() {
        let claim = sample_claim("patient_1");
        let signature = sign_claim(&claim, "alex-secret123");
        let mut tampered = claim;
        tampered.payload.dosage = "5000mg".to_string();
        assert!(matches!(
            verifier().admit(tampered, signature),
            Err(AdmissionError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_truncated_signature_is_a_mismatch() {
        let claim = sample_claim("patient_1");
        let mut signature = sign_claim(&claim, "alex-secret123");
        signature.pop();
        assert!(verifier().admit(claim, signature).is_err());
    }

    struct AllowList(&'static str);

    impl Verifier for AllowList {
        fn is_registered(&self, writer: &str) -> bool {
            writer == "doctor_alex"
        }

        fn verify(&self, _writer: &str, _payload: &[u8], signature: &str) -> bool {
            signature == self.0
        }
    }

    #[test]
    fn test_alternative_verifier_plugs_into_admission() {
        let gate = SignatureVerifier::new(AllowList("ok"), ["pharmacy_01".to_string()]);
        assert!(gate.admit(sample_claim("p"), "ok".to_string()).is_ok());
        assert!(matches!(
            gate.admit(sample_claim("p"), "nope".to_string()),
            Err(AdmissionError::SignatureMismatch(_))
        ));
    }
}
