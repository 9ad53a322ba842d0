//! TEE (Trusted Execution Environment) — the simulated enclave boundary
//!
//! - **Enclave**: measurement identity (MRENCLAVE / MRSIGNER) and error taxonomy
//! - **Sealed Storage**: AES-256-GCM sealing under an identity-derived key
//! - **Secure Memory**: per-slot locked holder of live private keys
//! - **Attestation**: quote generation inside the enclave
//! - **Verifier**: independent remote verification against a trust policy

pub mod enclave;
pub mod sealed_storage;
pub mod secure_memory;
pub mod attestation;
pub mod verifier;

pub use enclave::{
    EnclaveIdentity, Measurement, MeasurementPair, TcbLevel, TeeError, TeeResult,
};
pub use sealed_storage::{SealedBlob, SealedStore, SealingKey};
pub use secure_memory::{verify_pss_signature, EnclaveKey, KeyObject, KeySlot, SecureMemory};
pub use attestation::{AttestationAttester, AttestationLogEntry, AttestationQuote};
pub use verifier::{
    AttestationVerifier, TrustPolicy, VerificationChecks, VerificationFailure,
    VerificationResult, VerifiedIdentity,
};
