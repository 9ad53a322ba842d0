//! Enclave Trust Service
//!
//! A simulated SGX-style enclave serving a permissioned blockchain network:
//! a Root Certificate Authority whose private key never leaves the enclave,
//! AES-256-GCM sealing bound to the enclave's measurements, attestation
//! quotes with an independent verifier, and per-chain orderer signing keys.

pub mod tee;
pub mod ca;
pub mod orderer;
pub mod storage;
pub mod config;
pub mod service;

pub use tee::{
    AttestationAttester, AttestationQuote, AttestationVerifier, EnclaveIdentity, Measurement,
    SealedBlob, SealedStore, SecureMemory, TcbLevel, TeeError, TeeResult, TrustPolicy,
    VerificationFailure, VerificationResult,
};
pub use ca::{CertType, CertificateAuthority};
pub use orderer::{verify_block_signature, OrdererKeyService};
pub use storage::DataDir;
pub use config::EnclaveConfig;
pub use service::{EnclaveInfo, EnclaveService};
