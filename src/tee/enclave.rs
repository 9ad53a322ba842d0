//! Enclave identity — measurements, trust level and the error taxonomy
//!
//! The simulated enclave is identified by two stable fingerprints:
//! - **MRENCLAVE**: SHA-256 of the enclave code identity
//! - **MRSIGNER**: SHA-256 of the enclave signer identity
//!
//! Both are computed once when an [`EnclaveIdentity`] is constructed and are
//! passed by value to every component that seals or attests.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Default code identity string of the simulated enclave binary
pub const DEFAULT_CODE_IDENTITY: &str = "DFIR-SGX-Enclave-Code-v2.0.0-Production";
/// Default signer identity string
pub const DEFAULT_SIGNER_IDENTITY: &str = "DFIR-SGX-Signer-Public-Key";
/// Default simulated CPU root secret label
pub const DEFAULT_ROOT_SECRET: &str = "SGX-CPU-ROOT-SEAL-KEY-SIMULATION";

/// A 32-byte measurement digest, hex-encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Measurement([u8; 32]);

impl Measurement {
    pub const LEN: usize = 32;

    /// Measure an identity string (SHA-256)
    pub fn of(identity: &[u8]) -> Self {
        Self(Sha256::digest(identity).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Measurement({})", self.to_hex())
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Measurement {
    type Err = TeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| TeeError::InvalidArgument(format!("measurement is not hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            TeeError::InvalidArgument(format!(
                "measurement must be {} bytes, got {}",
                Self::LEN,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Measurement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// MRENCLAVE / MRSIGNER pair of one running enclave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasurementPair {
    pub mr_enclave: Measurement,
    pub mr_signer: Measurement,
}

impl MeasurementPair {
    pub fn compute(code_identity: &[u8], signer_identity: &[u8]) -> Self {
        Self {
            mr_enclave: Measurement::of(code_identity),
            mr_signer: Measurement::of(signer_identity),
        }
    }

    /// `mr_enclave ‖ mr_signer`, the associated data bound into every seal
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(self.mr_enclave.as_bytes());
        out[32..].copy_from_slice(self.mr_signer.as_bytes());
        out
    }
}

/// Trusted computing base level. Compared numerically, so "10" ranks above "9".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct TcbLevel(pub u32);

impl fmt::Display for TcbLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Older policy files carry the level as a string ("1"); accept both forms.
impl<'de> Deserialize<'de> for TcbLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(TcbLevel(n)),
            Raw::Text(s) => s
                .trim()
                .parse::<u32>()
                .map(TcbLevel)
                .map_err(|_| de::Error::custom(format!("invalid TCB level '{}'", s))),
        }
    }
}

/// The constructed identity of one enclave instance
///
/// Replaces process-wide configuration tables: every component receives a
/// clone of this value at construction time.
#[derive(Clone)]
pub struct EnclaveIdentity {
    pub name: String,
    pub version: String,
    measurements: MeasurementPair,
    pub tcb_level: TcbLevel,
    root_secret: [u8; 32],
}

impl EnclaveIdentity {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        code_identity: &str,
        signer_identity: &str,
        tcb_level: TcbLevel,
        root_secret: &str,
    ) -> Self {
        let measurements =
            MeasurementPair::compute(code_identity.as_bytes(), signer_identity.as_bytes());
        Self {
            name: name.into(),
            version: version.into(),
            measurements,
            tcb_level,
            root_secret: Sha256::digest(root_secret.as_bytes()).into(),
        }
    }

    /// The identity of the stock simulator build
    pub fn simulated() -> Self {
        Self::new(
            "DFIR-SGX-Enclave",
            "2.0.0",
            DEFAULT_CODE_IDENTITY,
            DEFAULT_SIGNER_IDENTITY,
            TcbLevel(1),
            DEFAULT_ROOT_SECRET,
        )
    }

    /// MRENCLAVE and MRSIGNER, fixed at construction
    pub fn measurements(&self) -> &MeasurementPair {
        &self.measurements
    }

    #[cfg(test)]
    pub(crate) fn with_measurements(mut self, measurements: MeasurementPair) -> Self {
        self.measurements = measurements;
        self
    }

    /// Simulated hardware root secret; only the sealing key deriver reads it
    pub(crate) fn root_secret(&self) -> &[u8; 32] {
        &self.root_secret
    }
}

impl fmt::Debug for EnclaveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveIdentity")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("measurements", &self.measurements)
            .field("tcb_level", &self.tcb_level)
            .finish_non_exhaustive()
    }
}

/// TEE-related errors
#[derive(Debug, thiserror::Error)]
pub enum TeeError {
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Integrity verification failed: {0}")]
    IntegrityError(String),

    #[error("Invalid certificate signing request: {0}")]
    InvalidCsr(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Malformed attestation quote: {0}")]
    MalformedQuote(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rcgen::Error> for TeeError {
    fn from(e: rcgen::Error) -> Self {
        TeeError::Certificate(e.to_string())
    }
}

impl From<rsa::Error> for TeeError {
    fn from(e: rsa::Error) -> Self {
        TeeError::Crypto(e.to_string())
    }
}

pub type TeeResult<T> = Result<T, TeeError>;
