//! Remote Attestation — quote generation inside the enclave
//!
//! The attester produces a quote binding:
//! 1. the enclave measurements (MRENCLAVE / MRSIGNER)
//! 2. the declared TCB level
//! 3. a freshness timestamp and a random nonce
//! 4. a digest of caller-supplied report data
//!
//! The quote signature is SHA-256 over the canonical sorted-key JSON encoding
//! of every other field, so an independent verifier holding no enclave secret
//! can recompute it exactly (see [`super::verifier`]).

use super::enclave::{EnclaveIdentity, Measurement, TcbLevel, TeeError, TeeResult};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Quote format version
pub const QUOTE_VERSION: u32 = 3;
/// Random nonce length in bytes (hex-encoded on the wire)
pub const NONCE_LEN: usize = 16;

/// Signed attestation quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttestationQuote {
    pub version: u32,
    pub mr_enclave: Measurement,
    pub mr_signer: Measurement,
    pub tcb_level: TcbLevel,
    /// Unix seconds at generation
    pub timestamp: i64,
    /// Hex-encoded random nonce
    pub nonce: String,
    /// Hex-encoded SHA-256 of the caller's report data
    pub report_data: String,
    /// Hex-encoded SHA-256 of the canonical body
    pub signature: String,
}

/// One line of the attestation log; identifies a quote without reproducing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationLogEntry {
    pub logged_at: DateTime<Utc>,
    pub quote_timestamp: i64,
    pub nonce: String,
    /// MRENCLAVE prefix
    pub mr_enclave: String,
    /// Signature prefix
    pub signature: String,
}

/// Every quote field except the signature, in sorted key order
#[derive(Serialize)]
struct QuoteBody<'a> {
    mr_enclave: &'a Measurement,
    mr_signer: &'a Measurement,
    nonce: &'a str,
    report_data: &'a str,
    tcb_level: TcbLevel,
    timestamp: i64,
    version: u32,
}

impl AttestationQuote {
    pub fn log_entry(&self) -> AttestationLogEntry {
        AttestationLogEntry {
            logged_at: Utc::now(),
            quote_timestamp: self.timestamp,
            nonce: self.nonce.clone(),
            mr_enclave: format!("{}...", self.mr_enclave.short()),
            signature: format!("{}...", self.signature.chars().take(16).collect::<String>()),
        }
    }

    /// Canonical encoding covered by the signature
    pub fn canonical_body(&self) -> TeeResult<String> {
        let body = QuoteBody {
            mr_enclave: &self.mr_enclave,
            mr_signer: &self.mr_signer,
            nonce: &self.nonce,
            report_data: &self.report_data,
            tcb_level: self.tcb_level,
            timestamp: self.timestamp,
            version: self.version,
        };
        // Going through Value sorts the keys regardless of field order
        let value = serde_json::to_value(&body)?;
        Ok(serde_json::to_string(&value)?)
    }

    /// Recompute the signature from the other fields
    pub fn expected_signature(&self) -> TeeResult<String> {
        Ok(hex::encode(Sha256::digest(self.canonical_body()?.as_bytes())))
    }

    /// Parse and validate a quote received across a trust boundary
    pub fn from_json(json: &str) -> TeeResult<Self> {
        let quote: AttestationQuote =
            serde_json::from_str(json).map_err(|e| TeeError::MalformedQuote(e.to_string()))?;
        quote.validate()?;
        Ok(quote)
    }

    pub fn to_json(&self) -> TeeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural checks that must hold before any verification logic runs
    pub fn validate(&self) -> TeeResult<()> {
        if self.version != QUOTE_VERSION {
            return Err(TeeError::MalformedQuote(format!(
                "unsupported quote version {}",
                self.version
            )));
        }
        check_hex("nonce", &self.nonce, NONCE_LEN)?;
        check_hex("report_data", &self.report_data, 32)?;
        check_hex("signature", &self.signature, 32)?;
        Ok(())
    }
}

fn check_hex(field: &str, value: &str, bytes: usize) -> TeeResult<()> {
    let decoded = hex::decode(value)
        .map_err(|e| TeeError::MalformedQuote(format!("{} is not hex: {}", field, e)))?;
    if decoded.len() != bytes {
        return Err(TeeError::MalformedQuote(format!(
            "{} must be {} bytes, got {}",
            field,
            bytes,
            decoded.len()
        )));
    }
    Ok(())
}

/// Quote generator running inside the simulated enclave
#[derive(Debug, Clone)]
pub struct AttestationAttester {
    identity: EnclaveIdentity,
}

impl AttestationAttester {
    pub fn new(identity: EnclaveIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &EnclaveIdentity {
        &self.identity
    }

    /// Generate a fresh quote over `report_data`
    pub fn generate_quote(&self, report_data: &[u8]) -> TeeResult<AttestationQuote> {
        self.generate_quote_at(report_data, Utc::now().timestamp())
    }

    pub(crate) fn generate_quote_at(
        &self,
        report_data: &[u8],
        timestamp: i64,
    ) -> TeeResult<AttestationQuote> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut quote = AttestationQuote {
            version: QUOTE_VERSION,
            mr_enclave: self.identity.measurements().mr_enclave,
            mr_signer: self.identity.measurements().mr_signer,
            tcb_level: self.identity.tcb_level,
            timestamp,
            nonce: hex::encode(nonce),
            report_data: hex::encode(Sha256::digest(report_data)),
            signature: String::new(),
        };
        quote.signature = quote.expected_signature()?;

        log::debug!(
            "Generated quote: MRENCLAVE {}..., nonce {}",
            quote.mr_enclave.short(),
            &quote.nonce[..8]
        );
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attester() -> AttestationAttester {
        AttestationAttester::new(EnclaveIdentity::simulated())
    }

    #[test]
    fn test_quote_binds_identity_and_report_data() {
        let identity = EnclaveIdentity::simulated();
        let quote = attester().generate_quote(b"block-12345").unwrap();

        assert_eq!(quote.version, QUOTE_VERSION);
        assert_eq!(quote.mr_enclave, identity.measurements().mr_enclave);
        assert_eq!(quote.mr_signer, identity.measurements().mr_signer);
        assert_eq!(quote.tcb_level, identity.tcb_level);
        assert_eq!(quote.report_data, hex::encode(Sha256::digest(b"block-12345")));
        assert_eq!(quote.signature, quote.expected_signature().unwrap());
        assert!((Utc::now().timestamp() - quote.timestamp).abs() <= 1);
    }

    #[test]
    fn test_nonce_fresh_per_quote() {
        let a = attester().generate_quote(b"x").unwrap();
        let b = attester().generate_quote(b"x").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn test_canonical_body_sorted_and_signature_free() {
        let quote = attester().generate_quote(b"").unwrap();
        let body = quote.canonical_body().unwrap();
        assert!(!body.contains("signature"));
        let keys = [
            "\"mr_enclave\"",
            "\"mr_signer\"",
            "\"nonce\"",
            "\"report_data\"",
            "\"tcb_level\"",
            "\"timestamp\"",
            "\"version\"",
        ];
        let positions: Vec<usize> = keys.iter().map(|k| body.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_json_wire_roundtrip_preserves_signature() {
        let quote = attester().generate_quote(b"report").unwrap();
        let parsed = AttestationQuote::from_json(&quote.to_json().unwrap()).unwrap();
        assert_eq!(parsed, quote);
        assert_eq!(parsed.expected_signature().unwrap(), quote.signature);
    }

    #[test]
    fn test_malformed_quotes_rejected_at_boundary() {
        let quote = attester().generate_quote(b"report").unwrap();
        let mut value = serde_json::to_value(&quote).unwrap();

        let mut missing = value.clone();
        missing.as_object_mut().unwrap().remove("nonce");
        assert!(matches!(
            AttestationQuote::from_json(&missing.to_string()),
            Err(TeeError::MalformedQuote(_))
        ));

        let mut short_measurement = value.clone();
        short_measurement["mr_enclave"] = serde_json::json!("abcd");
        assert!(AttestationQuote::from_json(&short_measurement.to_string()).is_err());

        value["nonce"] = serde_json::json!("not-hex");
        assert!(matches!(
            AttestationQuote::from_json(&value.to_string()),
            Err(TeeError::MalformedQuote(_))
        ));

        assert!(AttestationQuote::from_json("{}").is_err());
        assert!(AttestationQuote::from_json("not json").is_err());
    }
}
