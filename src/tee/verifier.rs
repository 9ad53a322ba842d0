//! Remote attestation verifier
//!
//! Runs outside the enclave and shares nothing with the attester except the
//! quote itself. Each relying organization constructs its own verifier with
//! its own [`TrustPolicy`].

use super::attestation::AttestationQuote;
use super::enclave::{Measurement, TcbLevel, TeeError, TeeResult};
use crate::storage::write_atomic;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

/// Default maximum quote age (5 minutes)
pub const DEFAULT_MAX_QUOTE_AGE_SECS: i64 = 300;

/// Allow-lists and thresholds deciding whether a quote is accepted
///
/// Empty allow-lists mean *permissive* mode: any measurement passes. That is
/// reported separately from an enforced pass in every result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
    #[serde(default)]
    pub allowed_mr_enclaves: BTreeSet<Measurement>,
    #[serde(default)]
    pub allowed_mr_signers: BTreeSet<Measurement>,
    #[serde(default = "default_minimum_tcb")]
    pub minimum_tcb_level: TcbLevel,
    #[serde(default = "default_max_quote_age")]
    pub max_quote_age_seconds: i64,
}

fn default_minimum_tcb() -> TcbLevel {
    TcbLevel(1)
}

fn default_max_quote_age() -> i64 {
    DEFAULT_MAX_QUOTE_AGE_SECS
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            allowed_mr_enclaves: BTreeSet::new(),
            allowed_mr_signers: BTreeSet::new(),
            minimum_tcb_level: default_minimum_tcb(),
            max_quote_age_seconds: default_max_quote_age(),
        }
    }
}

impl TrustPolicy {
    /// Policy trusting exactly one enclave identity
    pub fn trusting(mr_enclave: Measurement, mr_signer: Measurement) -> Self {
        let mut policy = Self::default();
        policy.add_trusted_measurement(mr_enclave, mr_signer);
        policy
    }

    pub fn is_permissive(&self) -> bool {
        self.allowed_mr_enclaves.is_empty() || self.allowed_mr_signers.is_empty()
    }

    /// Idempotent: returns true if either list changed
    pub fn add_trusted_measurement(&mut self, mr_enclave: Measurement, mr_signer: Measurement) -> bool {
        let a = self.allowed_mr_enclaves.insert(mr_enclave);
        let b = self.allowed_mr_signers.insert(mr_signer);
        a || b
    }

    pub fn load(path: impl AsRef<Path>) -> TeeResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let policy: TrustPolicy = serde_json::from_str(&json)
            .map_err(|e| TeeError::Config(format!("invalid attestation policy: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> TeeResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path.as_ref(), json.as_bytes())
    }

    pub fn validate(&self) -> TeeResult<()> {
        if self.max_quote_age_seconds < 0 {
            return Err(TeeError::Config(format!(
                "max_quote_age_seconds must not be negative, got {}",
                self.max_quote_age_seconds
            )));
        }
        Ok(())
    }
}

/// Why a quote was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationFailure {
    MalformedQuote,
    SignatureInvalid,
    MeasurementNotTrusted,
    SignerNotTrusted,
    TrustLevelTooLow,
    QuoteExpired,
    QuoteFromFuture,
    NonceReplayed,
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerificationFailure::MalformedQuote => "MalformedQuote",
            VerificationFailure::SignatureInvalid => "SignatureInvalid",
            VerificationFailure::MeasurementNotTrusted => "MeasurementNotTrusted",
            VerificationFailure::SignerNotTrusted => "SignerNotTrusted",
            VerificationFailure::TrustLevelTooLow => "TrustLevelTooLow",
            VerificationFailure::QuoteExpired => "QuoteExpired",
            VerificationFailure::QuoteFromFuture => "QuoteFromFuture",
            VerificationFailure::NonceReplayed => "NonceReplayed",
        };
        f.write_str(s)
    }
}

/// Per-check outcome, in check order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationChecks {
    pub signature_valid: bool,
    pub mrenclave_trusted: bool,
    /// Passed only because the MRENCLAVE allow-list is empty
    pub mrenclave_permissive: bool,
    pub mrsigner_trusted: bool,
    /// Passed only because the MRSIGNER allow-list is empty
    pub mrsigner_permissive: bool,
    pub tcb_acceptable: bool,
    pub timestamp_fresh: bool,
    /// `None` when replay protection is off
    pub nonce_unique: Option<bool>,
}

/// Identity established by a successful verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub mr_enclave: Measurement,
    pub mr_signer: Measurement,
    pub tcb_level: TcbLevel,
    pub quote_age_seconds: i64,
}

/// Typed verification outcome. Callers branch on `valid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub reason: String,
    pub failure: Option<VerificationFailure>,
    pub checks: VerificationChecks,
    pub verified_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enclave_identity: Option<VerifiedIdentity>,
}

impl VerificationResult {
    fn rejected(
        failure: VerificationFailure,
        reason: String,
        checks: VerificationChecks,
        now: DateTime<Utc>,
    ) -> Self {
        log::warn!("Attestation rejected ({}): {}", failure, reason);
        Self {
            valid: false,
            reason,
            failure: Some(failure),
            checks,
            verified_at: now,
            enclave_identity: None,
        }
    }

    pub fn to_json(&self) -> TeeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Nonces seen within the freshness window
#[derive(Debug, Default)]
struct ReplayCache {
    seen: HashMap<String, i64>,
}

impl ReplayCache {
    /// Returns false if the nonce was already seen; otherwise records it
    fn check_and_record(&mut self, nonce: &str, timestamp: i64, now: i64, window: i64) -> bool {
        self.seen.retain(|_, ts| now.saturating_sub(*ts) <= window);
        if self.seen.contains_key(nonce) {
            return false;
        }
        self.seen.insert(nonce.to_string(), timestamp);
        true
    }
}

/// Independent attestation verifier
#[derive(Debug)]
pub struct AttestationVerifier {
    policy: RwLock<TrustPolicy>,
    replay: Option<Mutex<ReplayCache>>,
}

impl AttestationVerifier {
    pub fn new(policy: TrustPolicy) -> Self {
        if policy.is_permissive() {
            log::warn!("Attestation verifier running in permissive mode (empty allow-list accepts all)");
        }
        log::info!(
            "Attestation verifier: {} trusted MRENCLAVEs, {} trusted MRSIGNERs, min TCB {}, max age {}s",
            policy.allowed_mr_enclaves.len(),
            policy.allowed_mr_signers.len(),
            policy.minimum_tcb_level,
            policy.max_quote_age_seconds
        );
        Self {
            policy: RwLock::new(policy),
            replay: None,
        }
    }

    /// Verifier with the default, permissive policy
    pub fn permissive() -> Self {
        Self::new(TrustPolicy::default())
    }

    /// Load the policy file, or fall back to permissive mode if it does not exist
    pub fn from_policy_file(path: impl AsRef<Path>) -> TeeResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Ok(Self::new(TrustPolicy::load(path)?))
        } else {
            log::warn!("No policy file at {} - using permissive mode", path.display());
            Ok(Self::permissive())
        }
    }

    /// Reject nonces already seen within the freshness window
    pub fn with_replay_protection(mut self) -> Self {
        self.replay = Some(Mutex::new(ReplayCache::default()));
        self
    }

    /// Snapshot of the current policy
    pub fn policy(&self) -> TrustPolicy {
        self.policy.read().clone()
    }

    pub fn add_trusted_measurement(&self, mr_enclave: Measurement, mr_signer: Measurement) -> bool {
        let changed = self
            .policy
            .write()
            .add_trusted_measurement(mr_enclave, mr_signer);
        if changed {
            log::info!(
                "Trusted measurement added: MRENCLAVE {}..., MRSIGNER {}...",
                mr_enclave.short(),
                mr_signer.short()
            );
        }
        changed
    }

    pub fn save_policy(&self, path: impl AsRef<Path>) -> TeeResult<()> {
        self.policy.read().save(path)
    }

    pub fn verify_quote(&self, quote: &AttestationQuote) -> VerificationResult {
        self.verify_quote_at(quote, Utc::now())
    }

    /// Parse a wire-format quote and verify it; malformed input is a rejection
    pub fn verify_quote_json(&self, json: &str) -> VerificationResult {
        match AttestationQuote::from_json(json) {
            Ok(quote) => self.verify_quote(&quote),
            Err(e) => VerificationResult::rejected(
                VerificationFailure::MalformedQuote,
                e.to_string(),
                VerificationChecks::default(),
                Utc::now(),
            ),
        }
    }

    pub fn verify_quote_at(&self, quote: &AttestationQuote, now: DateTime<Utc>) -> VerificationResult {
        use VerificationFailure::*;

        // Held for the whole decision so the allow-lists cannot change mid-check
        let policy = self.policy.read();
        let mut checks = VerificationChecks::default();

        // 1. Signature
        match quote.expected_signature() {
            Ok(expected) if expected == quote.signature => checks.signature_valid = true,
            Ok(_) => {
                return VerificationResult::rejected(
                    SignatureInvalid,
                    "Signature verification failed".into(),
                    checks,
                    now,
                )
            }
            Err(e) => {
                return VerificationResult::rejected(
                    SignatureInvalid,
                    format!("Signature verification error: {}", e),
                    checks,
                    now,
                )
            }
        }

        // 2. Code measurement
        if policy.allowed_mr_enclaves.is_empty() {
            checks.mrenclave_trusted = true;
            checks.mrenclave_permissive = true;
            log::warn!(
                "MRENCLAVE {}... accepted without enforcement (permissive policy)",
                quote.mr_enclave.short()
            );
        } else if policy.allowed_mr_enclaves.contains(&quote.mr_enclave) {
            checks.mrenclave_trusted = true;
        } else {
            return VerificationResult::rejected(
                MeasurementNotTrusted,
                format!("MREnclave not in trusted policy: {}...", quote.mr_enclave.short()),
                checks,
                now,
            );
        }

        // 3. Signer measurement
        if policy.allowed_mr_signers.is_empty() {
            checks.mrsigner_trusted = true;
            checks.mrsigner_permissive = true;
            log::warn!(
                "MRSIGNER {}... accepted without enforcement (permissive policy)",
                quote.mr_signer.short()
            );
        } else if policy.allowed_mr_signers.contains(&quote.mr_signer) {
            checks.mrsigner_trusted = true;
        } else {
            return VerificationResult::rejected(
                SignerNotTrusted,
                format!("MRSigner not in trusted policy: {}...", quote.mr_signer.short()),
                checks,
                now,
            );
        }

        // 4. TCB level
        if quote.tcb_level >= policy.minimum_tcb_level {
            checks.tcb_acceptable = true;
        } else {
            return VerificationResult::rejected(
                TrustLevelTooLow,
                format!(
                    "TCB level {} below minimum {}",
                    quote.tcb_level, policy.minimum_tcb_level
                ),
                checks,
                now,
            );
        }

        // 5. Freshness
        // An unrepresentable age (timestamp near i64::MIN) counts as expired
        let age = now.timestamp().checked_sub(quote.timestamp).unwrap_or(i64::MAX);
        if age < 0 {
            return VerificationResult::rejected(
                QuoteFromFuture,
                format!("Quote timestamp is {}s in the future", -age),
                checks,
                now,
            );
        }
        if age > policy.max_quote_age_seconds {
            return VerificationResult::rejected(
                QuoteExpired,
                format!(
                    "Quote too old: {}s (max {}s)",
                    age, policy.max_quote_age_seconds
                ),
                checks,
                now,
            );
        }
        checks.timestamp_fresh = true;

        // 6. Replay (opt-in)
        if let Some(replay) = &self.replay {
            let unique = replay.lock().check_and_record(
                &quote.nonce,
                quote.timestamp,
                now.timestamp(),
                policy.max_quote_age_seconds,
            );
            checks.nonce_unique = Some(unique);
            if !unique {
                return VerificationResult::rejected(
                    NonceReplayed,
                    format!("Quote nonce {} already presented", quote.nonce),
                    checks,
                    now,
                );
            }
        }

        let permissive = checks.mrenclave_permissive || checks.mrsigner_permissive;
        let reason = if permissive {
            "Attestation verified (permissive policy: measurements not enforced)"
        } else {
            "Attestation verified successfully"
        };
        log::info!(
            "Attestation verified: MRENCLAVE {}..., TCB {}, age {}s{}",
            quote.mr_enclave.short(),
            quote.tcb_level,
            age,
            if permissive { " [permissive]" } else { "" }
        );

        VerificationResult {
            valid: true,
            reason: reason.to_string(),
            failure: None,
            checks,
            verified_at: now,
            enclave_identity: Some(VerifiedIdentity {
                mr_enclave: quote.mr_enclave,
                mr_signer: quote.mr_signer,
                tcb_level: quote.tcb_level,
                quote_age_seconds: age,
            }),
        }
    }
}
