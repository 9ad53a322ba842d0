//! Async facade over the enclave components
//!
//! [`EnclaveService`] owns one enclave instance: its identity, secure memory,
//! CA, attester, verifier and orderer keys. RSA generation, signing and
//! sealing are CPU-bound, so every verb runs on the blocking pool, bounded by
//! a semaphore sized from `max_concurrent_jobs`.

use crate::ca::{CertType, CertificateAuthority};
use crate::config::EnclaveConfig;
use crate::orderer::OrdererKeyService;
use crate::storage::DataDir;
use crate::tee::{
    AttestationAttester, AttestationQuote, AttestationVerifier, EnclaveIdentity, KeySlot,
    Measurement, SealedBlob, SealedStore, SecureMemory, TcbLevel, TeeError, TeeResult,
    TrustPolicy, VerificationResult,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Snapshot of the enclave's state for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveInfo {
    pub name: String,
    pub version: String,
    pub mr_enclave: Measurement,
    pub mr_signer: Measurement,
    pub tcb_level: TcbLevel,
    pub data_dir: PathBuf,
    pub root_ca_initialized: bool,
    pub sealed_files: Vec<String>,
    pub resident_slots: Vec<String>,
    pub policy_permissive: bool,
    pub replay_protection: bool,
    pub quotes_logged: usize,
}

pub struct EnclaveService {
    identity: EnclaveIdentity,
    data: DataDir,
    sealer: Arc<SealedStore>,
    memory: Arc<SecureMemory>,
    ca: Arc<CertificateAuthority>,
    orderer: Arc<OrdererKeyService>,
    attester: Arc<AttestationAttester>,
    verifier: Arc<AttestationVerifier>,
    policy_path: PathBuf,
    replay_protection: bool,
    jobs: Arc<Semaphore>,
}

impl EnclaveService {
    pub fn new(config: &EnclaveConfig) -> TeeResult<Self> {
        config.validate()?;
        let identity = config.identity();
        let data = DataDir::open(&config.data_dir)?;
        let sealer = Arc::new(SealedStore::new(&identity)?);
        let memory = Arc::new(SecureMemory::new());

        let ca = CertificateAuthority::new(
            data.clone(),
            Arc::clone(&sealer),
            Arc::clone(&memory),
            config.root_ca.clone(),
            config.root_ca_key_bits,
        );
        let orderer = OrdererKeyService::new(
            data.clone(),
            Arc::clone(&sealer),
            Arc::clone(&memory),
            config.orderer_key_bits,
        );

        let policy_path = config.policy_path();
        let mut policy = if policy_path.exists() {
            TrustPolicy::load(&policy_path)?
        } else {
            log::warn!(
                "No policy file at {} - using permissive mode",
                policy_path.display()
            );
            TrustPolicy::default()
        };
        config.apply_policy_overrides(&mut policy);
        policy.validate()?;
        let mut verifier = AttestationVerifier::new(policy);
        if config.attestation.replay_protection {
            verifier = verifier.with_replay_protection();
        }

        log::info!(
            "Enclave {} v{} ready: MRENCLAVE {}..., MRSIGNER {}..., TCB {}, data dir {}",
            identity.name,
            identity.version,
            identity.measurements().mr_enclave.short(),
            identity.measurements().mr_signer.short(),
            identity.tcb_level,
            data.root().display()
        );

        Ok(Self {
            attester: Arc::new(AttestationAttester::new(identity.clone())),
            identity,
            data,
            sealer,
            memory,
            ca: Arc::new(ca),
            orderer: Arc::new(orderer),
            verifier: Arc::new(verifier),
            policy_path,
            replay_protection: config.attestation.replay_protection,
            jobs: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
        })
    }

    pub fn identity(&self) -> &EnclaveIdentity {
        &self.identity
    }

    pub fn certificate_authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn orderer(&self) -> &OrdererKeyService {
        &self.orderer
    }

    pub fn verifier(&self) -> &AttestationVerifier {
        &self.verifier
    }

    /// Generate the Root CA; returns its certificate PEM
    pub async fn init_root_ca(&self) -> TeeResult<String> {
        let ca = Arc::clone(&self.ca);
        self.run_blocking(move || ca.init_root_ca().map(|(pem, _)| pem))
            .await
    }

    pub async fn load_root_ca(&self) -> TeeResult<()> {
        let ca = Arc::clone(&self.ca);
        self.run_blocking(move || ca.load_root_ca()).await
    }

    pub async fn root_certificate_pem(&self) -> TeeResult<String> {
        let ca = Arc::clone(&self.ca);
        self.run_blocking(move || ca.root_certificate_pem()).await
    }

    pub async fn sign_certificate(
        &self,
        csr_pem: &str,
        cert_type: CertType,
        validity_days: Option<u32>,
    ) -> TeeResult<String> {
        let ca = Arc::clone(&self.ca);
        let csr_pem = csr_pem.to_string();
        self.run_blocking(move || ca.sign_certificate(&csr_pem, cert_type, validity_days))
            .await
    }

    /// Seal arbitrary data; returns the `nonce ‖ ciphertext ‖ tag` blob
    pub async fn seal(&self, plaintext: Vec<u8>) -> TeeResult<Vec<u8>> {
        let sealer = Arc::clone(&self.sealer);
        self.run_blocking(move || sealer.seal(&plaintext).map(|blob| blob.to_bytes()))
            .await
    }

    pub async fn unseal(&self, sealed: Vec<u8>) -> TeeResult<Vec<u8>> {
        let sealer = Arc::clone(&self.sealer);
        self.run_blocking(move || sealer.unseal(&SealedBlob::from_bytes(&sealed)?))
            .await
    }

    /// Quote JSON over `report_data`; each quote is recorded in the attestation log
    pub async fn generate_quote(&self, report_data: Vec<u8>) -> TeeResult<String> {
        let attester = Arc::clone(&self.attester);
        let data = self.data.clone();
        self.run_blocking(move || {
            let quote = attester.generate_quote(&report_data)?;
            data.append_attestation_log(&quote.log_entry())?;
            quote.to_json()
        })
        .await
    }

    /// Verification result JSON; a rejected quote is `Ok` with `valid = false`
    pub async fn verify_quote(&self, quote_json: &str) -> TeeResult<String> {
        self.verify_quote_result(quote_json).await?.to_json()
    }

    pub async fn verify_quote_result(&self, quote_json: &str) -> TeeResult<VerificationResult> {
        let verifier = Arc::clone(&self.verifier);
        let quote_json = quote_json.to_string();
        self.run_blocking(move || Ok(verifier.verify_quote_json(&quote_json)))
            .await
    }

    /// Add the quote's measurements to the trust policy and persist it
    ///
    /// The quote must carry a valid signature; freshness is not required.
    pub async fn trust_quote(&self, quote_json: &str) -> TeeResult<bool> {
        let verifier = Arc::clone(&self.verifier);
        let policy_path = self.policy_path.clone();
        let quote_json = quote_json.to_string();
        self.run_blocking(move || {
            let quote = AttestationQuote::from_json(&quote_json)?;
            if quote.signature != quote.expected_signature()? {
                return Err(TeeError::MalformedQuote(
                    "quote signature does not match its contents".into(),
                ));
            }
            let changed = verifier.add_trusted_measurement(quote.mr_enclave, quote.mr_signer);
            if changed {
                verifier.save_policy(&policy_path)?;
            }
            Ok(changed)
        })
        .await
    }

    /// Generate and seal an orderer key; returns its public PEM
    pub async fn generate_orderer_key(&self, chain_id: &str) -> TeeResult<String> {
        let orderer = Arc::clone(&self.orderer);
        let chain_id = chain_id.to_string();
        self.run_blocking(move || orderer.generate_key(&chain_id)).await
    }

    pub async fn orderer_public_key(&self, chain_id: &str) -> TeeResult<String> {
        let orderer = Arc::clone(&self.orderer);
        let chain_id = chain_id.to_string();
        self.run_blocking(move || orderer.public_key_pem(&chain_id)).await
    }

    /// Seal an existing PKCS#8 orderer key under `chain_id`; returns its public PEM
    pub async fn import_orderer_key(&self, chain_id: &str, pkcs8_pem: &str) -> TeeResult<String> {
        let orderer = Arc::clone(&self.orderer);
        let chain_id = chain_id.to_string();
        let pkcs8_pem = pkcs8_pem.to_string();
        self.run_blocking(move || orderer.import_key(&chain_id, &pkcs8_pem))
            .await
    }

    pub async fn sign_block(&self, chain_id: &str, block: Vec<u8>) -> TeeResult<Vec<u8>> {
        let orderer = Arc::clone(&self.orderer);
        let chain_id = chain_id.to_string();
        self.run_blocking(move || orderer.sign_block(&chain_id, &block))
            .await
    }

    /// The CA check can wait on a Root CA generation, so it runs off the async thread
    pub async fn info(&self) -> TeeResult<EnclaveInfo> {
        let ca = Arc::clone(&self.ca);
        let memory = Arc::clone(&self.memory);
        let verifier = Arc::clone(&self.verifier);
        let data = self.data.clone();
        let name = self.identity.name.clone();
        let version = self.identity.version.clone();
        let measurements = *self.identity.measurements();
        let tcb_level = self.identity.tcb_level;
        let replay_protection = self.replay_protection;
        self.run_blocking(move || {
            Ok(EnclaveInfo {
                name,
                version,
                mr_enclave: measurements.mr_enclave,
                mr_signer: measurements.mr_signer,
                tcb_level,
                data_dir: data.root().to_path_buf(),
                root_ca_initialized: ca.is_initialized(),
                sealed_files: data.sealed_files()?,
                resident_slots: memory
                    .resident_slots()
                    .iter()
                    .map(KeySlot::to_string)
                    .collect(),
                policy_permissive: verifier.policy().is_permissive(),
                replay_protection,
                quotes_logged: data.read_attestation_log()?.len(),
            })
        })
        .await
    }

    async fn run_blocking<R, F>(&self, f: F) -> TeeResult<R>
    where
        F: FnOnce() -> TeeResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.jobs)
            .acquire_owned()
            .await
            .map_err(|e| TeeError::Io(std::io::Error::other(e)))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| TeeError::Io(std::io::Error::other(format!("enclave task failed: {}", e))))?
    }
}
