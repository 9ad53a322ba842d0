//! Orderer signing keys, one per chain
//!
//! Each chain (`hot`, `cold`, ...) owns an RSA key that is sealed to
//! `orderer_<chain>_key.sealed` and unsealed into secure memory on first use.

use crate::storage::DataDir;
use crate::tee::{
    verify_pss_signature, EnclaveKey, KeyObject, KeySlot, SealedStore, SecureMemory, TeeError,
    TeeResult,
};
use std::sync::Arc;

pub struct OrdererKeyService {
    data: DataDir,
    sealer: Arc<SealedStore>,
    memory: Arc<SecureMemory>,
    key_bits: usize,
}

impl OrdererKeyService {
    pub fn new(
        data: DataDir,
        sealer: Arc<SealedStore>,
        memory: Arc<SecureMemory>,
        key_bits: usize,
    ) -> Self {
        Self {
            data,
            sealer,
            memory,
            key_bits,
        }
    }

    /// Generate and seal a fresh key for `chain_id`, returning its public PEM
    pub fn generate_key(&self, chain_id: &str) -> TeeResult<String> {
        validate_chain_id(chain_id)?;
        self.install(chain_id, || EnclaveKey::generate(self.key_bits))
    }

    /// Seal an externally generated PKCS#8 key for `chain_id`
    pub fn import_key(&self, chain_id: &str, pkcs8_pem: &str) -> TeeResult<String> {
        validate_chain_id(chain_id)?;
        self.install(chain_id, || EnclaveKey::from_pkcs8_pem(pkcs8_pem))
    }

    /// RSA-PSS / SHA-256 signature over `block` with the chain's key
    pub fn sign_block(&self, chain_id: &str, block: &[u8]) -> TeeResult<Vec<u8>> {
        let object = self.resident(chain_id)?;
        let signature = object.key().sign_pss(block);
        log::debug!(
            "Signed {}-byte block for chain {} ({} byte signature)",
            block.len(),
            chain_id,
            signature.len()
        );
        Ok(signature)
    }

    pub fn public_key_pem(&self, chain_id: &str) -> TeeResult<String> {
        self.resident(chain_id)?.key().public_key_pem()
    }

    /// Chains with a sealed key on disk, sorted
    pub fn chains(&self) -> TeeResult<Vec<String>> {
        Ok(self
            .data
            .sealed_files()?
            .into_iter()
            .filter_map(|name| {
                name.strip_prefix("orderer_")
                    .and_then(|rest| rest.strip_suffix("_key.sealed"))
                    .map(str::to_string)
            })
            .collect())
    }

    fn install(
        &self,
        chain_id: &str,
        make_key: impl FnOnce() -> TeeResult<EnclaveKey>,
    ) -> TeeResult<String> {
        let path = self.data.orderer_key_path(chain_id);
        self.memory
            .with_slot(&KeySlot::Orderer(chain_id.to_string()), |entry| {
                if entry.is_some() || path.exists() {
                    return Err(TeeError::AlreadyInitialized(format!(
                        "orderer key for chain '{}' already exists",
                        chain_id
                    )));
                }

                let key = make_key()?;
                let public_pem = key.public_key_pem()?;
                let sealed = key.seal(&self.sealer)?;
                self.data.write_sealed(&path, &sealed)?;
                *entry = Some(Arc::new(KeyObject::new(key, None)));

                log::info!(
                    "Orderer key for chain {} sealed to {}",
                    chain_id,
                    path.display()
                );
                Ok(public_pem)
            })
    }

    /// Resident key for the chain, unsealing it from disk on first use
    fn resident(&self, chain_id: &str) -> TeeResult<Arc<KeyObject>> {
        validate_chain_id(chain_id)?;
        let path = self.data.orderer_key_path(chain_id);
        self.memory
            .with_slot(&KeySlot::Orderer(chain_id.to_string()), |entry| {
                if let Some(object) = entry {
                    return Ok(Arc::clone(object));
                }
                let sealed = self.data.read_sealed(&path)?.ok_or_else(|| {
                    TeeError::KeyNotFound(format!("no orderer key for chain '{}'", chain_id))
                })?;
                let key = EnclaveKey::unseal(&self.sealer, &sealed)?;
                let object = Arc::new(KeyObject::new(key, None));
                *entry = Some(Arc::clone(&object));
                log::info!("Orderer key for chain {} unsealed into secure memory", chain_id);
                Ok(object)
            })
    }
}

/// Check `signature` over `block` against an orderer's public key PEM
pub fn verify_block_signature(
    public_key_pem: &str,
    block: &[u8],
    signature: &[u8],
) -> TeeResult<bool> {
    verify_pss_signature(public_key_pem, block, signature)
}

fn validate_chain_id(chain_id: &str) -> TeeResult<()> {
    let valid = !chain_id.is_empty()
        && chain_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TeeError::InvalidArgument(format!(
            "invalid chain id '{}': use letters, digits, '-' or '_'",
            chain_id
        )))
    }
}
