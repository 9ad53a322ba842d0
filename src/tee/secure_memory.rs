//! Secure Memory — the only place private keys live unencrypted
//!
//! Keys enter a slot either by fresh generation or by unsealing a
//! [`SealedBlob`]; they leave only sealed. [`EnclaveKey`] deliberately has no
//! accessor for its private bytes: callers can sign, seal, or read the public
//! half.

use super::enclave::{TeeError, TeeResult};
use super::sealed_storage::{SealPurpose, SealedBlob, SealedStore};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Named slot in secure memory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySlot {
    RootCa,
    Orderer(String),
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySlot::RootCa => f.write_str("root_ca"),
            KeySlot::Orderer(chain) => write!(f, "orderer_{}", chain),
        }
    }
}

/// RSA private key held inside the enclave
pub struct EnclaveKey {
    inner: RsaPrivateKey,
}

impl EnclaveKey {
    pub(crate) fn generate(bits: usize) -> TeeResult<Self> {
        log::info!("Generating {}-bit RSA key pair inside enclave", bits);
        let inner = RsaPrivateKey::new(&mut OsRng, bits)?;
        Ok(Self { inner })
    }

    /// Take ownership of an externally supplied PKCS#8 PEM key
    pub(crate) fn from_pkcs8_pem(pem: &str) -> TeeResult<Self> {
        let inner = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| TeeError::InvalidArgument(format!("not an RSA PKCS#8 key: {}", e)))?;
        inner.validate()?;
        Ok(Self { inner })
    }

    pub fn bits(&self) -> usize {
        self.inner.size() * 8
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.inner.to_public_key()
    }

    pub fn public_key_pem(&self) -> TeeResult<String> {
        self.inner
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| TeeError::Crypto(format!("encode public key: {}", e)))
    }

    /// SubjectPublicKeyInfo DER
    pub fn public_key_der(&self) -> TeeResult<Vec<u8>> {
        self.inner
            .to_public_key()
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| TeeError::Crypto(format!("encode public key: {}", e)))
    }

    /// RSA-PSS / SHA-256 with a random salt; repeated signatures differ
    pub(crate) fn sign_pss(&self, data: &[u8]) -> Vec<u8> {
        let signing_key = BlindedSigningKey::<Sha256>::new(self.inner.clone());
        signing_key.sign_with_rng(&mut OsRng, data).to_vec()
    }

    pub(crate) fn seal(&self, store: &SealedStore) -> TeeResult<SealedBlob> {
        let pem = self.pkcs8_pem()?;
        store.seal_for(SealPurpose::KeyMaterial, pem.as_bytes())
    }

    pub(crate) fn unseal(store: &SealedStore, blob: &SealedBlob) -> TeeResult<Self> {
        let plaintext = Zeroizing::new(store.unseal_for(SealPurpose::KeyMaterial, blob)?);
        let pem = std::str::from_utf8(&plaintext)
            .map_err(|_| TeeError::IntegrityError("unsealed key is not PEM".into()))?;
        let inner = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| TeeError::IntegrityError(format!("unsealed key unreadable: {}", e)))?;
        Ok(Self { inner })
    }

    /// Signing handle for certificate issuance (RSA PKCS#1 v1.5 / SHA-256)
    pub(crate) fn certificate_key_pair(&self) -> TeeResult<rcgen::KeyPair> {
        let pem = self.pkcs8_pem()?;
        Ok(rcgen::KeyPair::from_pem_and_sign_algo(
            &pem,
            &rcgen::PKCS_RSA_SHA256,
        )?)
    }

    fn pkcs8_pem(&self) -> TeeResult<Zeroizing<String>> {
        self.inner
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| TeeError::Crypto(format!("encode private key: {}", e)))
    }
}

impl fmt::Debug for EnclaveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnclaveKey(rsa-{}, <redacted>)", self.bits())
    }
}

/// Verify an RSA-PSS / SHA-256 signature against a SubjectPublicKeyInfo PEM
pub fn verify_pss_signature(public_key_pem: &str, data: &[u8], signature: &[u8]) -> TeeResult<bool> {
    use rsa::pkcs8::DecodePublicKey;

    let public = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| TeeError::InvalidArgument(format!("not an RSA public key: {}", e)))?;
    let signature = match Signature::try_from(signature) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };
    Ok(VerifyingKey::<Sha256>::new(public)
        .verify(data, &signature)
        .is_ok())
}

/// A live key object plus its public companion certificate, if any
#[derive(Debug)]
pub struct KeyObject {
    key: EnclaveKey,
    certificate_pem: Option<String>,
}

impl KeyObject {
    pub fn new(key: EnclaveKey, certificate_pem: Option<String>) -> Self {
        Self {
            key,
            certificate_pem,
        }
    }

    pub fn key(&self) -> &EnclaveKey {
        &self.key
    }

    pub fn certificate_pem(&self) -> Option<&str> {
        self.certificate_pem.as_deref()
    }
}

type SlotCell = Arc<Mutex<Option<Arc<KeyObject>>>>;

/// Access-controlled holder of live key objects, locked per slot
#[derive(Default)]
pub struct SecureMemory {
    slots: RwLock<HashMap<KeySlot, SlotCell>>,
}

impl SecureMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the slot's lock, so check-then-act is atomic
    pub fn with_slot<R>(
        &self,
        slot: &KeySlot,
        f: impl FnOnce(&mut Option<Arc<KeyObject>>) -> R,
    ) -> R {
        let cell = self.cell(slot);
        let mut guard = cell.lock();
        f(&mut guard)
    }

    pub fn put(&self, slot: &KeySlot, object: KeyObject) -> Arc<KeyObject> {
        let object = Arc::new(object);
        self.with_slot(slot, |entry| *entry = Some(Arc::clone(&object)));
        log::debug!("Secure memory slot {} populated", slot);
        object
    }

    pub fn get(&self, slot: &KeySlot) -> Option<Arc<KeyObject>> {
        self.with_slot(slot, |entry| entry.clone())
    }

    pub fn clear(&self, slot: &KeySlot) -> bool {
        let cleared = self.with_slot(slot, |entry| entry.take().is_some());
        if cleared {
            log::debug!("Secure memory slot {} cleared", slot);
        }
        cleared
    }

    pub fn contains(&self, slot: &KeySlot) -> bool {
        self.with_slot(slot, |entry| entry.is_some())
    }

    /// Slots currently holding a key, sorted
    pub fn resident_slots(&self) -> Vec<KeySlot> {
        let cells: Vec<(KeySlot, SlotCell)> = self
            .slots
            .read()
            .iter()
            .map(|(slot, cell)| (slot.clone(), Arc::clone(cell)))
            .collect();
        let mut resident: Vec<KeySlot> = cells
            .into_iter()
            .filter(|(_, cell)| cell.lock().is_some())
            .map(|(slot, _)| slot)
            .collect();
        resident.sort();
        resident
    }

    fn cell(&self, slot: &KeySlot) -> SlotCell {
        if let Some(cell) = self.slots.read().get(slot) {
            return Arc::clone(cell);
        }
        Arc::clone(self.slots.write().entry(slot.clone()).or_default())
    }
}

impl fmt::Debug for SecureMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureMemory")
            .field("resident", &self.resident_slots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::enclave::EnclaveIdentity;
    use std::sync::OnceLock;

    // 2048-bit generation is the slow part of these tests; share one key.
    fn test_key_pem() -> &'static str {
        static PEM: OnceLock<String> = OnceLock::new();
        PEM.get_or_init(|| {
            let key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
            key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
        })
    }

    fn test_key() -> EnclaveKey {
        EnclaveKey::from_pkcs8_pem(test_key_pem()).unwrap()
    }

    #[test]
    fn test_put_get_returns_same_instance() {
        let memory = SecureMemory::new();
        let put = memory.put(&KeySlot::RootCa, KeyObject::new(test_key(), None));
        let got = memory.get(&KeySlot::RootCa).unwrap();
        assert!(Arc::ptr_eq(&put, &got));
        assert!(memory.get(&KeySlot::Orderer("hot".into())).is_none());
    }

    #[test]
    fn test_clear_slot() {
        let memory = SecureMemory::new();
        let slot = KeySlot::Orderer("cold".into());
        memory.put(&slot, KeyObject::new(test_key(), None));
        assert_eq!(memory.resident_slots(), vec![slot.clone()]);
        assert!(memory.clear(&slot));
        assert!(!memory.clear(&slot));
        assert!(!memory.contains(&slot));
        assert!(memory.resident_slots().is_empty());
    }

    #[test]
    fn test_with_slot_is_exclusive() {
        let memory = Arc::new(SecureMemory::new());
        let winners: usize = (0..8)
            .map(|_| {
                let memory = Arc::clone(&memory);
                std::thread::spawn(move || {
                    memory.with_slot(&KeySlot::RootCa, |entry| {
                        if entry.is_some() {
                            return 0;
                        }
                        *entry = Some(Arc::new(KeyObject::new(test_key(), None)));
                        1
                    })
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_key_seal_roundtrip() {
        let store = SealedStore::new(&EnclaveIdentity::simulated()).unwrap();
        let key = test_key();
        let blob = key.seal(&store).unwrap();
        let restored = EnclaveKey::unseal(&store, &blob).unwrap();
        assert_eq!(restored.public_key(), key.public_key());

        // The public unseal verb refuses key material
        assert!(store.unseal(&blob).is_err());
    }

    #[test]
    fn test_pss_signatures_randomized_and_verifiable() {
        let key = test_key();
        let pem = key.public_key_pem().unwrap();
        let a = key.sign_pss(b"block-1");
        let b = key.sign_pss(b"block-1");
        assert_ne!(a, b);
        assert!(verify_pss_signature(&pem, b"block-1", &a).unwrap());
        assert!(verify_pss_signature(&pem, b"block-1", &b).unwrap());
        assert!(!verify_pss_signature(&pem, b"block-2", &a).unwrap());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = test_key();
        let dbg = format!("{:?}", KeyObject::new(key, None));
        assert!(dbg.contains("redacted"));
        assert!(!dbg.contains("PRIVATE"));
    }
}
