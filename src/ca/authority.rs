//! Root Certificate Authority held inside the enclave
//!
//! The Root CA private key is generated in secure memory and leaves it only
//! sealed. Issuance turns a CSR into a certificate profiled by [`CertType`].

use super::profile::CertType;
use crate::config::RootCaSubject;
use crate::storage::DataDir;
use crate::tee::{
    EnclaveKey, KeyObject, KeySlot, SealedBlob, SealedStore, SecureMemory, TeeError, TeeResult,
};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, Ia5String, IsCa, KeyIdMethod,
    KeyUsagePurpose, SanType, SerialNumber,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::{parse_x509_pem, Pem};
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

/// Root CA validity (10 years)
pub const ROOT_CA_VALIDITY_DAYS: i64 = 3650;
/// Serial number length in bytes
const SERIAL_LEN: usize = 16;

/// Summary of an issued certificate checked against the Root CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: i64,
    pub not_after: i64,
    pub is_ca: bool,
}

pub struct CertificateAuthority {
    data: DataDir,
    sealer: Arc<SealedStore>,
    memory: Arc<SecureMemory>,
    subject: RootCaSubject,
    key_bits: usize,
}

impl CertificateAuthority {
    pub fn new(
        data: DataDir,
        sealer: Arc<SealedStore>,
        memory: Arc<SecureMemory>,
        subject: RootCaSubject,
        key_bits: usize,
    ) -> Self {
        Self {
            data,
            sealer,
            memory,
            subject,
            key_bits,
        }
    }

    /// Root CA present in memory or on disk
    pub fn is_initialized(&self) -> bool {
        self.memory.contains(&KeySlot::RootCa)
            || self.data.root_ca_key_path().exists()
            || self.data.root_ca_cert_path().exists()
    }

    /// Generate the Root CA inside the enclave
    ///
    /// The existence check, generation, persistence and insertion all happen
    /// under the Root CA slot lock, so two concurrent calls cannot both succeed.
    pub fn init_root_ca(&self) -> TeeResult<(String, SealedBlob)> {
        let key_path = self.data.root_ca_key_path();
        let cert_path = self.data.root_ca_cert_path();

        self.memory.with_slot(&KeySlot::RootCa, |entry| {
            if entry.is_some() || key_path.exists() || cert_path.exists() {
                return Err(TeeError::AlreadyInitialized(format!(
                    "Root CA already exists in {}",
                    self.data.root().display()
                )));
            }

            let key = EnclaveKey::generate(self.key_bits)?;
            let (cert_pem, serial) = self.build_root_certificate(&key)?;
            let sealed = key.seal(&self.sealer)?;

            self.data.write_sealed(&key_path, &sealed)?;
            if let Err(e) = self.data.write_text(&cert_path, &cert_pem) {
                let _ = std::fs::remove_file(&key_path);
                return Err(e);
            }

            *entry = Some(Arc::new(KeyObject::new(key, Some(cert_pem.clone()))));
            log::info!(
                "Root CA generated and sealed: serial {}, key {}",
                serial,
                key_path.display()
            );
            Ok((cert_pem, sealed))
        })
    }

    /// Unseal the persisted Root CA into secure memory
    pub fn load_root_ca(&self) -> TeeResult<()> {
        let key_path = self.data.root_ca_key_path();
        let cert_path = self.data.root_ca_cert_path();

        self.memory.with_slot(&KeySlot::RootCa, |entry| {
            let sealed = self.data.read_sealed(&key_path)?.ok_or_else(|| {
                TeeError::NotInitialized(format!("sealed Root CA key missing: {}", key_path.display()))
            })?;
            let cert_pem = self.data.read_text(&cert_path)?.ok_or_else(|| {
                TeeError::NotInitialized(format!(
                    "Root CA certificate missing: {}",
                    cert_path.display()
                ))
            })?;

            let key = EnclaveKey::unseal(&self.sealer, &sealed)?;
            check_key_matches_certificate(&key, &cert_pem)?;

            *entry = Some(Arc::new(KeyObject::new(key, Some(cert_pem))));
            log::info!("Root CA loaded into enclave secure memory");
            Ok(())
        })
    }

    /// Public Root CA certificate (PEM)
    pub fn root_certificate_pem(&self) -> TeeResult<String> {
        if let Some(object) = self.memory.get(&KeySlot::RootCa) {
            if let Some(pem) = object.certificate_pem() {
                return Ok(pem.to_string());
            }
        }
        self.data
            .read_text(&self.data.root_ca_cert_path())?
            .ok_or_else(|| TeeError::NotInitialized("Root CA not initialized".into()))
    }

    /// Issue a certificate for `csr_pem` under the profile of `cert_type`
    pub fn sign_certificate(
        &self,
        csr_pem: &str,
        cert_type: CertType,
        validity_days: Option<u32>,
    ) -> TeeResult<String> {
        let validity_days = validity_days.unwrap_or_else(|| cert_type.default_validity_days());
        if validity_days == 0 {
            return Err(TeeError::InvalidArgument("validity_days must be positive".into()));
        }

        let root = self.resident_root()?;
        let request = parse_csr(csr_pem)?;

        // Only the subject, public key and SANs are taken from the request
        let mut params = CertificateParams::default();
        params.distinguished_name = request.subject;
        params.subject_alt_names = request.subject_alt_names;
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(i64::from(validity_days));
        let serial = random_serial();
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.use_authority_key_identifier_extension = true;
        params.key_identifier_method = KeyIdMethod::Sha256;
        cert_type.apply(&mut params);

        let issuer_key = root.key().certificate_key_pair()?;
        let issuer_pem = root
            .certificate_pem()
            .ok_or_else(|| TeeError::NotInitialized("Root CA certificate not resident".into()))?;
        let issuer = CertificateParams::from_ca_cert_pem(issuer_pem)?.self_signed(&issuer_key)?;
        let cert = params.signed_by(&request.public_key, &issuer, &issuer_key)?;
        let subject_cn = request.common_name;

        log::info!(
            "Issued {} certificate for CN={} (serial {}, {} days)",
            cert_type,
            subject_cn,
            hex::encode(serial),
            validity_days
        );
        Ok(cert.pem())
    }

    /// Check an issued certificate against the Root CA: signature, issuer, validity
    pub fn verify_issued(&self, cert_pem: &str) -> TeeResult<IssuedCertificate> {
        let root_pem = self.root_certificate_pem()?;
        let root_block = pem_block(&root_pem)?;
        let root = parse_certificate(&root_block)?;
        let leaf_block = pem_block(cert_pem)?;
        let leaf = parse_certificate(&leaf_block)?;

        leaf.verify_signature(Some(root.public_key())).map_err(|e| {
            TeeError::Certificate(format!("signature does not verify against Root CA: {}", e))
        })?;
        if leaf.issuer().as_raw() != root.subject().as_raw() {
            return Err(TeeError::Certificate(format!(
                "issuer mismatch: {} is not {}",
                leaf.issuer(),
                root.subject()
            )));
        }
        if !leaf.validity().is_valid() {
            return Err(TeeError::Certificate("certificate outside its validity window".into()));
        }

        Ok(IssuedCertificate {
            subject: leaf.subject().to_string(),
            issuer: leaf.issuer().to_string(),
            serial: leaf.tbs_certificate.raw_serial_as_string(),
            not_before: leaf.validity().not_before.timestamp(),
            not_after: leaf.validity().not_after.timestamp(),
            is_ca: leaf
                .basic_constraints()
                .ok()
                .flatten()
                .map(|bc| bc.value.ca)
                .unwrap_or(false),
        })
    }

    fn resident_root(&self) -> TeeResult<Arc<KeyObject>> {
        if let Some(object) = self.memory.get(&KeySlot::RootCa) {
            return Ok(object);
        }
        if self.data.root_ca_key_path().exists() {
            self.load_root_ca()?;
        }
        self.memory
            .get(&KeySlot::RootCa)
            .ok_or_else(|| TeeError::NotInitialized("Root CA not initialized in enclave".into()))
    }

    fn build_root_certificate(&self, key: &EnclaveKey) -> TeeResult<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = self.subject.distinguished_name();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.key_identifier_method = KeyIdMethod::Sha256;
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(ROOT_CA_VALIDITY_DAYS);
        let serial = random_serial();
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let key_pair = key.certificate_key_pair()?;
        let cert = params.self_signed(&key_pair)?;
        Ok((cert.pem(), hex::encode(serial)))
    }
}

impl RootCaSubject {
    pub fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, self.country.as_str());
        dn.push(DnType::StateOrProvinceName, self.state.as_str());
        dn.push(DnType::LocalityName, self.locality.as_str());
        dn.push(DnType::OrganizationName, self.organization.as_str());
        dn.push(DnType::OrganizationalUnitName, self.organizational_unit.as_str());
        dn.push(DnType::CommonName, self.common_name.as_str());
        dn
    }
}

/// Random positive serial; uniqueness is probabilistic, not tracked
fn random_serial() -> [u8; SERIAL_LEN] {
    let mut serial = [0u8; SERIAL_LEN];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    serial[0] |= 0x40;
    serial
}

/// The parts of a CSR that end up in an issued certificate
struct CertificateRequest {
    common_name: String,
    subject: DistinguishedName,
    subject_alt_names: Vec<SanType>,
    public_key: rcgen::SubjectPublicKeyInfo,
}

/// Parse the CSR and check its self-signature
///
/// Requested extensions other than subjectAltName are ignored rather than
/// rejected: the certificate profile decides constraints and key usage.
fn parse_csr(csr_pem: &str) -> TeeResult<CertificateRequest> {
    let (_, pem) = parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| TeeError::InvalidCsr(format!("not a PEM document: {}", e)))?;
    if pem.label != "CERTIFICATE REQUEST" && pem.label != "NEW CERTIFICATE REQUEST" {
        return Err(TeeError::InvalidCsr(format!("unexpected PEM label '{}'", pem.label)));
    }
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| TeeError::InvalidCsr(format!("malformed request: {}", e)))?;
    csr.verify_signature()
        .map_err(|e| TeeError::InvalidCsr(format!("self-signature does not verify: {}", e)))?;

    let info = &csr.certification_request_info;
    let common_name = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("<none>")
        .to_string();
    let subject = subject_name(&info.subject)?;

    let mut subject_alt_names = Vec::new();
    let mut ignored = 0usize;
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            match extension {
                ParsedExtension::SubjectAlternativeName(san) => {
                    for name in &san.general_names {
                        subject_alt_names.extend(san_type(name)?);
                    }
                }
                _ => ignored += 1,
            }
        }
    }
    if ignored > 0 {
        log::debug!("Ignoring {} requested extension(s) in CSR for CN={}", ignored, common_name);
    }

    let public_key = rcgen::SubjectPublicKeyInfo::from_der(info.subject_pki.raw)
        .map_err(|e| TeeError::InvalidCsr(format!("unsupported public key: {}", e)))?;

    Ok(CertificateRequest {
        common_name,
        subject,
        subject_alt_names,
        public_key,
    })
}

fn subject_name(name: &X509Name<'_>) -> TeeResult<DistinguishedName> {
    let mut dn = DistinguishedName::new();
    for attr in name.iter_attributes() {
        let oid: Vec<u64> = attr
            .attr_type()
            .iter()
            .ok_or_else(|| TeeError::InvalidCsr("subject attribute OID out of range".into()))?
            .collect();
        let value = attr
            .as_str()
            .map_err(|_| TeeError::InvalidCsr("subject attribute is not a string".into()))?;
        dn.push(DnType::from_oid(&oid), value);
    }
    Ok(dn)
}

/// `None` for name forms the issued certificate does not carry
fn san_type(name: &GeneralName<'_>) -> TeeResult<Option<SanType>> {
    let ia5 = |s: &str| {
        Ia5String::try_from(s)
            .map_err(|e| TeeError::InvalidCsr(format!("invalid subjectAltName '{}': {}", s, e)))
    };
    Ok(match name {
        GeneralName::DNSName(s) => Some(SanType::DnsName(ia5(*s)?)),
        GeneralName::RFC822Name(s) => Some(SanType::Rfc822Name(ia5(*s)?)),
        GeneralName::URI(s) => Some(SanType::URI(ia5(*s)?)),
        GeneralName::IPAddress(octets) => {
            let ip = match octets.len() {
                4 => <[u8; 4]>::try_from(*octets).map(IpAddr::from).ok(),
                16 => <[u8; 16]>::try_from(*octets).map(IpAddr::from).ok(),
                _ => None,
            };
            Some(SanType::IpAddress(ip.ok_or_else(|| {
                TeeError::InvalidCsr(format!("invalid IP address length {}", octets.len()))
            })?))
        }
        _ => None,
    })
}

fn pem_block(pem: &str) -> TeeResult<Pem> {
    let (_, block) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| TeeError::Certificate(format!("not a PEM certificate: {}", e)))?;
    Ok(block)
}

fn parse_certificate(block: &Pem) -> TeeResult<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(&block.contents)
        .map_err(|e| TeeError::Certificate(format!("malformed certificate: {}", e)))?;
    Ok(cert)
}

fn check_key_matches_certificate(key: &EnclaveKey, cert_pem: &str) -> TeeResult<()> {
    let block = pem_block(cert_pem)?;
    let cert = parse_certificate(&block)?;
    if cert.public_key().raw != key.public_key_der()?.as_slice() {
        return Err(TeeError::IntegrityError(
            "Root CA certificate does not match the sealed key".into(),
        ));
    }
    Ok(())
}
