//! Certificate Authority
//!
//! - **Authority**: enclave-resident Root CA, sealed persistence, CSR issuance
//! - **Profile**: per-participant basic constraints, key usage and validity

pub mod authority;
pub mod profile;

pub use authority::{CertificateAuthority, IssuedCertificate, ROOT_CA_VALIDITY_DAYS};
pub use profile::CertType;
