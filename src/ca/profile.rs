//! Certificate profiles by participant type

use crate::tee::TeeError;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyUsagePurpose};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Participant type a certificate is issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertType {
    IntermediateCa,
    Orderer,
    Peer,
    Client,
}

impl CertType {
    pub const ALL: [CertType; 4] = [
        CertType::IntermediateCa,
        CertType::Orderer,
        CertType::Peer,
        CertType::Client,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CertType::IntermediateCa => "intermediate-ca",
            CertType::Orderer => "orderer",
            CertType::Peer => "peer",
            CertType::Client => "client",
        }
    }

    pub fn default_validity_days(&self) -> u32 {
        match self {
            CertType::IntermediateCa => 1825,
            CertType::Orderer => 825,
            CertType::Peer | CertType::Client => 365,
        }
    }

    pub fn is_ca(&self) -> bool {
        matches!(self, CertType::IntermediateCa)
    }

    pub fn key_usages(&self) -> Vec<KeyUsagePurpose> {
        match self {
            CertType::IntermediateCa => vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
            ],
            CertType::Orderer | CertType::Peer => vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
            CertType::Client => vec![KeyUsagePurpose::DigitalSignature],
        }
    }

    /// Overwrite basic constraints and key usage with this profile
    pub(crate) fn apply(&self, params: &mut CertificateParams) {
        params.is_ca = if self.is_ca() {
            // Intermediates may only sign end-entity certificates
            IsCa::Ca(BasicConstraints::Constrained(0))
        } else {
            IsCa::ExplicitNoCa
        };
        params.key_usages = self.key_usages();
    }
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CertType {
    type Err = TeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "intermediate-ca" | "intermediate" => Ok(CertType::IntermediateCa),
            "orderer" => Ok(CertType::Orderer),
            "peer" => Ok(CertType::Peer),
            "client" | "admin" | "user" => Ok(CertType::Client),
            other => Err(TeeError::InvalidArgument(format!(
                "unknown certificate type '{}' (expected intermediate-ca, orderer, peer or client)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        for t in CertType::ALL {
            assert_eq!(t.name().parse::<CertType>().unwrap(), t);
        }
        assert_eq!("intermediate".parse::<CertType>().unwrap(), CertType::IntermediateCa);
        assert!("root".parse::<CertType>().is_err());
    }

    #[test]
    fn test_default_validity() {
        assert_eq!(CertType::IntermediateCa.default_validity_days(), 1825);
        assert_eq!(CertType::Orderer.default_validity_days(), 825);
        assert_eq!(CertType::Peer.default_validity_days(), 365);
        assert_eq!(CertType::Client.default_validity_days(), 365);
    }

    #[test]
    fn test_profile_table() {
        let mut params = CertificateParams::default();
        CertType::IntermediateCa.apply(&mut params);
        assert_eq!(params.is_ca, IsCa::Ca(BasicConstraints::Constrained(0)));
        assert!(params.key_usages.contains(&KeyUsagePurpose::KeyCertSign));

        CertType::Peer.apply(&mut params);
        assert_eq!(params.is_ca, IsCa::ExplicitNoCa);
        assert_eq!(
            params.key_usages,
            vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment]
        );

        CertType::Client.apply(&mut params);
        assert_eq!(params.key_usages, vec![KeyUsagePurpose::DigitalSignature]);
    }

    #[test]
    fn test_serde_kebab_case() {
        assert_eq!(
            serde_json::to_string(&CertType::IntermediateCa).unwrap(),
            "\"intermediate-ca\""
        );
    }
}
