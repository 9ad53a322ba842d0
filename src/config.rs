//! Enclave service configuration
//!
//! Loaded from TOML with a default for every field. Resolution order:
//! built-in defaults, then the config file, then `ENCLAVE_DATA_DIR`.

use crate::tee::enclave::{DEFAULT_CODE_IDENTITY, DEFAULT_ROOT_SECRET, DEFAULT_SIGNER_IDENTITY};
use crate::tee::{EnclaveIdentity, TcbLevel, TeeError, TeeResult, TrustPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "ENCLAVE_CONFIG";
/// Environment variable overriding `data_dir`
pub const DATA_DIR_ENV: &str = "ENCLAVE_DATA_DIR";
/// Smallest RSA modulus accepted for any enclave key
pub const MIN_KEY_BITS: usize = 2048;

/// Complete enclave configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnclaveConfig {
    /// Directory for sealed keys, certificates and the policy file
    pub data_dir: PathBuf,
    pub enclave_name: String,
    pub enclave_version: String,
    /// Hashed into MRENCLAVE
    pub code_identity: String,
    /// Hashed into MRSIGNER
    pub signer_identity: String,
    pub tcb_level: TcbLevel,
    /// Simulated CPU root secret the sealing key is derived from
    pub root_secret: String,
    pub root_ca_key_bits: usize,
    pub orderer_key_bits: usize,
    /// Upper bound on concurrently running CPU-bound operations
    pub max_concurrent_jobs: usize,
    pub root_ca: RootCaSubject,
    pub attestation: AttestationConfig,
}

/// Distinguished name of the Root CA certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RootCaSubject {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
    pub common_name: String,
}

/// Verifier settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttestationConfig {
    /// Policy JSON; relative paths resolve against `data_dir`
    pub policy_file: Option<PathBuf>,
    /// Overrides the policy file's value when set
    pub max_quote_age_seconds: Option<i64>,
    /// Overrides the policy file's value when set
    pub minimum_tcb_level: Option<TcbLevel>,
    pub replay_protection: bool,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./enclave_data"),
            enclave_name: "DFIR-SGX-Enclave".to_string(),
            enclave_version: "2.0.0".to_string(),
            code_identity: DEFAULT_CODE_IDENTITY.to_string(),
            signer_identity: DEFAULT_SIGNER_IDENTITY.to_string(),
            tcb_level: TcbLevel(1),
            root_secret: DEFAULT_ROOT_SECRET.to_string(),
            root_ca_key_bits: 4096,
            orderer_key_bits: 2048,
            max_concurrent_jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            root_ca: RootCaSubject::default(),
            attestation: AttestationConfig::default(),
        }
    }
}

impl Default for RootCaSubject {
    fn default() -> Self {
        Self {
            country: "US".to_string(),
            state: "California".to_string(),
            locality: "San Francisco".to_string(),
            organization: "DFIR Blockchain Root CA".to_string(),
            organizational_unit: "SGX Enclave".to_string(),
            common_name: "DFIR SGX Root CA".to_string(),
        }
    }
}

impl EnclaveConfig {
    /// Resolve configuration: `path` if given, else `ENCLAVE_CONFIG`, else defaults
    pub fn load(path: Option<&Path>) -> TeeResult<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> TeeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TeeError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> TeeResult<Self> {
        toml::from_str(content).map_err(|e| TeeError::Config(format!("invalid config: {}", e)))
    }

    pub fn to_toml(&self) -> TeeResult<String> {
        toml::to_string_pretty(self).map_err(|e| TeeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> TeeResult<()> {
        for (name, bits) in [
            ("root_ca_key_bits", self.root_ca_key_bits),
            ("orderer_key_bits", self.orderer_key_bits),
        ] {
            if bits < MIN_KEY_BITS {
                return Err(TeeError::Config(format!(
                    "{} must be at least {}, got {}",
                    name, MIN_KEY_BITS, bits
                )));
            }
        }
        if self.max_concurrent_jobs == 0 {
            return Err(TeeError::Config("max_concurrent_jobs must be greater than 0".into()));
        }
        if self.root_secret.is_empty() {
            return Err(TeeError::Config("root_secret must not be empty".into()));
        }
        if let Some(age) = self.attestation.max_quote_age_seconds {
            if age < 0 {
                return Err(TeeError::Config(format!(
                    "attestation.max_quote_age_seconds must not be negative, got {}",
                    age
                )));
            }
        }
        Ok(())
    }

    /// The enclave identity this configuration describes
    pub fn identity(&self) -> EnclaveIdentity {
        EnclaveIdentity::new(
            self.enclave_name.clone(),
            self.enclave_version.clone(),
            &self.code_identity,
            &self.signer_identity,
            self.tcb_level,
            &self.root_secret,
        )
    }

    pub fn policy_path(&self) -> PathBuf {
        match &self.attestation.policy_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.data_dir.join(path),
            None => self.data_dir.join(crate::storage::POLICY_FILE),
        }
    }

    /// Apply the configured overrides on top of a loaded policy
    pub fn apply_policy_overrides(&self, policy: &mut TrustPolicy) {
        if let Some(age) = self.attestation.max_quote_age_seconds {
            policy.max_quote_age_seconds = age;
        }
        if let Some(level) = self.attestation.minimum_tcb_level {
            policy.minimum_tcb_level = level;
        }
    }
}

// The root secret stays out of logs and panic messages
impl fmt::Debug for EnclaveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveConfig")
            .field("data_dir", &self.data_dir)
            .field("enclave_name", &self.enclave_name)
            .field("enclave_version", &self.enclave_version)
            .field("tcb_level", &self.tcb_level)
            .field("root_secret", &"<redacted>")
            .field("root_ca_key_bits", &self.root_ca_key_bits)
            .field("orderer_key_bits", &self.orderer_key_bits)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("root_ca", &self.root_ca)
            .field("attestation", &self.attestation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EnclaveConfig::default();
        config.validate().unwrap();
        assert_eq!(config.root_ca_key_bits, 4096);
        assert_eq!(config.orderer_key_bits, 2048);
        assert_eq!(config.root_ca.common_name, "DFIR SGX Root CA");
        assert_eq!(
            *config.identity().measurements(),
            *EnclaveIdentity::simulated().measurements()
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EnclaveConfig::from_toml(
            r#"
            data_dir = "/var/lib/enclave"
            tcb_level = 3
            root_ca_key_bits = 3072

            [root_ca]
            common_name = "Test Root"

            [attestation]
            max_quote_age_seconds = 60
            minimum_tcb_level = "2"
            replay_protection = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/enclave"));
        assert_eq!(config.tcb_level, TcbLevel(3));
        assert_eq!(config.root_ca_key_bits, 3072);
        assert_eq!(config.orderer_key_bits, 2048);
        assert_eq!(config.root_ca.common_name, "Test Root");
        assert_eq!(config.root_ca.country, "US");
        assert_eq!(config.attestation.minimum_tcb_level, Some(TcbLevel(2)));
        assert!(config.attestation.replay_protection);

        let mut policy = TrustPolicy::default();
        config.apply_policy_overrides(&mut policy);
        assert_eq!(policy.max_quote_age_seconds, 60);
        assert_eq!(policy.minimum_tcb_level, TcbLevel(2));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            EnclaveConfig::from_toml("root_ca_bits = 4096"),
            Err(TeeError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_weak_settings() {
        let mut config = EnclaveConfig::default();
        config.root_ca_key_bits = 1024;
        assert!(matches!(config.validate(), Err(TeeError::Config(_))));

        let mut config = EnclaveConfig::default();
        config.orderer_key_bits = 512;
        assert!(config.validate().is_err());

        let mut config = EnclaveConfig::default();
        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());

        let mut config = EnclaveConfig::default();
        config.attestation.max_quote_age_seconds = Some(-1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_and_file_load() {
        let dir = std::env::temp_dir().join(format!("enclave-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("enclave.toml");

        let mut config = EnclaveConfig::default();
        config.data_dir = dir.join("data");
        config.attestation.policy_file = Some(PathBuf::from("policy.json"));
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = EnclaveConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.policy_path(), dir.join("data").join("policy.json"));

        assert!(matches!(
            EnclaveConfig::load_from_file(&dir.join("missing.toml")),
            Err(TeeError::Config(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_debug_redacts_root_secret() {
        let rendered = format!("{:?}", EnclaveConfig::default());
        assert!(!rendered.contains(DEFAULT_ROOT_SECRET));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_policy_path_default() {
        let config = EnclaveConfig::default();
        assert_eq!(
            config.policy_path(),
            config.data_dir.join(crate::storage::POLICY_FILE)
        );
    }
}
