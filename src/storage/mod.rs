//! Enclave data directory
//!
//! Fixed file layout for sealed keys and public certificates. Every write goes
//! through [`write_atomic`], so a crash never leaves a half-written sealed key.

use crate::tee::{AttestationLogEntry, SealedBlob, TeeError, TeeResult};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const ROOT_CA_KEY_FILE: &str = "root_ca_key.sealed";
pub const ROOT_CA_CERT_FILE: &str = "root_ca_cert.pem";
pub const POLICY_FILE: &str = "attestation_policy.json";
pub const ATTESTATION_LOG_FILE: &str = "attestation_log.jsonl";
const SEALED_EXT: &str = "sealed";

/// Write-to-temp, fsync, rename
pub fn write_atomic(path: &Path, data: &[u8]) -> TeeResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| TeeError::InvalidArgument(format!("not a file path: {}", path.display())))?;
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        file_name.to_string_lossy(),
        uuid::Uuid::new_v4()
    ));

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

/// The directory holding one enclave's persisted artifacts
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn open(root: impl AsRef<Path>) -> TeeResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_ca_key_path(&self) -> PathBuf {
        self.root.join(ROOT_CA_KEY_FILE)
    }

    pub fn root_ca_cert_path(&self) -> PathBuf {
        self.root.join(ROOT_CA_CERT_FILE)
    }

    pub fn orderer_key_path(&self, chain_id: &str) -> PathBuf {
        self.root.join(format!("orderer_{}_key.{}", chain_id, SEALED_EXT))
    }

    pub fn policy_path(&self) -> PathBuf {
        self.root.join(POLICY_FILE)
    }

    pub fn attestation_log_path(&self) -> PathBuf {
        self.root.join(ATTESTATION_LOG_FILE)
    }

    /// Append one JSON line to the attestation log
    pub fn append_attestation_log(&self, entry: &AttestationLogEntry) -> TeeResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.attestation_log_path())?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// All logged entries, oldest first
    pub fn read_attestation_log(&self) -> TeeResult<Vec<AttestationLogEntry>> {
        let file = match fs::File::open(self.attestation_log_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                entries.push(serde_json::from_str(&line)?);
            }
        }
        Ok(entries)
    }

    pub fn write_sealed(&self, path: &Path, blob: &SealedBlob) -> TeeResult<()> {
        write_atomic(path, &blob.to_bytes())
    }

    /// `Ok(None)` when the file does not exist
    pub fn read_sealed(&self, path: &Path) -> TeeResult<Option<SealedBlob>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(SealedBlob::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_text(&self, path: &Path, text: &str) -> TeeResult<()> {
        write_atomic(path, text.as_bytes())
    }

    pub fn read_text(&self, path: &Path) -> TeeResult<Option<String>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all sealed files, sorted
    pub fn sealed_files(&self) -> TeeResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SEALED_EXT) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
