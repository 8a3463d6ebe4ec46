//! TLS material for the registry server.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{KbuError, Result};

/// Certificate and key files, owning the temporary directory when generated.
#[derive(Debug)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    generated: Option<TempDir>,
}

impl TlsMaterial {
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Self {
        Self {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            generated: None,
        }
    }

    /// Self-signed certificate for `host`, written to a fresh temporary directory.
    pub fn self_signed(host: &str) -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec![host.to_string()])
            .map_err(|e| KbuError::Tls(format!("Failed to generate certificate: {e}")))?;

        let dir = tempfile::Builder::new()
            .prefix("kbu-registry-tls-")
            .tempdir()
            .map_err(|e| KbuError::io("registry TLS directory", e))?;
        let cert_path = dir.path().join("tls.crt");
        let key_path = dir.path().join("tls.key");
        std::fs::write(&cert_path, certified.cert.pem())
            .map_err(|e| KbuError::io(cert_path.display().to_string(), e))?;
        std::fs::write(&key_path, certified.key_pair.serialize_pem())
            .map_err(|e| KbuError::io(key_path.display().to_string(), e))?;

        Ok(Self {
            cert_path,
            key_path,
            generated: Some(dir),
        })
    }

    /// Remove generated material. Caller-supplied files are left alone.
    pub fn cleanup(&mut self) -> Result<()> {
        match self.generated.take() {
            Some(dir) => dir
                .close()
                .map_err(|e| KbuError::io("registry TLS directory", e)),
            None => Ok(()),
        }
    }
}
