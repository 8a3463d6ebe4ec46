//! Custom error types for kbu.

use thiserror::Error;

/// Errors that can occur while coordinating a bundle upgrade.
#[derive(Error, Debug)]
pub enum KbuError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Configuration(Vec<String>),

    #[error("[{0}] I/O error: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("[{0}] HTTP error: {1}")]
    Http(String, String),

    #[error("Kubernetes API error: {0}")]
    Kubernetes(String),

    #[error("Bundle extraction failed: {0}")]
    Extraction(String),

    #[error("Invalid bundle metadata: {0}")]
    Metadata(String),

    #[error("No node has recorded bundle metadata although all nodes are ready")]
    MissingMetadata,

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Failed to pull image {0}: {1}")]
    Pull(String, String),

    #[error("Failed to reload {0}: {1}")]
    Reload(String, String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Registry server error: {0}")]
    Registry(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl KbuError {
    /// Wrap an I/O error with the component or path it came from.
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        Self::Io(context.into(), err)
    }

    /// Wrap a kube client error.
    pub fn kube(action: &str, err: &kube::Error) -> Self {
        Self::Kubernetes(format!("{action}: {err}"))
    }

    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_, _) | Self::Http(_, _) | Self::Kubernetes(_) | Self::Pull(_, _)
        )
    }
}

/// Returns true if the kube error is an API status with the given HTTP code.
pub fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

pub type Result<T, E = KbuError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_lists_every_field() {
        let err = KbuError::Configuration(vec![
            "--node-name is required".to_string(),
            "--extract-dir is required".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid configuration: --node-name is required; --extract-dir is required"
        );
    }

    #[test]
    fn test_io_error_display() {
        let err = KbuError::io(
            "/var/lib/kbu/bundle",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("[/var/lib/kbu/bundle]"));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_error_display_missing_metadata() {
        assert_eq!(
            KbuError::MissingMetadata.to_string(),
            "No node has recorded bundle metadata although all nodes are ready"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(KbuError::Http("peer".into(), "reset".into()).is_transient());
        assert!(KbuError::Kubernetes("timeout".into()).is_transient());
        assert!(KbuError::Pull("a:1".into(), "unavailable".into()).is_transient());
        assert!(!KbuError::Extraction("exit 2".into()).is_transient());
        assert!(!KbuError::Configuration(vec![]).is_transient());
        assert!(!KbuError::Reload("crio.service".into(), "failed".into()).is_transient());
        assert!(!KbuError::MissingMetadata.is_transient());
    }
}
