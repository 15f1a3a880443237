//! Error types for the kore controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or unvalidated configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Join token or join client failure
    #[error("join error: {0}")]
    Join(String),

    /// Unrecognized storage backend kind
    #[error("invalid storage type: {0}")]
    UnsupportedStorage(String),

    /// A component lifecycle call failed
    #[error("component {component}: {message}")]
    Component {
        /// Name of the failing component
        component: String,
        /// What went wrong
        message: String,
    },

    /// Worker enablement failure
    #[error("worker enablement error: {0}")]
    Worker(String),

    /// Certificate authority or issuance error
    #[error("pki error: {0}")]
    Pki(#[from] crate::pki::PkiError),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a join error with the given message
    pub fn join(msg: impl Into<String>) -> Self {
        Self::Join(msg.into())
    }

    /// Create a worker enablement error with the given message
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Create a component error for the named component
    pub fn component(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Component {
            component: component.into(),
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_constructors_categorize() {
        match Error::config("no api address") {
            Error::Config(msg) => assert_eq!(msg, "no api address"),
            _ => panic!("expected Config variant"),
        }

        match Error::component("etcd", "binary not found") {
            Error::Component { component, message } => {
                assert_eq!(component, "etcd");
                assert_eq!(message, "binary not found");
            }
            _ => panic!("expected Component variant"),
        }
    }

    #[test]
    fn test_display_includes_category_and_message() {
        let err = Error::UnsupportedStorage("bogus".to_string());
        assert!(err.to_string().contains("invalid storage type"));
        assert!(err.to_string().contains("bogus"));

        let err = Error::join("token is not valid base64");
        assert!(err.to_string().contains("join error"));
    }
}
