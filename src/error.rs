use std::fmt::Debug;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// How the webhook layer should treat a failed authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller could not be authenticated. Never retried.
    Unauthenticated,
    /// An upstream dependency could not give an answer. The caller is not known to be
    /// unauthorized.
    Unavailable,
    /// Configuration or startup failure.
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed token: {0}")]
    MalformedToken(String),
    #[error("Unexpected HTTP method in presigned request: {0}")]
    UnexpectedMethod(String),
    #[error("Presigned request targets a host that is not allowed: {0}")]
    InvalidHost(String),
    #[error("Presigned request action is not GetCallerIdentity: {0}")]
    UnexpectedAction(String),
    #[error("Presigned request is missing required parameter {0}")]
    MissingParameter(&'static str),
    #[error("Presigned request signature is outside the accepted time window. Signed at: {0}")]
    ExpiredSignature(i64),
    #[error("Presigned request does not carry the cluster ID header")]
    MissingClusterHeader,
    #[error("Presigned request was issued for a different cluster: {0}")]
    ClusterMismatch(String),
    #[error("Cluster ID header is not part of the signed headers")]
    ClusterHeaderNotSigned,
    #[error("Identity service rejected the presigned request with status {0}")]
    UpstreamRejected(u16),
    #[error("Identity service unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Malformed identity service response: {0}")]
    MalformedResponse(String),
    #[error("Unrecognized principal ARN: {0}")]
    UnrecognizedPrincipal(String),
    #[error("Mapper {backend} could not determine a mapping: {reason}")]
    MappingUnavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("Mapper {backend} failed to start: {reason}")]
    StartupFailed {
        backend: &'static str,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedToken(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn startup(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            backend,
            reason: reason.into(),
        }
    }

    pub fn mapping_unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::MappingUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Classify the error for the webhook layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::MalformedToken(_)
            | Error::UnexpectedMethod(_)
            | Error::InvalidHost(_)
            | Error::UnexpectedAction(_)
            | Error::MissingParameter(_)
            | Error::ExpiredSignature(_)
            | Error::MissingClusterHeader
            | Error::ClusterMismatch(_)
            | Error::ClusterHeaderNotSigned
            | Error::UpstreamRejected(_)
            | Error::UnrecognizedPrincipal(_) => ErrorClass::Unauthenticated,
            Error::UpstreamUnavailable(_)
            | Error::MalformedResponse(_)
            | Error::MappingUnavailable { .. } => ErrorClass::Unavailable,
            Error::StartupFailed { .. } | Error::Config(_) | Error::Io(_) | Error::Yaml(_) => {
                ErrorClass::Internal
            }
        }
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.class() == ErrorClass::Unauthenticated
    }
}

pub(crate) fn identity_request_error(error: reqwest::Error) -> Error {
    Error::UpstreamUnavailable(format!("Failed to call identity service: {error}"))
}

pub(crate) fn identity_body_error(error: reqwest::Error) -> Error {
    Error::MalformedResponse(format!("Failed to read identity response: {error}"))
}

/// Failure of a single inventory lookup.
///
/// Cloneable so that one in-flight query can hand the same outcome to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("Inventory key not found: {0}")]
    NotFound(String),
    #[error("Inventory service error: {0}")]
    Upstream(String),
}
