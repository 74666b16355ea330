//! Error types for the stasis controllers
//!
//! Errors are structured with fields to aid debugging in production. The
//! reconcilers never classify an error as permanent: every variant propagates
//! to the controller's error policy for a backed-off retry, and the only
//! durable failure record is the resource's own status. The helpers here
//! exist to pick log levels and to swallow the outcomes that are expected
//! during idempotent retries (not-found on delete, already-exists on create).

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status code the API server returns for a missing object
const HTTP_NOT_FOUND: u16 = 404;

/// HTTP status code for both optimistic-concurrency conflicts and duplicate creates
const HTTP_CONFLICT: u16 = 409;

/// Main error type for stasis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource carries a configuration the controller cannot act on
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// namespace/name of the offending resource
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// The snapshot references a source kind no implementation exists for
    #[error("unknown snapshot source {kind}/{name}")]
    UnknownSource {
        /// Kind named in the snapshot's source reference
        kind: String,
        /// Name named in the snapshot's source reference
        name: String,
    },

    /// More than one VolumeSnapshotClass matches and the default is not unique
    #[error("{matches} matching VolumeSnapshotClasses for {storage_class}")]
    AmbiguousSnapshotClass {
        /// Storage class whose provisioner was matched
        storage_class: String,
        /// Number of classes sharing the provisioner's driver
        matches: usize,
    },

    /// A volume cannot be snapshotted because no VolumeSnapshotClass applies
    #[error("cannot resolve VolumeSnapshotClass for {claim}: {message}")]
    SnapshotClassUnresolved {
        /// namespace/name of the claim being snapshotted
        claim: String,
        /// Why resolution failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "snapshot", "content")
        context: String,
    },
}

impl Error {
    /// Create a validation error for the given resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an unknown-source error
    pub fn unknown_source(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UnknownSource {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an ambiguity error for snapshot-class resolution
    pub fn ambiguous_snapshot_class(storage_class: impl Into<String>, matches: usize) -> Self {
        Self::AmbiguousSnapshotClass {
            storage_class: storage_class.into(),
            matches,
        }
    }

    /// Create an unresolved snapshot-class error for a claim
    pub fn snapshot_class_unresolved(claim: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SnapshotClassUnresolved {
            claim: claim.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The object addressed by the request does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == HTTP_NOT_FOUND)
    }

    /// A create collided with an existing object of the same name
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == HTTP_CONFLICT && ae.reason == "AlreadyExists"
        )
    }

    /// An update lost an optimistic-concurrency race (stale resourceVersion)
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == HTTP_CONFLICT && ae.reason != "AlreadyExists"
        )
    }

    /// Transient outcome that resolves on its own once the cache catches up
    ///
    /// Retried quietly by the error policies instead of being logged as an
    /// error.
    pub fn is_retryable(&self) -> bool {
        self.is_conflict()
            || matches!(
                self,
                Error::Kube { source: kube::Error::Api(ae) } if ae.code == 429 || ae.code >= 500
            )
    }

    /// The error stems from resource configuration an operator has to fix
    ///
    /// These are still retried; the distinction only drives event emission.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. }
                | Error::UnknownSource { .. }
                | Error::AmbiguousSnapshotClass { .. }
                | Error::SnapshotClassUnresolved { .. }
        )
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            kind: None,
        }
    }
}

/// Build a kube API error response, for tests that simulate server outcomes
#[doc(hidden)]
pub fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
            code,
        }),
    }
}
