//! Error types for the sync engine
//!
//! Errors are structured with fields to aid debugging in production. The
//! variants follow the engine's failure taxonomy: each one maps to a single
//! recovery policy in the Reconciler (recover locally, back off and retry,
//! or surface and wait for the object to change).

use thiserror::Error;

use crate::events::reasons;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for vsync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Mapping or object absent
    #[error("not found: {identity}")]
    NotFound {
        /// Identity that could not be resolved
        identity: String,
    },

    /// Physical identity already claimed by a different virtual identity
    #[error("mapping conflict: {physical} is claimed by {claimed_by}, refused for {requested_by}")]
    Conflict {
        /// The contested physical identity
        physical: String,
        /// Virtual identity that currently owns the physical identity
        claimed_by: String,
        /// Virtual identity whose record was refused
        requested_by: String,
    },

    /// A host object exists at the computed identity but is not engine-owned
    #[error("foreign object at {physical}: {message}")]
    ForeignObject {
        /// Physical identity occupied by the foreign object
        physical: String,
        /// Why the object is considered foreign
        message: String,
    },

    /// Timeouts, server errors and cancellation
    #[error("transient error [{context}]: {message}")]
    Transient {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "host-api", "reconcile")
        context: String,
    },

    /// Malformed virtual object
    #[error("translation error for {object}: {message}")]
    Translation {
        /// Kind or identity of the object that could not be translated
        object: String,
        /// Description of what's wrong
        message: String,
        /// The offending field path (e.g. "metadata.name")
        field: Option<String>,
    },

    /// Mapper registration failure at startup
    #[error("registration error for {kind}: {message}")]
    Registration {
        /// Resource kind being registered
        kind: String,
        /// Description of what failed
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

    /// Invalid configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid setting (e.g. "--target-namespace")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "store", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given identity
    pub fn not_found(identity: impl ToString) -> Self {
        Self::NotFound {
            identity: identity.to_string(),
        }
    }

    /// Create a mapping conflict error
    pub fn conflict(
        physical: impl ToString,
        claimed_by: impl ToString,
        requested_by: impl ToString,
    ) -> Self {
        Self::Conflict {
            physical: physical.to_string(),
            claimed_by: claimed_by.to_string(),
            requested_by: requested_by.to_string(),
        }
    }

    /// Create a foreign object error
    pub fn foreign_object(physical: impl ToString, msg: impl Into<String>) -> Self {
        Self::ForeignObject {
            physical: physical.to_string(),
            message: msg.into(),
        }
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create a transient error with context
    pub fn transient_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a translation error for an object
    pub fn translation(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Translation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a translation error with the offending field path
    pub fn translation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Translation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a registration error
    pub fn registration(kind: impl ToString, msg: impl Into<String>) -> Self {
        Self::Registration {
            kind: kind.to_string(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl ToString, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.to_string()),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific setting
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
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

    /// Check if this error is retryable
    ///
    /// Translation, serialization, validation and registration errors need a
    /// changed input. Foreign objects are never touched automatically.
    /// Kubernetes 4xx errors are final except 409 (lost an optimistic
    /// concurrency race) and 429 (throttled).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::NotFound { .. } => true,
            Error::Conflict { .. } => true,
            Error::ForeignObject { .. } => false,
            Error::Transient { .. } => true,
            Error::Translation { .. } => false,
            Error::Registration { .. } => false,
            Error::Serialization { .. } => false,
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether the object or mapping is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Whether a create failed because the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    /// Whether this is a mapping conflict (physical identity owned elsewhere)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Event reason recorded on the virtual object when this error surfaces
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Conflict { .. } => reasons::MAPPING_CONFLICT,
            Error::ForeignObject { .. } => reasons::FOREIGN_OBJECT,
            Error::Translation { .. } | Error::Serialization { .. } => {
                reasons::TRANSLATION_FAILED
            }
            _ => reasons::SYNC_FAILED,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Transient { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
