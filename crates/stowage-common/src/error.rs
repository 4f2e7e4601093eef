//! Error types for the stowage operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant names the resource it concerns (run, storage, schedule)
//! so a failure can be traced back without reading the full log.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for stowage operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Spec validation error
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.restore")
        field: Option<String>,
    },

    /// Storage provider error
    #[error("provider error [{provider}] for {storage}: {message}")]
    Provider {
        /// Name of the BackupStorage the provider belongs to
        storage: String,
        /// Provider type (s3)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Streaming pipeline failure (exec, codec or transfer)
    #[error("pipeline error [{stage}] for {run}: {message}")]
    Pipeline {
        /// Name of the BackupRun being executed
        run: String,
        /// Stage that failed (exec, compress, encrypt, upload, ...)
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// Schedule configuration error (cron expression, time zone, missed-run cap)
    #[error("schedule error for {schedule}: {message}")]
    Schedule {
        /// Name of the BackupSchedule
        schedule: String,
        /// Description of what's wrong
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "lifecycle", "secret", "pod")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        storage: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            storage: storage.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., missing mandatory parameter)
    pub fn provider_permanent(
        storage: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            storage: storage.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a pipeline error for a run and stage
    pub fn pipeline(
        run: impl Into<String>,
        stage: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Pipeline {
            run: run.into(),
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a schedule configuration error
    pub fn schedule(schedule: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Schedule {
            schedule: schedule.into(),
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

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec fix and are not retried.
    /// Kubernetes errors are retried unless the API server rejected the request (4xx),
    /// with optimistic-concurrency conflicts being the exception.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Pipeline { .. } => true,
            Error::Schedule { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the API server rejected a write because the resource version moved
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True when the API server reported the object as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        }),
    }
}
