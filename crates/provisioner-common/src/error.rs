//! Error types for the provisioning pipeline
//!
//! Every failure a job can hit maps onto one variant here, and the variant
//! alone decides how the originating message is settled: permanent failures
//! drop the message, transient failures requeue it.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for provisioning operations
#[derive(Debug, Error)]
pub enum Error {
    /// The message payload is not a well-formed order document
    #[error("decode error: {message}")]
    Decode {
        /// Description of what failed to parse
        message: String,
    },

    /// The order parsed but violates an invariant
    #[error("validation error for order {order}: {message}")]
    Validation {
        /// Order identifier (or "unknown" when not yet known)
        order: String,
        /// Description of what's invalid
        message: String,
        /// The offending field (e.g., "cluster_name")
        field: Option<String>,
    },

    /// No free NodePort was found before the allocation deadline
    #[error("no free node port found within {waited:?} ({attempts} candidates tried)")]
    AllocationTimeout {
        /// How long the allocator searched
        waited: Duration,
        /// Number of candidates sampled
        attempts: u32,
    },

    /// A resource with the same name exists and differs from the desired state
    #[error("conflict on {namespace}/{name}: {message}")]
    Conflict {
        /// Namespace of the conflicting object
        namespace: String,
        /// Name of the conflicting object
        name: String,
        /// Description of the mismatch
        message: String,
    },

    /// The management cluster could not be reached or answered with a retryable status
    #[error("transient cluster error [{context}]: {message}")]
    TransientCluster {
        /// Operation that failed (e.g., "list_services")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// The management cluster rejected the request outright
    #[error("fatal cluster error [{context}]: {message}")]
    FatalCluster {
        /// Operation that failed
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A job ran past its own deadline
    #[error("job exceeded its deadline of {deadline:?}")]
    JobTimeout {
        /// The deadline that was exceeded
        deadline: Duration,
    },

    /// Message broker connection, consume or settle failure
    #[error("broker error [{context}]: {message}")]
    Broker {
        /// Operation that failed (e.g., "connect", "ack")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// The broker refused this consumer outright (bad credentials, missing queue)
    #[error("broker refused [{context}]: {message}")]
    BrokerRefused {
        /// Operation that was refused (e.g., "connect", "queue_declare")
        context: String,
        /// Broker's reply
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a decode error with the given message
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    /// Create a validation error without order context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            order: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with order context and field name
    pub fn validation_for_field(
        order: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            order: order.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error for the given object
    pub fn conflict(
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a transient cluster error
    pub fn transient(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TransientCluster {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a fatal cluster error
    pub fn fatal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::FatalCluster {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a broker error
    pub fn broker(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Broker {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an error for a broker refusal that retrying cannot fix
    pub fn broker_refused(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BrokerRefused {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube-rs error raised while performing `context`
    ///
    /// 408, 429 and 5xx answers and transport failures are transient.
    /// 409 is a conflict (callers that expect "already exists" must handle it
    /// before reaching here). Every other API answer is fatal, as are request
    /// building and (de)serialization failures.
    pub fn from_kube(context: impl Into<String>, err: kube::Error) -> Self {
        let context = context.into();
        match &err {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                namespace: UNKNOWN_CONTEXT.to_string(),
                name: UNKNOWN_CONTEXT.to_string(),
                message: ae.message.clone(),
            },
            kube::Error::Api(ae) if ae.code == 408 || ae.code == 429 || ae.code >= 500 => {
                Self::transient(context, err.to_string())
            }
            kube::Error::Api(_) | kube::Error::SerdeError(_) | kube::Error::BuildRequest(_) => {
                Self::fatal(context, err.to_string())
            }
            _ => Self::transient(context, err.to_string()),
        }
    }

    /// Check if the job that produced this error should be retried via requeue
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Decode { .. } => false,
            Error::Validation { .. } => false,
            Error::AllocationTimeout { .. } => true,
            Error::Conflict { .. } => false,
            Error::TransientCluster { .. } => true,
            Error::FatalCluster { .. } => false,
            Error::JobTimeout { .. } => true,
            Error::Broker { .. } => true,
            Error::BrokerRefused { .. } => false,
            Error::Internal { .. } => false,
        }
    }

    /// Stable lowercase label for this error, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Decode { .. } => "decode",
            Error::Validation { .. } => "validation",
            Error::AllocationTimeout { .. } => "allocation_timeout",
            Error::Conflict { .. } => "conflict",
            Error::TransientCluster { .. } => "transient_cluster",
            Error::FatalCluster { .. } => "fatal_cluster",
            Error::JobTimeout { .. } => "job_timeout",
            Error::Broker { .. } => "broker",
            Error::BrokerRefused { .. } => "broker_refused",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::from_kube("kube", err)
    }
}
