//! Error types for the Magnetar client library

/// Main error type for Magnetar client operations
#[derive(Debug, thiserror::Error)]
pub enum MagnetarClientError {
    /// The consumer or client has already been closed
    #[error("Already closed: {message}")]
    AlreadyClosed { message: String },

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    OperationCancelled,

    /// Seek over a multi-topic consumer only accepts Earliest or Latest
    #[error("Illegal message id: {message}")]
    IllegalMessageId { message: String },

    /// Retry letter topic support was not enabled on this consumer
    #[error("Retry is not enabled on this consumer")]
    RetryDisabled,

    /// The operation is not supported on a multi-topic consumer
    #[error("Not supported: {message}")]
    NotSupported { message: String },

    /// A per-partition/per-topic child consumer operation failed
    #[error("Child consumer '{topic}' failed: {message}")]
    ChildOperationFailed { topic: String, message: String },

    /// Consumer initialization failed; the consumer is unusable
    #[error("Initialization failed: {message}")]
    InitFailed { message: String },

    /// A broker lookup query failed
    #[error("Lookup failed: {message}")]
    LookupFailed { message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MagnetarClientError {
    /// Create a new already-closed error
    pub fn already_closed<S: Into<String>>(message: S) -> Self {
        Self::AlreadyClosed {
            message: message.into(),
        }
    }

    /// Create a new illegal-message-id error
    pub fn illegal_message_id<S: Into<String>>(message: S) -> Self {
        Self::IllegalMessageId {
            message: message.into(),
        }
    }

    /// Create a new not-supported error
    pub fn not_supported<S: Into<String>>(message: S) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    /// Create a new child-operation error
    pub fn child<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::ChildOperationFailed {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a new init-failed error
    pub fn init_failed<S: Into<String>>(message: S) -> Self {
        Self::InitFailed {
            message: message.into(),
        }
    }

    /// Create a new lookup error
    pub fn lookup<S: Into<String>>(message: S) -> Self {
        Self::LookupFailed {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::LookupFailed { .. } => true,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this error means the consumer is unusable
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AlreadyClosed { .. } | Self::InitFailed { .. })
    }

    /// Check if this error is a caller-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::OperationCancelled)
    }
}

impl Clone for MagnetarClientError {
    fn clone(&self) -> Self {
        match self {
            Self::AlreadyClosed { message } => Self::AlreadyClosed {
                message: message.clone(),
            },
            Self::OperationCancelled => Self::OperationCancelled,
            Self::IllegalMessageId { message } => Self::IllegalMessageId {
                message: message.clone(),
            },
            Self::RetryDisabled => Self::RetryDisabled,
            Self::NotSupported { message } => Self::NotSupported {
                message: message.clone(),
            },
            Self::ChildOperationFailed { topic, message } => Self::ChildOperationFailed {
                topic: topic.clone(),
                message: message.clone(),
            },
            Self::InitFailed { message } => Self::InitFailed {
                message: message.clone(),
            },
            Self::LookupFailed { message } => Self::LookupFailed {
                message: message.clone(),
            },
            Self::InvalidConfig { message } => Self::InvalidConfig {
                message: message.clone(),
            },
            Self::Connection { message } => Self::Connection {
                message: message.clone(),
            },
            Self::Io(e) => Self::Connection {
                message: e.to_string(),
            },
        }
    }
}
