//! Engine Error Types
//!
//! Failures surfaced by the messaging engine: pool and ring backpressure,
//! wire protocol violations, peer disconnects and faults reported by the
//! socket facility.

use thiserror::Error;

/// Main engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// A bounded resource is full and the caller asked not to wait
    #[error("Backpressure: {resource}: {message}")]
    Backpressure { resource: String, message: String },

    /// A bounded wait expired
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The segment pool was cancelled while a caller waited on it
    #[error("Segment pool {pool_id} is closed")]
    PoolClosed { pool_id: u8 },

    /// Framing or payload violation on a session's inbound stream
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The peer closed the connection or the socket was aborted
    #[error("Peer disconnected: session {session_id}")]
    PeerDisconnected { session_id: u32 },

    /// The socket facility reported an unrecoverable condition
    #[error("Facility fault: {message}")]
    FacilityFault {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Every preallocated session is in use
    #[error("No session available: all {capacity} sessions in use")]
    NoSessionAvailable { capacity: usize },

    /// Lookup by id or peer found no active session
    #[error("Session not found: {session}")]
    SessionNotFound { session: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    /// The engine is shutting down and accepts no more work
    #[error("Engine is shut down")]
    Shutdown,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a backpressure error
    pub fn backpressure(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backpressure {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error with source
    pub fn protocol_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a facility fault
    pub fn facility(message: impl Into<String>) -> Self {
        Self::FacilityFault {
            message: message.into(),
            source: None,
        }
    }

    /// Create a facility fault with source
    pub fn facility_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::FacilityFault {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a session lookup error
    pub fn session_not_found(session: impl std::fmt::Display) -> Self {
        Self::SessionNotFound {
            session: session.to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Backpressure { .. } => true,
            EngineError::Timeout { .. } => true,
            EngineError::PoolClosed { .. } => false,
            EngineError::Protocol { .. } => false,
            EngineError::PeerDisconnected { .. } => false,
            EngineError::FacilityFault { .. } => false,
            EngineError::NoSessionAvailable { .. } => true,
            EngineError::SessionNotFound { .. } => false,
            EngineError::Configuration { .. } => false,
            EngineError::Io { .. } => true,
            EngineError::Shutdown => false,
        }
    }

    /// Check if this is a transient error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Backpressure { .. }
                | EngineError::Timeout { .. }
                | EngineError::NoSessionAvailable { .. }
        )
    }

    /// Check if the engine cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::FacilityFault { .. })
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Backpressure { .. } => "backpressure",
            EngineError::Timeout { .. } => "timeout",
            EngineError::PoolClosed { .. } => "pool_closed",
            EngineError::Protocol { .. } => "protocol",
            EngineError::PeerDisconnected { .. } => "peer_disconnected",
            EngineError::FacilityFault { .. } => "facility_fault",
            EngineError::NoSessionAvailable { .. } => "no_session_available",
            EngineError::SessionNotFound { .. } => "session_not_found",
            EngineError::Configuration { .. } => "configuration",
            EngineError::Io { .. } => "io",
            EngineError::Shutdown => "shutdown",
        }
    }
}

// Box<dyn Error> sources are not Clone, so clones drop them
impl Clone for EngineError {
    fn clone(&self) -> Self {
        match self {
            EngineError::Backpressure { resource, message } => EngineError::Backpressure {
                resource: resource.clone(),
                message: message.clone(),
            },
            EngineError::Timeout {
                operation,
                timeout_ms,
            } => EngineError::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            EngineError::PoolClosed { pool_id } => EngineError::PoolClosed { pool_id: *pool_id },
            EngineError::Protocol { message, .. } => EngineError::Protocol {
                message: message.clone(),
                source: None,
            },
            EngineError::PeerDisconnected { session_id } => EngineError::PeerDisconnected {
                session_id: *session_id,
            },
            EngineError::FacilityFault { message, .. } => EngineError::FacilityFault {
                message: message.clone(),
                source: None,
            },
            EngineError::NoSessionAvailable { capacity } => EngineError::NoSessionAvailable {
                capacity: *capacity,
            },
            EngineError::SessionNotFound { session } => EngineError::SessionNotFound {
                session: session.clone(),
            },
            EngineError::Configuration { message, field } => EngineError::Configuration {
                message: message.clone(),
                field: field.clone(),
            },
            EngineError::Io { message, source } => EngineError::Io {
                message: message.clone(),
                source: std::io::Error::new(source.kind(), message.clone()),
            },
            EngineError::Shutdown => EngineError::Shutdown,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Payload decode failures are protocol violations on the session
impl From<codec::CodecError> for EngineError {
    fn from(error: codec::CodecError) -> Self {
        EngineError::protocol_with_source("Payload decode failed", error)
    }
}
