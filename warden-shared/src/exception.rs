use thiserror::Error;

/// Warden error taxonomy
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Optimistic lock conflict on {entity} {id}: expected version {expected}, found {actual}")]
    OptimisticLock {
        entity: String,
        id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Pessimistic lock failed on {resource} (timeout: {timeout}): {reason}")]
    PessimisticLock {
        resource: String,
        timeout: bool,
        reason: String,
    },

    #[error("Deadlock persisted after {attempts} attempts: {source}")]
    Deadlock {
        attempts: u32,
        #[source]
        source: Box<WardenError>,
    },

    #[error("Failed to acquire distributed lock {key}: {reason}")]
    DistributedLock { key: String, reason: String },

    #[error("Timed out waiting for a permit on semaphore {key}")]
    SemaphoreTimeout { key: String },

    #[error("Record not found: {entity} {id}")]
    RecordNotFound { entity: String, id: String },

    #[error("Transaction {id} is already {state}")]
    TransactionClosed { id: String, state: String },

    #[error("Store error: {0}")]
    Store(String),

    /// Driver error carrying the engine's SQLSTATE
    #[error("Database error [SQLSTATE {code}]: {message}")]
    Database { code: String, message: String },

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    pub fn store<S: Into<String>>(msg: S) -> Self {
        WardenError::Store(msg.into())
    }

    pub fn database<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        WardenError::Database {
            code: code.into(),
            message: message.into(),
        }
    }

    /// SQLSTATE of a [`WardenError::Database`] error
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            WardenError::Database { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        WardenError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        WardenError::Configuration(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        WardenError::Internal(msg.into())
    }

    pub fn distributed_lock<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        WardenError::DistributedLock {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn lock_timeout<R: Into<String>, S: Into<String>>(resource: R, reason: S) -> Self {
        WardenError::PessimisticLock {
            resource: resource.into(),
            timeout: true,
            reason: reason.into(),
        }
    }

    pub fn lock_unavailable<R: Into<String>, S: Into<String>>(resource: R, reason: S) -> Self {
        WardenError::PessimisticLock {
            resource: resource.into(),
            timeout: false,
            reason: reason.into(),
        }
    }

    /// Version or ownership conflict that a caller may resolve by retrying
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            WardenError::OptimisticLock { .. } | WardenError::DistributedLock { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            WardenError::Timeout { .. }
                | WardenError::SemaphoreTimeout { .. }
                | WardenError::PessimisticLock { timeout: true, .. }
        )
    }
}

/// Result type for warden operations
pub type WardenResult<T> = Result<T, WardenError>;
