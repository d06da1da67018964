//! Error conversion and logging helpers shared by the stores and primitives

use crate::exception::WardenError;
use std::fmt::Display;

/// Convert foreign errors (driver, IO) into store errors with context
pub trait ErrorConverter<T> {
    /// Convert result to `WardenError::Store` with context
    fn store_context(self, context: &str) -> Result<T, WardenError>;

    /// Convert result to `WardenError::Store` with lazily formatted context
    fn store_context_with<F>(self, context_fn: F) -> Result<T, WardenError>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorConverter<T> for Result<T, E>
where
    E: Display,
{
    fn store_context(self, context: &str) -> Result<T, WardenError> {
        self.map_err(|e| WardenError::store(format!("{context}: {e}")))
    }

    fn store_context_with<F>(self, context_fn: F) -> Result<T, WardenError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| WardenError::store(format!("{}: {}", context_fn(), e)))
    }
}

macro_rules! log_at_level {
    ($level:expr, $message:expr, $error:expr) => {
        match $level {
            tracing::Level::ERROR => tracing::error!("{}: {}", $message, $error),
            tracing::Level::WARN => tracing::warn!("{}: {}", $message, $error),
            tracing::Level::INFO => tracing::info!("{}: {}", $message, $error),
            tracing::Level::DEBUG => tracing::debug!("{}: {}", $message, $error),
            _ => tracing::trace!("{}: {}", $message, $error),
        }
    };
}

/// Log an error on its way through without changing it
pub trait ErrorLog<T> {
    /// Log error at warn level and return it
    fn log_error(self, message: &str) -> Result<T, WardenError>;

    /// Log error at error level and return it
    fn log_critical_error(self, message: &str) -> Result<T, WardenError>;

    /// Log error with custom level
    fn log_error_with_level(self, level: tracing::Level, message: &str) -> Result<T, WardenError>;
}

impl<T> ErrorLog<T> for Result<T, WardenError> {
    fn log_error(self, message: &str) -> Result<T, WardenError> {
        self.log_error_with_level(tracing::Level::WARN, message)
    }

    fn log_critical_error(self, message: &str) -> Result<T, WardenError> {
        self.log_error_with_level(tracing::Level::ERROR, message)
    }

    fn log_error_with_level(self, level: tracing::Level, message: &str) -> Result<T, WardenError> {
        self.inspect_err(|e| {
            log_at_level!(level, message, e);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_context() {
        let result: Result<i32, String> = Err("connection refused".to_string());
        let converted = result.store_context("SET lock:orders");

        match converted {
            Err(WardenError::Store(msg)) => {
                assert_eq!(msg, "SET lock:orders: connection refused")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_store_context_with_is_lazy_on_success() {
        let result: Result<i32, String> = Ok(7);
        let converted = result.store_context_with(|| panic!("context built for Ok value"));
        assert_eq!(converted.unwrap(), 7);
    }

    #[test]
    fn test_log_error_passes_error_through() {
        let result: Result<(), WardenError> = Err(WardenError::internal("boom"));
        let logged = result.log_error("compensation failed");
        assert!(matches!(logged, Err(WardenError::Internal(_))));
    }
}
