//! # EduSync Common
//!
//! Common error types and logging configuration shared by the EduSync offline
//! worker crates.
//!
//! ## Features
//!
//! - Unified error type with backtrace support for internal failures
//! - Logging configuration and setup
//! - Result extension traits

use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Unified error type for EduSync.
#[derive(Error, Debug)]
pub enum EduSyncError {
    /// Network transport errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache store errors.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Worker lifecycle errors (install, activate).
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Notification display errors.
    #[error("Notification error: {message}")]
    Notification {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl EduSyncError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a lifecycle error.
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: None,
        }
    }

    /// Create a notification error.
    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the hosting runtime should treat this error as fatal for the
    /// event that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EduSyncError::Lifecycle { .. } | EduSyncError::Config { .. } | EduSyncError::Internal { .. }
        )
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            EduSyncError::Network { .. } => "network",
            EduSyncError::Cache { .. } => "cache",
            EduSyncError::Lifecycle { .. } => "lifecycle",
            EduSyncError::Notification { .. } => "notification",
            EduSyncError::Config { .. } => "config",
            EduSyncError::Io(_) => "io",
            EduSyncError::NotFound(_) => "not_found",
            EduSyncError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for EduSync operations.
pub type Result<T> = std::result::Result<T, EduSyncError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| EduSyncError::Internal {
            message: format!("{}: {}", message.into(), e),
            backtrace: Some(backtrace::Backtrace::new()),
        })
    }
}
