//! Error types for notifier-core
//!
//! Lookup misses (a dialogue or bridged peer that no longer exists) are not
//! errors and never appear here; they surface as `None` from the stores.

use thiserror::Error;

/// Result type for notifier operations
pub type Result<T> = std::result::Result<T, NotifierError>;

/// Errors raised by the notifier components
#[derive(Debug, Error)]
pub enum NotifierError {
    /// Mandatory startup configuration is missing or invalid
    #[error("Startup configuration error: {message}")]
    StartupConfiguration { message: String },

    /// Failure while processing a single inbound request
    #[error("Request handling error: {message}")]
    RequestHandling { message: String },

    /// A subscription received input it cannot represent
    #[error("Subscription invariant violated: {message}")]
    SubscriptionInvariant { message: String },

    /// The transport collaborator failed to send or start
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// NOTIFY body serialization failed
    #[error("NOTIFY body error: {message}")]
    NotifyBody { message: String },

    /// Configuration source could not be read or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The component has been stopped
    #[error("Component has been shut down")]
    Shutdown,
}

impl NotifierError {
    /// Create a startup configuration error
    pub fn startup(message: impl Into<String>) -> Self {
        Self::StartupConfiguration {
            message: message.into(),
        }
    }

    /// Create a request handling error
    pub fn request(message: impl Into<String>) -> Self {
        Self::RequestHandling {
            message: message.into(),
        }
    }

    /// Create a subscription invariant error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::SubscriptionInvariant {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a NOTIFY body error
    pub fn notify_body(message: impl Into<String>) -> Self {
        Self::NotifyBody {
            message: message.into(),
        }
    }

    /// Whether this error must abort the caller rather than be logged and skipped
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StartupConfiguration { .. } | Self::SubscriptionInvariant { .. } | Self::Config(_)
        )
    }
}
