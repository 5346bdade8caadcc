//! Structured error types for the messenger.
//!
//! `MessengerError` provides pattern-matchable errors for every failure
//! surface: validation at dispatch, configuration problems, envelope
//! serialization, transport/persistence failures, handler failures, schedule
//! rows, and lost leases.
//!
//! # The Error Boundary Rule
//!
//! Handlers return `anyhow::Result<()>` — `anyhow` is the internal transport.
//! The error-handling middleware converts everything crossing the execution
//! boundary into a [`HandlerError`] carrying an explicit `retryable` flag and
//! an error class, which is what the retry manager and the dead-letter policy
//! consume.

use thiserror::Error;
use uuid::Uuid;

/// Message substrings that mark an otherwise-unclassified error as transient.
///
/// Matched case-insensitively against the error message. This is the
/// normative set; extending it changes retry behavior for foreign errors.
pub const RETRYABLE_PATTERNS: &[&str] = &[
    "network",
    "timeout",
    "temporary",
    "unavailable",
    "connection",
    "econnrefused",
    "etimedout",
    "enotfound",
    "econnreset",
    "service unavailable",
    "rate limit",
    "too many requests",
];

/// Whether an error message matches the transient-failure pattern set.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// A failure produced by (or attributed to) a message handler.
///
/// This is the only error shape the retry manager reasons about. Handlers may
/// return it directly to control retryability; any other error they return is
/// wrapped by the error-handling middleware with `retryable` computed from
/// [`is_retryable_message`].
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct HandlerError {
    /// Human-readable failure description, recorded as `last_error`.
    pub message: String,
    /// Error class recorded on the envelope (e.g. `"HandlerError"`,
    /// `"ValidationError"`). Used for metrics histograms and severity.
    pub class: String,
    /// Whether the retry manager may reschedule the envelope.
    pub retryable: bool,
}

impl HandlerError {
    /// A transient handler failure; the envelope will be rescheduled while
    /// retries remain.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: "HandlerError".to_string(),
            retryable: true,
        }
    }

    /// A permanent handler failure; the envelope dead-letters immediately.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: "HandlerError".to_string(),
            retryable: false,
        }
    }

    /// Override the recorded error class.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Convert a foreign error at the execution boundary.
    ///
    /// Already-typed [`HandlerError`]s pass through unchanged. Everything else
    /// is wrapped with `retryable` computed from the pattern set.
    pub fn from_boundary(err: &anyhow::Error) -> Self {
        if let Some(handler_err) = err.downcast_ref::<HandlerError>() {
            return handler_err.clone();
        }
        if let Some(messenger_err) = err.downcast_ref::<MessengerError>() {
            return Self {
                message: messenger_err.to_string(),
                class: messenger_err.kind().to_string(),
                retryable: messenger_err.is_retryable(),
            };
        }
        let message = format!("{err:#}");
        let retryable = is_retryable_message(&message);
        Self {
            message,
            class: "HandlerError".to_string(),
            retryable,
        }
    }
}

/// Top-level error taxonomy for the messenger core.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// Bad input at dispatch or schedule time. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invalid or missing configuration. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Corrupt envelope body or malformed wire data. Never retried.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persistence-layer failure from a transport. Retryability is decided
    /// by the transient-failure pattern set unless flagged explicitly.
    #[error("transport {name} failed: {message}")]
    Transport {
        /// Name of the failing transport.
        name: String,
        /// Underlying failure description.
        message: String,
        /// Whether the caller may retry the operation.
        retryable: bool,
    },

    /// A handler failed while processing an envelope.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// A schedule row could not be processed. Operator action required.
    #[error("schedule error: {0}")]
    Scheduler(String),

    /// The lease on an in-flight envelope was lost to another worker.
    #[error("lease lost for message {0}")]
    LeaseLost(Uuid),
}

impl MessengerError {
    /// Convenience constructor for transport failures, classifying
    /// retryability from the message when not known.
    pub fn transport(name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = is_retryable_message(&message);
        Self::Transport {
            name: name.into(),
            message,
            retryable,
        }
    }

    /// Stable kind label, used as the `error_class` on envelopes and in
    /// metrics histograms.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Serialization(_) => "SerializationError",
            Self::Transport { .. } => "TransportError",
            Self::Handler(_) => "HandlerError",
            Self::Scheduler(_) => "SchedulerError",
            Self::LeaseLost(_) => "LockError",
        }
    }

    /// Whether this failure may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Configuration(_) | Self::Serialization(_) => false,
            Self::Transport { retryable, .. } => *retryable,
            Self::Handler(e) => e.retryable,
            Self::Scheduler(_) => false,
            Self::LeaseLost(_) => true,
        }
    }
}
