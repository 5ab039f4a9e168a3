//! Error taxonomy for the device agent
//!
//! Module-level errors (`ConfigError`, `CredentialError`, `MqttError`, ...)
//! stay close to their source; `AgentError` is what handlers, the router and
//! the lifecycle pass around and log.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret|bearer)[=:]?\s*[A-Za-z0-9._~+/=-]{6,}")
        .expect("static pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config|keys?)/[a-zA-Z0-9._/-]+")
        .expect("static pattern is valid")
});

static PEM_BLOCK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-----BEGIN [A-Z ]+-----[\s\S]*?-----END [A-Z ]+-----")
        .expect("static pattern is valid")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Main error type for device agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Credential error: {message}")]
    Credential { message: String },

    #[error("Connect error: {message}")]
    Connect { message: String },

    #[error("Subscribe to '{topic}' failed: {message}")]
    Subscribe { topic: String, message: String },

    #[error("Publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    #[error("Payload on '{topic}' could not be decoded: {message}")]
    PayloadDecode { topic: String, message: String },

    #[error("Forwarding failed: {message}")]
    Forward { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AgentError {
    pub fn credential<S: Into<String>>(message: S) -> Self {
        Self::Credential {
            message: message.into(),
        }
    }

    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    pub fn subscribe<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn publish<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn payload_decode<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::PayloadDecode {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn forward<S: Into<String>>(message: S) -> Self {
        Self::Forward {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Errors that abort startup. Runtime publish, decode and forward
    /// failures are logged and the agent keeps running.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            AgentError::Credential { .. }
                | AgentError::Connect { .. }
                | AgentError::Subscribe { .. }
                | AgentError::Config(_)
        )
    }

    /// Message text safe to write to logs
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Redact secrets, key material and sensitive paths, and cap the length.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = PEM_BLOCK_PATTERN
        .replace_all(message, "[PEM REDACTED]")
        .to_string();

    sanitized = SECRET_PATTERN
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
