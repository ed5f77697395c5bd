//! Error types for tg-forward.

use crate::pipeline::types::EngineState;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Rule {rule} is invalid: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by account sessions and the session registry.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Account {identity} is not connected")]
    NotConnected { identity: String },

    #[error("Subscription for {identity} failed: {reason}")]
    SubscribeFailed { identity: String, reason: String },

    #[error("Authentication failed for {identity}: {reason}")]
    AuthFailed { identity: String, reason: String },

    #[error("{platform} session {identity} does not support {operation}")]
    Unsupported {
        platform: String,
        identity: String,
        operation: &'static str,
    },

    #[error("Send via {identity} failed: {reason}")]
    SendFailed { identity: String, reason: String },

    #[error("Download via {identity} failed: {reason}")]
    DownloadFailed { identity: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors inside a single dispatch task. Never escalated past the task.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Nothing to send: message has no text and no attachments")]
    EmptyMessage,

    #[error("Rule {rule} targets {expected} but was dispatched to the {actual} adapter")]
    WrongAdapter {
        rule: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Dispatch task panicked: {0}")]
    Panicked(String),
}

/// Forward engine lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Cannot {operation} while engine is {state:?}")]
    InvalidTransition {
        operation: &'static str,
        state: EngineState,
    },

    #[error("Failed to load rules: {0}")]
    RuleLoad(#[from] DatabaseError),

    #[error("Engine bootstrap failed: {0}")]
    Bootstrap(#[from] SessionError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
