//! Structured, matchable error kinds shared by every core subsystem.
//!
//! Internal boundaries return `CoreError`; `main.rs` and `cli.rs` wrap it
//! in `anyhow::Result` the way the rest of the binary does.

use serde::Serialize;
use std::collections::HashMap;

/// Producer-agnostic error kind, paired with a message and free-form context.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum CoreError {
    /// Malformed id, empty required field, unknown enum value.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        context: HashMap<String, String>,
    },

    /// Missing session / event / script / plugin. Idempotent deletes return Ok.
    #[error("not found: {message}")]
    NotFound {
        message: String,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        context: HashMap<String, String>,
    },

    /// Starting a recorder / session / playback that is already running.
    #[error("already active: {message}")]
    AlreadyActive {
        message: String,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        context: HashMap<String, String>,
    },

    /// Subprocess error or transient I/O error, retried locally before surfacing.
    #[error("transient error after {attempts} attempt(s): {message}")]
    Transient {
        message: String,
        attempts: u32,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        context: HashMap<String, String>,
    },

    /// Backpressure drop or plugin budget exceeded. Counted, not propagated as fatal.
    #[error("overload: {message}")]
    Overload {
        message: String,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        context: HashMap<String, String>,
    },

    /// Store open failed, schema migration irrecoverable. Aborts core startup.
    #[error("fatal: {message}")]
    Fatal {
        message: String,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        context: HashMap<String, String>,
    },
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        CoreError::NotFound {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn already_active(message: impl Into<String>) -> Self {
        CoreError::AlreadyActive {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn transient(message: impl Into<String>, attempts: u32) -> Self {
        CoreError::Transient {
            message: message.into(),
            attempts,
            context: HashMap::new(),
        }
    }

    pub fn overload(message: impl Into<String>) -> Self {
        CoreError::Overload {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        CoreError::Fatal {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let ctx = match &mut self {
            CoreError::Validation { context, .. }
            | CoreError::NotFound { context, .. }
            | CoreError::AlreadyActive { context, .. }
            | CoreError::Transient { context, .. }
            | CoreError::Overload { context, .. }
            | CoreError::Fatal { context, .. } => context,
        };
        ctx.insert(key.into(), value.into());
        self
    }

    /// Kind name, matching the `kind` field of the `{kind, message, context}` shape
    /// that every caught error is also emitted into the pipeline as.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation { .. } => "validation",
            CoreError::NotFound { .. } => "not_found",
            CoreError::AlreadyActive { .. } => "already_active",
            CoreError::Transient { .. } => "transient",
            CoreError::Overload { .. } => "overload",
            CoreError::Fatal { .. } => "fatal",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CoreError::Validation { message, .. }
            | CoreError::NotFound { message, .. }
            | CoreError::AlreadyActive { message, .. }
            | CoreError::Transient { message, .. }
            | CoreError::Overload { message, .. }
            | CoreError::Fatal { message, .. } => message,
        }
    }

    /// Is this severe enough to record a `warn`-or-higher event into the pipeline.
    pub fn is_warn_or_above(&self) -> bool {
        !matches!(self, CoreError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Transient {
            message: e.to_string(),
            attempts: 1,
            context: HashMap::new(),
        }
    }
}

impl From<r2d2::Error> for CoreError {
    fn from(e: r2d2::Error) -> Self {
        CoreError::Transient {
            message: e.to_string(),
            attempts: 1,
            context: HashMap::new(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
