//! Error types for labwarden.
//!
//! Each layer has its own enum so callers can decide how far a failure
//! reaches: a [`ConfigError`] stops the process at startup, a [`CycleError`]
//! only abandons one server for the current cycle.

use std::fmt;

use thiserror::Error;

use crate::platform::PlatformError;

/// Invalid or missing settings. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting was not supplied.
    #[error("Missing setting: {0}")]
    Missing(&'static str),

    /// A setting was supplied but cannot be used.
    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    /// The dead threshold must be strictly greater than the alert threshold.
    #[error(
        "Dead threshold ({dead_secs}s) must be greater than alert threshold ({alert_secs}s)"
    )]
    Thresholds { alert_secs: u64, dead_secs: u64 },
}

/// The diagnostics document could not be turned into a snapshot.
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    /// A section the parser cannot work without is absent.
    #[error("Diagnostics document is missing '{0}'")]
    MissingSection(&'static str),

    /// A field has a shape the parser does not understand.
    #[error("Invalid field {field} on lab {lab_id}: {reason}")]
    InvalidField {
        lab_id: String,
        field: &'static str,
        reason: String,
    },
}

/// Record store failures. Abort the current server's reconciliation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read.
    #[error("Failed to read record store {path}: {reason}")]
    Read { path: String, reason: String },

    /// The backing file could not be written.
    #[error("Failed to write record store {path}: {reason}")]
    Write { path: String, reason: String },

    /// The lock guarding the backing file could not be taken.
    #[error("Failed to lock record store {path}: {reason}")]
    Lock { path: String, reason: String },

    /// The backing file exists but does not hold valid records.
    #[error("Record store {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    /// No record matched.
    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Stage of a server pass, used to say where a cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Authenticate,
    FetchDiagnostics,
    Parse,
    Reconcile,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticate => write!(f, "authenticate"),
            Self::FetchDiagnostics => write!(f, "fetch_diagnostics"),
            Self::Parse => write!(f, "parse"),
            Self::Reconcile => write!(f, "reconcile"),
        }
    }
}

/// A server pass that could not be completed this cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{server}: {stage} failed: {source}")]
    Platform {
        server: String,
        stage: Stage,
        #[source]
        source: PlatformError,
    },

    #[error("{server}: {stage} failed: {source}")]
    Parse {
        server: String,
        stage: Stage,
        #[source]
        source: ParseError,
    },

    #[error("{server}: {stage} failed: {source}")]
    Store {
        server: String,
        stage: Stage,
        #[source]
        source: StoreError,
    },
}

impl CycleError {
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Platform { stage, .. }
            | Self::Parse { stage, .. }
            | Self::Store { stage, .. } => *stage,
        }
    }
}
