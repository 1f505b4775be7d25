//! Structured error types for the gatepass library.
//!
//! Public library functions return [`Result<T>`], carrying a
//! per-subsystem [`GatepassError`].  Expected verification outcomes
//! (invalid, unknown, duplicate) are not errors; they live in
//! [`crate::engine::ScanOutcome`].

use thiserror::Error;

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Domain-specific error type for the gatepass library.
#[derive(Error, Debug)]
pub enum GatepassError {
    #[error("token: {0}")]
    Token(String),

    #[error("store: {0}")]
    Store(String),

    /// The attendance store stayed busy past the bounded retry budget.
    #[error("attendance store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("import: {0}")]
    Import(String),

    #[error("issue: {0}")]
    Issue(String),

    #[error("export: {0}")]
    Export(String),

    #[error("config: {0}")]
    Config(String),

    #[error("validation: {0}")]
    Validation(String),

    /// Direct database errors (auto-converted via `?` in the store module).
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    /// Anything without a subsystem of its own.
    #[error("{0}")]
    Other(String),
}

/// Alias used by every fallible function in this crate.
pub type Result<T> = std::result::Result<T, GatepassError>;

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Attaches a message to any `Result<T, E>` while tagging it with the
/// originating subsystem, in the manner of `anyhow::Context`.
///
/// ```ignore
/// csv::Reader::from_path(path).ctx_import("open roster")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_token(self, msg: &str) -> Result<T>;
    fn ctx_store(self, msg: &str) -> Result<T>;
    fn ctx_import(self, msg: &str) -> Result<T>;
    fn ctx_issue(self, msg: &str) -> Result<T>;
    fn ctx_export(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_token(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatepassError::Token(format!("{msg}: {e}")))
    }
    fn ctx_store(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatepassError::Store(format!("{msg}: {e}")))
    }
    fn ctx_import(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatepassError::Import(format!("{msg}: {e}")))
    }
    fn ctx_issue(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatepassError::Issue(format!("{msg}: {e}")))
    }
    fn ctx_export(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatepassError::Export(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| GatepassError::Config(format!("{msg}: {e}")))
    }
}

/// The [`ResultExt`] counterpart for `Option<T>`: `None` becomes an error.
pub trait OptionExt<T> {
    fn required_issue(self, msg: &str) -> Result<T>;
    fn required_config(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required_issue(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| GatepassError::Issue(msg.to_string()))
    }
    fn required_config(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| GatepassError::Config(msg.to_string()))
    }
}
