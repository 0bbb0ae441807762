//! Typed errors: build-time diagnostics and runtime failures.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// SQLSTATE codes the store reports when a transaction cannot be serialized.
pub const SERIALIZATION_FAILURE: &str = "40001";
pub const DEADLOCK_DETECTED: &str = "40P01";
pub const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Validation covers malformed entities/fields; Referential covers targets that do not resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Validation,
    Referential,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(entity: Option<&str>, field: Option<&str>, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            kind: DiagnosticKind::Validation,
            entity: entity.map(String::from),
            field: field.map(String::from),
            message: message.into(),
        }
    }

    pub fn referential(entity: Option<&str>, field: Option<&str>, message: impl Into<String>) -> Self {
        Diagnostic {
            kind: DiagnosticKind::Referential,
            ..Diagnostic::error(entity, field, message)
        }
    }

    pub fn warning(entity: Option<&str>, field: Option<&str>, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(entity, field, message)
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}", sev)?;
        if self.kind == DiagnosticKind::Referential {
            write!(f, "[referential]")?;
        }
        match (&self.entity, &self.field) {
            (Some(e), Some(fld)) => write!(f, " {}.{}", e, fld)?,
            (Some(e), None) => write!(f, " {}", e)?,
            _ => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// A batch of diagnostics reported together.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    pub fn push(&mut self, d: Diagnostic) {
        self.0.push(d);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| !d.is_error())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", lines.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("model rejected: {0}")]
    Invalid(Diagnostics),
    #[error("model load: {0}")]
    Load(String),
}

impl ConfigError {
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            ConfigError::Invalid(d) => Some(d),
            ConfigError::Load(_) => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("validation: {0}")]
    Validation(String),
    #[error("referential: {0}")]
    Referential(String),
    #[error("serialization conflict (sqlstate {code})")]
    SerializationConflict { code: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("hook aborted in {target}.{verb}.{stage}: {message}")]
    HookAbort {
        target: String,
        verb: &'static str,
        stage: &'static str,
        message: String,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("database: {0}")]
    Db(sqlx::Error),
    #[error("store: {0}")]
    Store(String),
}

impl AppError {
    /// Conflict signalled by the store; the retry controller re-runs the unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::SerializationConflict { .. })
    }

    pub fn serialization_conflict() -> Self {
        AppError::SerializationConflict {
            code: SERIALIZATION_FAILURE.to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if let Some(code) = db.code() {
                if code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED {
                    return AppError::SerializationConflict {
                        code: code.into_owned(),
                    };
                }
                if code == UNIQUE_VIOLATION {
                    return AppError::Conflict(db.message().to_string());
                }
            }
        }
        if let sqlx::Error::RowNotFound = e {
            return AppError::NotFound("row".into());
        }
        AppError::Db(e)
    }
}
