//! Error types for waymark operations.
//!
//! Every failure carries a structured error code plus enough detail (which
//! element, which expected vs. actual version) for a caller to render a precise
//! message. The diff engine consults [`WaymarkError::is_retryable`] to decide
//! whether an attempt may be repeated against a fresh snapshot.

use std::collections::HashMap;
use thiserror::Error;

use crate::types::{ElementRef, VersionedElementRef};

/// Result type alias for waymark operations.
pub type WaymarkResult<T> = Result<T, WaymarkError>;

/// Main error type for all waymark operations.
#[derive(Error, Debug)]
pub enum WaymarkError {
    /// Referenced element or version is absent.
    #[error("Not found: {message}")]
    NotFound {
        message: String,
        code: ErrorCode,
        element: Option<String>,
    },

    /// Optimistic version mismatch, stale snapshot, or retry-window exhaustion.
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        code: ErrorCode,
        element: Option<ElementRef>,
        expected: Option<u32>,
        actual: Option<u32>,
    },

    /// Delete blocked by live membership in other elements.
    #[error("Still referenced: {message}")]
    StillReferenced {
        message: String,
        code: ErrorCode,
        element: ElementRef,
        referenced_by: Vec<ElementRef>,
    },

    /// Malformed batch or input.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        code: ErrorCode,
        details: HashMap<String, String>,
        suggestion: Option<String>,
    },

    /// Transient storage failure.
    #[error("Storage unavailable: {message}")]
    Unavailable {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Parse error.
    #[error("Parse error: {message}")]
    Parse { message: String, code: ErrorCode },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation (VAL_xxx)
    ValInvalidInput,
    ValBadPlaceholder,
    ValLimitExceeded,
    ValDanglingReference,
    ValBadVersion,
    ValAlreadyDeleted,
    ValBadMember,

    // Elements (ELEM_xxx)
    ElemNotFound,
    ElemVersionNotFound,
    ElemStillReferenced,

    // Diff (DIFF_xxx)
    DiffVersionMismatch,
    DiffStaleSnapshot,
    DiffRetryExhausted,

    // Database (DB_xxx)
    DbBusy,
    DbOperationFailed,

    // Parse (PARSE_xxx)
    ParseInvalidRef,
    ParseInvalidJson,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValInvalidInput => "VAL_001",
            ErrorCode::ValBadPlaceholder => "VAL_002",
            ErrorCode::ValLimitExceeded => "VAL_003",
            ErrorCode::ValDanglingReference => "VAL_004",
            ErrorCode::ValBadVersion => "VAL_005",
            ErrorCode::ValAlreadyDeleted => "VAL_006",
            ErrorCode::ValBadMember => "VAL_007",
            ErrorCode::ElemNotFound => "ELEM_001",
            ErrorCode::ElemVersionNotFound => "ELEM_002",
            ErrorCode::ElemStillReferenced => "ELEM_003",
            ErrorCode::DiffVersionMismatch => "DIFF_001",
            ErrorCode::DiffStaleSnapshot => "DIFF_002",
            ErrorCode::DiffRetryExhausted => "DIFF_003",
            ErrorCode::DbBusy => "DB_001",
            ErrorCode::DbOperationFailed => "DB_002",
            ErrorCode::ParseInvalidRef => "PARSE_001",
            ErrorCode::ParseInvalidJson => "PARSE_002",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl WaymarkError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::validation_with_code(ErrorCode::ValInvalidInput, message)
    }

    /// Create a validation error with a specific code.
    pub fn validation_with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code,
            details: HashMap::new(),
            suggestion: None,
        }
    }

    /// Create a validation error about one element of a batch.
    pub fn invalid_element(
        code: ErrorCode,
        element: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        let mut details = HashMap::new();
        details.insert("element".to_string(), element.to_string());
        Self::Validation {
            message: message.into(),
            code,
            details,
            suggestion: None,
        }
    }

    /// Create a not found error for an element.
    pub fn not_found(element: ElementRef) -> Self {
        Self::NotFound {
            message: format!("Element {} not found", element),
            code: ErrorCode::ElemNotFound,
            element: Some(element.to_string()),
        }
    }

    /// Create a not found error for a specific element version.
    pub fn version_not_found(element: VersionedElementRef) -> Self {
        Self::NotFound {
            message: format!("Element version {} not found", element),
            code: ErrorCode::ElemVersionNotFound,
            element: Some(element.to_string()),
        }
    }

    /// Create a version mismatch conflict.
    pub fn version_conflict(element: ElementRef, expected: u32, actual: u32) -> Self {
        Self::Conflict {
            message: format!(
                "Version mismatch for {}: provided {}, server had {}",
                element, expected, actual
            ),
            code: ErrorCode::DiffVersionMismatch,
            element: Some(element),
            expected: Some(expected),
            actual: Some(actual),
        }
    }

    /// Create a stale snapshot conflict (retryable).
    pub fn stale_snapshot(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            code: ErrorCode::DiffStaleSnapshot,
            element: None,
            expected: None,
            actual: None,
        }
    }

    /// Create a retry exhaustion conflict.
    pub fn retry_exhausted(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            code: ErrorCode::DiffRetryExhausted,
            element: None,
            expected: None,
            actual: None,
        }
    }

    /// Create a still referenced error.
    pub fn still_referenced(element: ElementRef, referenced_by: Vec<ElementRef>) -> Self {
        let parents = referenced_by
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Self::StillReferenced {
            message: format!("Element {} is still used by {}", element, parents),
            code: ErrorCode::ElemStillReferenced,
            element,
            referenced_by,
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            code: ErrorCode::DbBusy,
            source: None,
        }
    }

    /// Create a parse error for an element reference.
    pub fn invalid_ref(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            code: ErrorCode::ParseInvalidRef,
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            code: ErrorCode::DbOperationFailed,
            source: None,
        }
    }

    /// Attach a suggestion to a validation error. Other variants are returned unchanged.
    pub fn with_suggestion(mut self, hint: impl Into<String>) -> Self {
        if let Self::Validation { suggestion, .. } = &mut self {
            *suggestion = Some(hint.into());
        }
        self
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { code, .. } => *code,
            Self::Conflict { code, .. } => *code,
            Self::StillReferenced { code, .. } => *code,
            Self::Validation { code, .. } => *code,
            Self::Unavailable { code, .. } => *code,
            Self::Database { code, .. } => *code,
            Self::Parse { code, .. } => *code,
            Self::Serialization(_) => ErrorCode::ParseInvalidJson,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether a diff attempt failing with this error may be retried against a
    /// fresh snapshot.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. }
                | Self::Conflict {
                    code: ErrorCode::DiffStaleSnapshot,
                    ..
                }
        )
    }

    /// Get a user-friendly suggestion for resolving this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::NotFound { .. } => Some("Please check the element reference and ensure it exists"),
            Self::Conflict {
                code: ErrorCode::DiffVersionMismatch,
                ..
            } => Some("Download the latest version of the element and resubmit"),
            Self::Conflict { .. } => Some("Please resubmit the change"),
            Self::StillReferenced { .. } => {
                Some("Remove the element from its parents before deleting it")
            }
            Self::Validation { suggestion, .. } => suggestion.as_deref(),
            Self::Unavailable { .. } => Some("Please try again shortly"),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for WaymarkError {
    fn from(err: rusqlite::Error) -> Self {
        let busy = matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        );
        if busy {
            Self::Unavailable {
                message: err.to_string(),
                code: ErrorCode::DbBusy,
                source: Some(Box::new(err)),
            }
        } else {
            Self::Database {
                message: err.to_string(),
                code: ErrorCode::DbOperationFailed,
                source: Some(Box::new(err)),
            }
        }
    }
}

impl From<tokio::task::JoinError> for WaymarkError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Storage task failed: {}", err))
    }
}
