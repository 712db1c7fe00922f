use serde::Serialize;
use std::fmt;

/// Closed set of rule codes a validation failure can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCode {
    Required,
    TooShort,
    TooLong,
    InvalidFormat,
    InvalidChecksum,
    InvalidValue,
    FutureDate,
    DateOrder,
    OutOfRange,
    DisallowedFileType,
    FileTooLarge,
    EmptyFile,
    ContentMismatch,
}

impl RuleCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCode::Required => "required",
            RuleCode::TooShort => "too_short",
            RuleCode::TooLong => "too_long",
            RuleCode::InvalidFormat => "invalid_format",
            RuleCode::InvalidChecksum => "invalid_checksum",
            RuleCode::InvalidValue => "invalid_value",
            RuleCode::FutureDate => "future_date",
            RuleCode::DateOrder => "date_order",
            RuleCode::OutOfRange => "out_of_range",
            RuleCode::DisallowedFileType => "disallowed_file_type",
            RuleCode::FileTooLarge => "file_too_large",
            RuleCode::EmptyFile => "empty_file",
            RuleCode::ContentMismatch => "content_mismatch",
        }
    }
}

/// One violated rule on one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub rule: RuleCode,
    pub message: String,
}

/// Every rule a value failed, in the order they were checked.
///
/// Constructors collect into this rather than stopping at the first problem so callers can
/// report all of them at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors(Vec<Violation>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, rule: RuleCode, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.push(field, rule, message);
        errors
    }

    pub fn push(&mut self, field: impl Into<String>, rule: RuleCode, message: impl Into<String>) {
        self.0.push(Violation {
            field: field.into(),
            rule,
            message: message.into(),
        });
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    /// Keeps the value on success, records the violations on failure.
    pub fn collect<T>(&mut self, result: Result<T, ValidationErrors>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(errors) => {
                self.extend(errors);
                None
            }
        }
    }

    /// Like [`collect`](Self::collect) but re-roots every field under `prefix`.
    pub fn collect_nested<T>(
        &mut self,
        prefix: &str,
        result: Result<T, ValidationErrors>,
    ) -> Option<T> {
        self.collect(result.map_err(|e| e.prefixed(prefix)))
    }

    pub fn prefixed(self, prefix: &str) -> Self {
        Self(
            self.0
                .into_iter()
                .map(|v| Violation {
                    field: format!("{}.{}", prefix, v.field),
                    ..v
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.0
    }

    pub fn has(&self, field: &str, rule: RuleCode) -> bool {
        self.0.iter().any(|v| v.field == field && v.rule == rule)
    }

    pub fn has_rule(&self, rule: RuleCode) -> bool {
        self.0.iter().any(|v| v.rule == rule)
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|v| format!("{} ({}): {}", v.field, v.rule.as_str(), v.message))
            .collect();
        f.write_str(&rendered.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("referential integrity violation: {entity} references missing patient {patient_id}")]
    ReferentialIntegrity {
        entity: &'static str,
        patient_id: String,
    },
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
    #[error("missing encryption metadata for {0}")]
    MissingEncryptionMetadata(String),
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("unsupported export format: {0}")]
    UnsupportedExportFormat(String),

    #[error("failed to create storage directory: {0}")]
    StorageDirCreation(std::io::Error),
    #[error("failed to write file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to read file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to remove file: {0}")]
    FileRemove(std::io::Error),
    #[error("failed to serialize JSON: {0}")]
    JsonSerialization(serde_json::Error),
    #[error("failed to deserialize JSON: {0}")]
    JsonDeserialization(serde_json::Error),
    #[error("failed to serialize YAML: {0}")]
    YamlSerialization(serde_yaml::Error),
    #[error("failed to deserialize YAML: {0}")]
    YamlDeserialization(serde_yaml::Error),
    #[error("blob storage error: {0}")]
    Files(#[from] vault_files::FilesError),
    #[error("identifier error: {0}")]
    Uuid(#[from] vault_uuid::UuidError),

    #[error("Failed to {operation}: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: Box<CoreError>,
    },
    #[error(
        "operation failed and cleanup also failed (path: {path}): error={error}; cleanup={cleanup_error}"
    )]
    CleanupAfterFailure {
        path: String,
        #[source]
        error: Box<CoreError>,
        cleanup_error: Box<CoreError>,
    },
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for failures of the storage backend rather than of the request itself.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            CoreError::StorageDirCreation(_)
                | CoreError::FileWrite(_)
                | CoreError::FileRead(_)
                | CoreError::FileRemove(_)
                | CoreError::JsonSerialization(_)
                | CoreError::JsonDeserialization(_)
                | CoreError::YamlSerialization(_)
                | CoreError::YamlDeserialization(_)
                | CoreError::Files(_)
                | CoreError::CleanupAfterFailure { .. }
        )
    }

    /// The innermost error, looking through operation context.
    pub fn root(&self) -> &CoreError {
        match self {
            CoreError::Operation { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Adds operation context to storage failures.
///
/// Request errors (validation, not-found, access, integrity, conflict) pass through untouched
/// so callers can still match on them.
pub trait OperationContext<T> {
    fn context(self, operation: &'static str) -> CoreResult<T>;
}

impl<T> OperationContext<T> for CoreResult<T> {
    fn context(self, operation: &'static str) -> CoreResult<T> {
        self.map_err(|e| {
            if e.is_storage_failure() {
                CoreError::Operation {
                    operation,
                    source: Box::new(e),
                }
            } else {
                e
            }
        })
    }
}
