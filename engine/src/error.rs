//! Error types for the POS sync engine.

use crate::{
    guard::GuardConflict, snapshot::InsertOnlyViolation, version::VersionConflict, ModuleId,
    RecordKey, TableName,
};
use thiserror::Error;

/// All possible errors from the sync engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Schema errors
    #[error("module not found: {0}")]
    ModuleNotFound(ModuleId),

    #[error("table \"{table}\" is not registered for module \"{module}\"")]
    TableNotRegistered { table: TableName, module: ModuleId },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("missing primary key for table \"{table}\" (fields: {fields})")]
    MissingPrimaryKey { table: TableName, fields: String },

    // Record errors
    #[error("record not found in \"{table}\": {key}")]
    RecordNotFound { table: TableName, key: RecordKey },

    #[error("record already exists in \"{table}\": {key}")]
    RecordAlreadyExists { table: TableName, key: RecordKey },

    // Concurrency errors
    #[error(transparent)]
    VersionConflict(#[from] VersionConflict),

    #[error("concurrency guard failed: {0}")]
    ConcurrencyGuardFailed(GuardConflict),

    // Snapshot errors
    #[error(transparent)]
    InsertOnlyViolation(#[from] InsertOnlyViolation),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ModuleNotFound(_) => "module-not-found",
            Error::TableNotRegistered { .. } => "table-not-registered",
            Error::InvalidPayload(_) => "invalid-payload",
            Error::MissingRequiredField(_) => "missing-required-field",
            Error::TypeMismatch { .. } => "type-mismatch",
            Error::MissingPrimaryKey { .. } => "missing-primary-key",
            Error::RecordNotFound { .. } => "record-not-found",
            Error::RecordAlreadyExists { .. } => "record-already-exists",
            Error::VersionConflict(_) => "version-conflict",
            Error::ConcurrencyGuardFailed(conflict) => conflict.code(),
            Error::InsertOnlyViolation(violation) => violation.reason(),
            Error::InvalidSnapshot(_) => "invalid-snapshot",
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ConflictReason;

    #[test]
    fn error_display() {
        let err = Error::ModuleNotFound("kds".into());
        assert_eq!(err.to_string(), "module not found: kds");

        let err = Error::RecordNotFound {
            table: "order_header".into(),
            key: "o1".into(),
        };
        assert_eq!(err.to_string(), "record not found in \"order_header\": o1");

        let err = Error::TypeMismatch {
            field: "qty".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'qty': expected Int, got String"
        );
    }

    #[test]
    fn error_codes() {
        let conflict = VersionConflict {
            table: "order_header".into(),
            key: "o1".into(),
            expected_version: Some(2),
            current_version: 2,
            reason: ConflictReason::StaleVersion,
        };
        assert_eq!(Error::from(conflict).code(), "version-conflict");

        let violation = InsertOnlyViolation::MissingTable {
            table: "order_line".into(),
        };
        assert_eq!(Error::from(violation).code(), "missing-table");
    }
}
