//! Error types and result types for mapper operations.
//!
//! Every failure surfaced by the mapper is one of the [`OdmError`] variants so
//! calling code can branch on the kind of failure rather than on message text.
//! Use [`OdmResult<T>`] as the return type for fallible operations.
//!
//! Store-level failures are never swallowed: backends wrap the native error
//! into [`OdmError::Connection`] or [`OdmError::Operation`] and keep the
//! driver's error labels so a caller-supplied retry wrapper can decide whether
//! a transaction is worth retrying.

use std::fmt;

use bson::{Bson, error::Error as BsonError};
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Label attached by the store to errors that abort a transaction but may
/// succeed when the whole transaction is retried.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Label attached by the store when the outcome of a commit is unknown.
pub const UNKNOWN_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The transaction phase in which a [`OdmError::Transaction`] occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    /// Starting the session or the transaction.
    Begin,
    /// Issuing an operation through a transaction client.
    Use,
    /// Committing.
    Commit,
    /// Aborting.
    Rollback,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionPhase::Begin => "begin",
            TransactionPhase::Use => "use",
            TransactionPhase::Commit => "commit",
            TransactionPhase::Rollback => "rollback",
        })
    }
}

/// Fieldless discriminant of [`OdmError`], convenient for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Connection,
    Operation,
    Transaction,
    Serialization,
}

/// Represents all possible errors raised by the mapper.
#[derive(Error, Debug, Clone)]
pub enum OdmError {
    /// An `*_or_fail` lookup matched nothing.
    #[error("No {model} found matching {criterion}")]
    NotFound {
        /// Name of the model that was looked up.
        model: String,
        /// The identifying criterion, usually the compiled filter.
        criterion: String,
    },
    /// A field failed one or more declared constraints.
    #[error("Validation failed for field `{field}` (value {value}): {violated}", violated = .rules.join(", "))]
    Validation {
        field: String,
        value: Bson,
        /// Names of the violated rules.
        rules: Vec<String>,
    },
    /// The underlying store could not be reached or authenticated.
    #[error("Connection `{connection}` failed: {message}")]
    Connection { connection: String, message: String },
    /// A request was rejected, either by the store or before dispatch.
    #[error("Operation `{operation}` failed: {message}")]
    Operation {
        operation: String,
        message: String,
        /// Labels reported by the store driver, if any.
        labels: Vec<String>,
    },
    /// Begin, commit or rollback failed, or a terminal transaction was used.
    #[error("Transaction {phase} failed: {message}")]
    Transaction {
        phase: TransactionPhase,
        message: String,
        /// The error that caused this one, e.g. the store error of a failed
        /// commit or the original callback error when a rollback fails.
        #[source]
        source: Option<Box<OdmError>>,
    },
    /// Serialization/deserialization error when converting between BSON, JSON
    /// and model types.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A specialized `Result` type for mapper operations.
pub type OdmResult<T> = Result<T, OdmError>;

impl OdmError {
    /// Creates an [`OdmError::Operation`] without driver labels.
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        OdmError::Operation {
            operation: operation.into(),
            message: message.into(),
            labels: Vec::new(),
        }
    }

    /// Creates an [`OdmError::NotFound`].
    pub fn not_found(model: impl Into<String>, criterion: impl Into<String>) -> Self {
        OdmError::NotFound {
            model: model.into(),
            criterion: criterion.into(),
        }
    }

    /// Creates an [`OdmError::Connection`].
    pub fn connection(connection: impl Into<String>, message: impl Into<String>) -> Self {
        OdmError::Connection {
            connection: connection.into(),
            message: message.into(),
        }
    }

    /// Creates an [`OdmError::Transaction`] without a source.
    pub fn transaction(phase: TransactionPhase, message: impl Into<String>) -> Self {
        OdmError::Transaction {
            phase,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps `source` into an [`OdmError::Transaction`] for `phase`.
    pub fn transaction_caused_by(phase: TransactionPhase, source: OdmError) -> Self {
        OdmError::Transaction {
            phase,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OdmError::NotFound { .. } => ErrorKind::NotFound,
            OdmError::Validation { .. } => ErrorKind::Validation,
            OdmError::Connection { .. } => ErrorKind::Connection,
            OdmError::Operation { .. } => ErrorKind::Operation,
            OdmError::Transaction { .. } => ErrorKind::Transaction,
            OdmError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Returns the driver labels carried by this error or any error it wraps.
    pub fn labels(&self) -> Vec<&str> {
        match self {
            OdmError::Operation { labels, .. } => labels.iter().map(String::as_str).collect(),
            OdmError::Transaction { source: Some(source), .. } => source.labels(),
            _ => Vec::new(),
        }
    }

    /// Returns `true` if the error carries the given driver label.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels().contains(&label)
    }

    /// Returns `true` if retrying the whole transaction may succeed.
    pub fn is_transient(&self) -> bool {
        self.has_label(TRANSIENT_TRANSACTION_ERROR)
    }

    /// Returns `true` if a commit may or may not have been applied.
    pub fn is_unknown_commit_result(&self) -> bool {
        self.has_label(UNKNOWN_COMMIT_RESULT)
    }
}

impl From<BsonError> for OdmError {
    fn from(err: BsonError) -> Self {
        OdmError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for OdmError {
    fn from(err: SerdeJsonError) -> Self {
        OdmError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_names_field_value_and_rules() {
        let err = OdmError::Validation {
            field: "age".into(),
            value: Bson::Int32(17),
            rules: vec!["range(18, 120)".into()],
        };

        let message = err.to_string();
        assert!(message.contains("`age`"));
        assert!(message.contains("17"));
        assert!(message.contains("range(18, 120)"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn transaction_errors_expose_labels_of_their_source() {
        let store_err = OdmError::Operation {
            operation: "commitTransaction".into(),
            message: "write conflict".into(),
            labels: vec![TRANSIENT_TRANSACTION_ERROR.into()],
        };
        let err = OdmError::transaction_caused_by(TransactionPhase::Commit, store_err);

        assert!(err.is_transient());
        assert!(!err.is_unknown_commit_result());
        assert_eq!(err.kind(), ErrorKind::Transaction);
    }
}
