use std::io;
use thiserror::Error;

/// Every failure the engine reports to a caller.
///
/// Parse and execution errors are recoverable and get printed by the REPL.
/// `Io` and `Corrupt` are fatal: they propagate out of the REPL loop and the
/// process exits non-zero. Structural invariant violations (out-of-range page
/// numbers, invalid child pointers, an exhausted buffer pool) panic instead,
/// since they signify corruption or a bug rather than bad input.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("duplicate key {0}")]
    DuplicateKey(u32),
    #[error("key {0} not found")]
    KeyNotFound(u32),
    #[error("id must be positive")]
    NegativeId,
    #[error("string is too long")]
    StringTooLong,
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unrecognized statement '{0}'")]
    Unrecognized(String),
    #[error("corrupt database file: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type DbResult<T> = Result<T, DbError>;
