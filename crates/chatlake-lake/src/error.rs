use thiserror::Error;

/// Classification of a filesystem-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoReason {
    /// Lock acquisition deadline passed.
    Timeout,
    /// Another writer holds the resource.
    Conflict,
    DiskFull,
    Permission,
    /// File ends mid-record (torn write or partial publish).
    Truncated,
    Other,
}

impl std::fmt::Display for IoReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IoReason::Timeout => "timeout",
            IoReason::Conflict => "conflict",
            IoReason::DiskFull => "disk_full",
            IoReason::Permission => "permission",
            IoReason::Truncated => "truncated",
            IoReason::Other => "other",
        };
        f.write_str(s)
    }
}

/// Query pre-condition failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    InvalidRange,
    MissingPartition,
}

#[derive(Debug, Error)]
pub enum LakeError {
    #[error("I/O error ({reason}): {message}")]
    Io {
        reason: IoReason,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Checkpoint conflict: {0}")]
    CheckpointConflict(String),

    #[error("Query error ({kind:?}): {message}")]
    Query {
        kind: QueryErrorKind,
        message: String,
    },

    #[error("Columnar error: {0}")]
    Columnar(String),
}

impl LakeError {
    pub fn io(reason: IoReason, message: impl Into<String>) -> Self {
        LakeError::Io {
            reason,
            message: message.into(),
            source: None,
        }
    }

    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        LakeError::Query {
            kind,
            message: message.into(),
        }
    }

    /// The reason carried by an `Io` error, if this is one.
    pub fn io_reason(&self) -> Option<IoReason> {
        match self {
            LakeError::Io { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Classify an `std::io::Error` into the lake's reason taxonomy.
pub(crate) fn classify_io(err: std::io::Error, context: &str) -> LakeError {
    use std::io::ErrorKind;

    let reason = match err.kind() {
        ErrorKind::PermissionDenied => IoReason::Permission,
        ErrorKind::WouldBlock => IoReason::Conflict,
        ErrorKind::UnexpectedEof => IoReason::Truncated,
        _ => match err.raw_os_error() {
            Some(code) if code == libc::ENOSPC => IoReason::DiskFull,
            Some(code) if code == libc::EDQUOT => IoReason::DiskFull,
            _ => IoReason::Other,
        },
    };
    LakeError::Io {
        reason,
        message: format!("{context}: {err}"),
        source: Some(err),
    }
}

impl From<parquet::errors::ParquetError> for LakeError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        LakeError::Columnar(e.to_string())
    }
}

impl From<arrow::error::ArrowError> for LakeError {
    fn from(e: arrow::error::ArrowError) -> Self {
        LakeError::Columnar(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_permission() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let lake = classify_io(err, "open");
        assert_eq!(lake.io_reason(), Some(IoReason::Permission));
    }

    #[test]
    fn classify_maps_enospc() {
        let err = std::io::Error::from_raw_os_error(libc::ENOSPC);
        let lake = classify_io(err, "write");
        assert_eq!(lake.io_reason(), Some(IoReason::DiskFull));
    }

    #[test]
    fn classify_maps_truncation() {
        let err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let lake = classify_io(err, "read");
        assert_eq!(lake.io_reason(), Some(IoReason::Truncated));
    }
}
