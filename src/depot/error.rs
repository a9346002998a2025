use serde::Serialize;
use std::fmt;
use std::io;

/// Machine-checkable failure category carried by every [`DepotError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AccessDenied,
    NotFound,
    InvalidInput,
    CodecError,
    IoFailure,
    ConcurrencyFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessDenied => "access_denied",
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::CodecError => "codec_error",
            Self::IoFailure => "io_failure",
            Self::ConcurrencyFailure => "concurrency_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the storage core.
#[derive(Debug, thiserror::Error)]
pub enum DepotError {
    /// A resolved path would leave the storage root.
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Archive could not be read or unpacked.
    #[error("archive error: {0}")]
    Codec(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("metadata document could not be parsed: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Lock acquisition or atomic replace failed.
    #[error("concurrency failure: {0}")]
    Concurrency(String),
}

impl DepotError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Codec(_) => ErrorKind::CodecError,
            Self::Io { .. } | Self::Corrupt(_) => ErrorKind::IoFailure,
            Self::Concurrency(_) => ErrorKind::ConcurrencyFailure,
        }
    }
}

impl From<zip::result::ZipError> for DepotError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<unrar::error::UnrarError> for DepotError {
    fn from(err: unrar::error::UnrarError) -> Self {
        Self::Codec(err.to_string())
    }
}

pub type DepotResult<T> = std::result::Result<T, DepotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_every_variant() {
        let cases = [
            (DepotError::AccessDenied("x".into()), ErrorKind::AccessDenied),
            (DepotError::NotFound("x".into()), ErrorKind::NotFound),
            (DepotError::InvalidInput("x".into()), ErrorKind::InvalidInput),
            (DepotError::Codec("x".into()), ErrorKind::CodecError),
            (
                DepotError::io("write", io::Error::other("disk")),
                ErrorKind::IoFailure,
            ),
            (DepotError::Concurrency("x".into()), ErrorKind::ConcurrencyFailure),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn io_error_message_carries_context() {
        let err = DepotError::io("failed to write upload", io::Error::other("disk full"));
        assert_eq!(err.to_string(), "failed to write upload: disk full");
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ConcurrencyFailure).unwrap();
        assert_eq!(json, "\"concurrency_failure\"");
    }
}
