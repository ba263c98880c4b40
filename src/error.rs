//! Error kinds for the copy engine.
//!
//! Every failure is classified into one of the kinds below so that workers can
//! report task aborts with a stable identity and the orchestrator can decide
//! what is fatal to a task versus fatal to the process.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CopyError>;

#[derive(Debug, Error)]
pub enum CopyError {
    /// Malformed arguments, missing connections, or mutually exclusive modes.
    #[error("invalid invocation: {0}")]
    Invocation(String),

    /// A source or target session could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The source column list does not line up with the target table.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A value does not fit its target bind slot.
    #[error("value out of range: {0}")]
    Range(String),

    /// Character payload invalid under the declared charset.
    #[error("invalid character data: {0}")]
    Encoding(String),

    /// A large value exceeded the parameter limit while abort-on-oversized-blobs is set.
    #[error("oversized blob: {0}")]
    OversizedBlob(String),

    /// The target refused a flush even at a batch size of one row.
    #[error("insert exceeds max_allowed_packet: {0}")]
    PacketTooLarge(String),

    /// Any other driver-reported failure.
    #[error("driver error: {0}")]
    Driver(String),
}

impl From<mysql::Error> for CopyError {
    fn from(err: mysql::Error) -> Self {
        match &err {
            mysql::Error::IoError(_) => CopyError::Connect(err.to_string()),
            _ => CopyError::Driver(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_kind_prefix() {
        let err = CopyError::Invocation("missing source".into());
        assert_eq!(err.to_string(), "invalid invocation: missing source");

        let err = CopyError::PacketTooLarge("row of 32 MiB".into());
        assert!(err.to_string().contains("max_allowed_packet"));
    }
}
