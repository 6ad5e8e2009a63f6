use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("expected namespace/name/uid, got '{0}'")]
    Malformed(String),

    #[error("uid has no '_' after its prefix")]
    MissingSeparator,

    #[error("uid prefix must be 'vm', got '{0}'")]
    WrongPrefix(String),

    #[error("uid is not a valid ULID: {0}")]
    InvalidUlid(String),

    /// A namespace or name label is not acceptable.
    #[error("invalid {field} '{value}': {reason}")]
    InvalidLabel {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}
