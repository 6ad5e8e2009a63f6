//! Validation errors for microVM specs.

use thiserror::Error;

/// A spec that cannot be realised as declared.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("no provider named in spec")]
    MissingProvider,

    #[error("vcpu count must be at least 1")]
    InvalidVcpu,

    #[error("memory must be at least {min} MiB, got {actual}")]
    InvalidMemory { min: u32, actual: u32 },

    #[error("{field} image reference is empty")]
    EmptyImage { field: String },

    #[error("duplicate volume id '{0}'")]
    DuplicateVolume(String),

    #[error("duplicate guest device '{0}'")]
    DuplicateInterface(String),

    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),

    #[error("metadata key must not be empty")]
    EmptyMetadataKey,

    #[error("generation {generation} is behind observed generation {observed}")]
    GenerationRegressed { generation: u64, observed: u64 },
}
