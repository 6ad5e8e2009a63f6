//! Error types for the host agent.
//!
//! Adapter failures are [`PortError`]s. The executor wraps them with the VM
//! and step they came from ([`ReconcileStepError`]) and the controller alone
//! decides, from their [`ErrorClass`], whether to retry or give up.

use kiln_events::EventError;
use kiln_id::{IdError, VmId};
use kiln_model::ModelError;
use thiserror::Error;

use crate::provider::Capability;

/// How the controller treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried at a fixed interval until the attempt budget is spent.
    Transient,
    /// Fatal for the current generation; never retried.
    Validation,
    /// The pass was aborted by shutdown; not counted as an attempt.
    Cancelled,
}

/// Failure reported by a provider, network, image or disk adapter.
#[derive(Debug, Error)]
pub enum PortError {
    /// The resource does not exist. Success for teardown steps.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The adapter cannot do what the spec asks for.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Failed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PortError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unsupported(_) => ErrorClass::Validation,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::NotFound(_) | Self::Unavailable(_) | Self::Failed(_) | Self::Io(_) => {
                ErrorClass::Transient
            }
        }
    }
}

pub type PortResult<T> = Result<T, PortError>;

/// An adapter failure annotated with where it happened.
#[derive(Debug, Error)]
#[error("reconciling {vm_id}: {step}: {source}")]
pub struct ReconcileStepError {
    pub vm_id: VmId,
    pub step: &'static str,
    pub source: PortError,
}

impl ReconcileStepError {
    pub fn new(vm_id: &VmId, step: &'static str, source: PortError) -> Self {
        Self {
            vm_id: vm_id.clone(),
            step,
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.source.class()
    }
}

/// A spec that cannot be planned on the selected provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error(transparent)]
    Invalid(#[from] ModelError),

    #[error("provider '{0}' is not registered")]
    UnknownProvider(String),

    #[error("provider '{provider}' does not support {capability}")]
    MissingCapability {
        provider: String,
        capability: Capability,
    },
}

/// Errors from the MicroVM repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored id is invalid: {0}")]
    Id(#[from] IdError),

    #[error("microVM not found: {0}")]
    NotFound(VmId),

    #[error("stale write for {id}: stored generation {stored}, written {written}")]
    Conflict { id: VmId, stored: u64, written: u64 },

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Errors that stop a reconcile call or the control loop itself.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("intent subscription closed unexpectedly")]
    BusClosed,
}

/// Errors from the command façade.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid spec: {0}")]
    Invalid(#[from] ModelError),

    #[error("invalid id: {0}")]
    Id(#[from] IdError),

    #[error("microVM not found: {0}")]
    NotFound(VmId),

    #[error("microVM {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },

    #[error("microVM {0} is being deleted")]
    Deleting(VmId),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Event(#[from] EventError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_error_classes() {
        assert_eq!(PortError::Failed("x".into()).class(), ErrorClass::Transient);
        assert_eq!(
            PortError::Unsupported("macvtap".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(PortError::Cancelled.class(), ErrorClass::Cancelled);
        assert!(PortError::NotFound("tap0".into()).is_not_found());
    }

    #[test]
    fn test_step_error_carries_context() {
        let id = VmId::generate("default", "web").unwrap();
        let err = ReconcileStepError::new(&id, "provider.create", PortError::Failed("boom".into()));
        let message = err.to_string();
        assert!(message.contains(&id.to_string()));
        assert!(message.contains("provider.create"));
        assert!(message.ends_with("boom"));
    }
}
