//! # kiln-model
//!
//! The MicroVM aggregate shared by the reconciler, the repository and the
//! event payloads.
//!
//! A [`MicroVm`] pairs a desired [`MicroVmSpec`] (owned by the client,
//! versioned by a generation counter) with an observed [`MicroVmStatus`]
//! (owned by the controller). Two invariants hold at all times:
//!
//! - `status.observed_generation <= spec.generation`
//! - a delete never removes the aggregate directly; it moves through
//!   [`LogicalState::Deleting`] until every host resource is released

mod error;
mod spec;
mod status;
mod vm;

pub use error::ModelError;
pub use spec::*;
pub use status::*;
pub use vm::MicroVm;
