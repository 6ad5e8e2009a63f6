//! # kiln-id
//!
//! Identity of a kiln microVM.
//!
//! A VM is addressed by `namespace/name/uid`. Namespace and name are
//! owner-chosen DNS-style labels; the uid ([`VmUid`], `vm_{ulid}`) is minted
//! when the VM is first declared. The canonical string form parses back to
//! an equal ID and is what gets serialized.
//!
//! ```text
//! tenant-a/web-1/vm_01HV4Z2WQXKJNM8GPQY6VBKC3D
//! ```

mod error;
mod types;

pub use error::IdError;
pub use types::{VmId, VmUid, MAX_LABEL_LEN};
