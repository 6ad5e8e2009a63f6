//! Host network adapters.
//!
//! Each guest interface is backed by a host device named
//! `{t|v}{uid short}{index}`; the planner chooses the name, the adapter only
//! creates, inspects and removes it.

mod tap;

pub use tap::{TapNetworkService, MAX_DEVICE_NAME_LEN};
