//! Power lifecycle of the inference machine
//!
//! The [`Coordinator`] owns every transition of the persisted
//! [`LifecycleState`](crate::state_store::LifecycleState):
//!
//! - `wake` - acquire a lease, sending a magic packet if the host is down
//! - `conditional_shutdown` - release a lease, powering off when none remain
//!   and permanent mode is off
//! - `forced_shutdown` - power off now and clear all leases
//! - `set_permanent` - toggle the permanent-on override
//! - `refresh_status` - re-probe host and service, optionally resetting leases
//!
//! Every transition that depends on reachability probes first and never
//! trusts the stored flags. Wakes and shutdowns run one at a time, so a
//! wake cannot slip in while a power-off is in flight.

mod coordinator;

pub use coordinator::{Collaborators, Coordinator};
