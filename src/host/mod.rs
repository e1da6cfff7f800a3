//! Host-pool selection for the service endpoint classes.
//!
//! Each API family (uc, up, io, rs, rsf, monitor) talks to its own pool of
//! hosts. [`HostSelector`] rotates through a pool, temporarily sidelines
//! hosts that keep failing, and refreshes the pool in the background from an
//! optional [`HostsProvider`].

mod selector;

pub use selector::{HostSelector, HostSelectorOptions, HostsProvider};
