//! Bridge networking for processes living in their own network
//! namespace.
//!
//! A short-lived, privileged runtime hook: make sure the host bridge
//! exists, wire a veth pair between it and the target namespace, hand
//! the namespace an unused address from the bridge subnet and remember
//! the allocation durably.

pub mod addr;
pub mod allocator;
pub mod bridge;
pub mod client;
pub mod error;
pub mod firewall;
pub mod netlink;
pub mod netns;
pub mod probe;
pub mod store;

#[cfg(test)]
pub mod testutil;

pub use client::{Client, Endpoint, EndpointStatus, HookState, Opt};
pub use error::{NetworkError, Result};
