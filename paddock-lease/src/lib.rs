//! Distributed lease management for fleet orchestration. A
//! [`manager::LeaseManager`] serializes all lease decisions for one
//! process through a single request queue, backed by a shared
//! [`store::Store`] that arbitrates between processes; a
//! [`reaper::ExpiryReaper`] sweeps leases whose holders have gone away.

mod error;
mod retry;

pub mod actor;
pub mod clock;
pub mod leadership;
pub mod manager;
pub mod metrics;
pub mod reaper;
pub mod store;

pub use error::{Error, Result};
pub use manager::{LeaseClient, LeaseManager, ManagerConfig, Token};
pub use retry::RetryPolicy;

#[cfg(test)]
pub mod tests;
