use std::{
    collections::HashMap,
    fmt,
    future::Future,
    time::{Duration, SystemTime},
};

use tokio_util::sync::CancellationToken;

use crate::Result;

mod memory;

pub use memory::MemoryStore;

/// Identifies a lease within the fleet: who is leader for application X,
/// which agent owns migration slot Y, and so on.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Key {
    pub namespace: String,
    pub name: String,
}

impl Key {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Key {
        Key {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A lease record as the store knows it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub holder: String,
    pub start: SystemTime,
    pub duration: Duration,
}

impl Entry {
    pub fn expiry(&self) -> SystemTime {
        self.start + self.duration
    }

    pub fn expired(&self, now: SystemTime) -> bool {
        self.expiry() <= now
    }
}

/// What a would-be holder asks the store for.
#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub holder: String,
    pub duration: Duration,
}

/// The narrow capability the expiry reaper runs against. Deliberately
/// decoupled from [`Store`] so the reaper needs nothing else.
pub trait ExpiryStore: Send + Sync + 'static {
    /// Remove every lease whose expiry has passed, across the entire
    /// store. Safe to call concurrently and repeatedly.
    fn expire_leases(&self, cancel: CancellationToken) -> impl Future<Output = Result<()>> + Send;
}

/// The durable, linearizable lease key space shared by every manager
/// instance in the fleet. Each operation is atomic with respect to other
/// callers; the store is the sole source of cross-process ordering.
///
/// Implementations are handles: cloning shares the underlying state.
pub trait Store: ExpiryStore + Clone {
    /// Record `request.holder` as the owner of `key`. Succeeds only if no
    /// unexpired lease exists for the key; an expired record is replaced.
    /// Fails [`crate::Error::Held`] naming the current holder otherwise.
    fn claim(
        &self,
        cancel: CancellationToken,
        key: &Key,
        request: &ClaimRequest,
    ) -> impl Future<Output = Result<Entry>> + Send;

    /// Push out the expiry of the lease on `key` to `now + duration`,
    /// never shortening it. Succeeds only if `request.holder` currently
    /// holds the lease unexpired.
    fn extend(
        &self,
        cancel: CancellationToken,
        key: &Key,
        request: &ClaimRequest,
    ) -> impl Future<Output = Result<Entry>> + Send;

    /// Release the lease on `key` if held by `holder`.
    fn revoke(
        &self,
        cancel: CancellationToken,
        key: &Key,
        holder: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Consistent snapshot of all leases in `namespace`, keyed by lease
    /// name. May include expired records not yet swept.
    fn leases(
        &self,
        cancel: CancellationToken,
        namespace: &str,
    ) -> impl Future<Output = Result<HashMap<String, Entry>>> + Send;
}
