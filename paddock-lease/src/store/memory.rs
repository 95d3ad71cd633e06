use std::{collections::HashMap, sync::Arc, time::SystemTime};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    clock::Clock,
    store::{ClaimRequest, Entry, ExpiryStore, Key, Store},
    Error, Result,
};

/// Reference store: one process-wide map, every operation atomic under a
/// single lock. Clones share state, which stands in for a fleet of
/// manager instances pointed at the same backing store.
#[derive(Clone)]
pub struct MemoryStore<C: Clock> {
    clock: C,
    state: Arc<Mutex<HashMap<Key, Entry>>>,
}

impl<C: Clock> MemoryStore<C> {
    pub fn new(clock: C) -> MemoryStore<C> {
        MemoryStore {
            clock,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn checked(&self, cancel: &CancellationToken) -> Result<SystemTime> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.clock.now())
    }
}

impl<C: Clock> ExpiryStore for MemoryStore<C> {
    async fn expire_leases(&self, cancel: CancellationToken) -> Result<()> {
        let now = self.checked(&cancel)?;
        let mut state = self.state.lock().await;
        let before = state.len();
        state.retain(|_, entry| !entry.expired(now));
        let swept = before - state.len();
        if swept > 0 {
            debug!(swept, "expired leases");
        } else {
            trace!("no expired leases");
        }
        Ok(())
    }
}

impl<C: Clock> Store for MemoryStore<C> {
    async fn claim(
        &self,
        cancel: CancellationToken,
        key: &Key,
        request: &ClaimRequest,
    ) -> Result<Entry> {
        let now = self.checked(&cancel)?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.get(key) {
            if !existing.expired(now) {
                return Err(Error::Held {
                    holder: existing.holder.clone(),
                    expiry: existing.expiry(),
                });
            }
        }
        let entry = Entry {
            holder: request.holder.clone(),
            start: now,
            duration: request.duration,
        };
        state.insert(key.clone(), entry.clone());
        debug!(%key, holder = %entry.holder, "claimed");
        Ok(entry)
    }

    async fn extend(
        &self,
        cancel: CancellationToken,
        key: &Key,
        request: &ClaimRequest,
    ) -> Result<Entry> {
        let now = self.checked(&cancel)?;
        let mut state = self.state.lock().await;
        let existing = match state.get(key) {
            Some(entry) if !entry.expired(now) => entry,
            _ => return Err(Error::NotHeld),
        };
        if existing.holder != request.holder {
            return Err(Error::InvalidHolder {
                holder: existing.holder.clone(),
            });
        }
        // Extension never shortens: keep the later of the old expiry and
        // now + duration.
        let expiry = existing.expiry().max(now + request.duration);
        let entry = Entry {
            holder: request.holder.clone(),
            start: now,
            duration: expiry
                .duration_since(now)
                .unwrap_or(request.duration),
        };
        state.insert(key.clone(), entry.clone());
        trace!(%key, holder = %entry.holder, "extended");
        Ok(entry)
    }

    async fn revoke(&self, cancel: CancellationToken, key: &Key, holder: &str) -> Result<()> {
        self.checked(&cancel)?;
        let mut state = self.state.lock().await;
        match state.get(key) {
            Some(entry) if entry.holder == holder => {
                state.remove(key);
                debug!(%key, holder, "revoked");
                Ok(())
            }
            Some(entry) => Err(Error::InvalidHolder {
                holder: entry.holder.clone(),
            }),
            None => Err(Error::NotHeld),
        }
    }

    async fn leases(
        &self,
        cancel: CancellationToken,
        namespace: &str,
    ) -> Result<HashMap<String, Entry>> {
        self.checked(&cancel)?;
        let state = self.state.lock().await;
        Ok(state
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(key, entry)| (key.name.clone(), entry.clone()))
            .collect())
    }
}
