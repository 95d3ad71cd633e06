use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn, Level};

use crate::{clock::Clock, store::ExpiryStore, Error, Result};

/// Fleet-wide safety net for abandoned leases.
///
/// A holder that crashes never revokes, and its manager's cache and
/// timers die with it. The reaper runs against the shared store on a
/// fixed interval and sweeps everything past its recorded expiry, so
/// such leases are reclaimed within one polling interval of real time
/// passing their expiry, regardless of which manager granted them.
///
/// Store errors are treated as transient: the next tick retries. The
/// reaper never blocks claim/extend/revoke traffic; it shares nothing
/// with managers beyond the store itself.
pub struct ExpiryReaper<S: ExpiryStore, C: Clock> {
    clock: C,
    store: S,
    interval: Duration,
}

impl<S: ExpiryStore, C: Clock> std::fmt::Debug for ExpiryReaper<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryReaper")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl<S: ExpiryStore, C: Clock> ExpiryReaper<S, C> {
    pub fn new(clock: C, store: S, interval: Duration) -> Result<ExpiryReaper<S, C>> {
        if interval.is_zero() {
            return Err(Error::Invalid("reap interval must be non-zero".into()));
        }
        Ok(ExpiryReaper {
            clock,
            store,
            interval,
        })
    }

    #[tracing::instrument(skip_all, err(level = Level::TRACE), level = Level::TRACE)]
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(interval = ?self.interval, "expiry reaper started");
        loop {
            select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(());
                }
                _ = self.clock.sleep(self.interval) => {
                    trace!("reaping expired leases");
                    match self.store.expire_leases(cancel.child_token()).await {
                        Ok(()) => {}
                        Err(err) if err.is_cancelled() => return Ok(()),
                        Err(err) => {
                            warn!(err = %err, "expiring leases");
                        }
                    }
                }
            }
        }
    }
}
