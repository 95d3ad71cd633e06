use std::time::Duration;

use rand::Rng;
use tokio::{select, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Level};

use crate::{
    clock::Clock,
    manager::{LeaseClient, Token},
    store::Key,
    Error, Result,
};

/// Narrow claim surface bound to one lease and one identity. Adds no
/// state of its own; every call goes straight through the manager.
#[derive(Clone)]
pub struct Claimer {
    client: LeaseClient,
    key: Key,
    holder: String,
}

impl Claimer {
    pub fn new(client: LeaseClient, key: Key, holder: impl Into<String>) -> Claimer {
        Claimer {
            client,
            key,
            holder: holder.into(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Claim (or extend) the lease for this claimer's identity.
    pub async fn claim_lease(&self, duration: Duration) -> Result<Token> {
        self.client
            .claim(self.key.clone(), self.holder.clone(), duration)
            .await
    }

    pub async fn release_lease(&self) -> Result<()> {
        self.client
            .revoke(self.key.clone(), self.holder.clone())
            .await
    }

    /// Identity of the current holder, if anyone holds the lease.
    pub async fn check_holder(&self) -> Result<Option<String>> {
        Ok(self
            .client
            .holder(self.key.clone())
            .await?
            .map(|entry| entry.holder))
    }
}

/// Fraction of the lease duration after which the tracker renews.
const RENEW_FRACTION: f64 = 2.0 / 3.0;

/// The reference lease consumer: keeps trying to be leader for one
/// application, renews ahead of expiry while it is, and publishes
/// transitions over a watch channel. Loss of the lease drops leadership
/// immediately; the tracker then goes back to contending for it.
pub struct LeadershipTracker<C: Clock> {
    clock: C,
    claimer: Claimer,
    duration: Duration,
    leader_tx: watch::Sender<bool>,
}

impl<C: Clock> LeadershipTracker<C> {
    pub fn new(clock: C, claimer: Claimer, duration: Duration) -> LeadershipTracker<C> {
        let (leader_tx, _) = watch::channel(false);
        LeadershipTracker {
            clock,
            claimer,
            duration,
            leader_tx,
        }
    }

    /// Observe leadership transitions. The receiver yields `true` while
    /// this tracker holds the lease.
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    #[tracing::instrument(skip_all, fields(key = %self.claimer.key(), holder = %self.claimer.holder()), err(level = Level::TRACE), level = Level::TRACE)]
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.claimer.claim_lease(self.duration).await {
                Ok(token) => {
                    info!("leadership gained");
                    self.leader_tx.send_replace(true);
                    self.lead(&cancel, token).await?;
                    self.leader_tx.send_replace(false);
                }
                Err(Error::Held { holder, .. }) => {
                    debug!(holder, "leadership contested");
                    self.wait_to_contend(&cancel).await;
                }
                Err(Error::Cancelled) => return Ok(()),
                Err(err) => {
                    warn!(err = %err, "claim failed");
                    self.wait_to_contend(&cancel).await;
                }
            }
        }
    }

    /// Hold leadership: renew ahead of expiry until the lease is lost or
    /// the tracker is cancelled.
    async fn lead(&self, cancel: &CancellationToken, token: Token) -> Result<()> {
        loop {
            let renew_in = self.duration.mul_f64(RENEW_FRACTION);
            select! {
                biased;
                _ = cancel.cancelled() => {
                    // Release on the way out so a successor need not wait
                    // for expiry; failure here is the reaper's problem.
                    if let Err(err) = self.claimer.release_lease().await {
                        debug!(err = %err, "release on shutdown failed");
                    }
                    return Ok(());
                }
                _ = token.wait_loss() => {
                    warn!("leadership lost");
                    return Ok(());
                }
                _ = self.clock.sleep(renew_in) => {
                    match self.claimer.claim_lease(self.duration).await {
                        Ok(_) => trace!("lease renewed"),
                        Err(Error::Held { holder, .. }) => {
                            // Someone else took over; the loss
                            // notification follows from the token.
                            debug!(holder, "renewal denied");
                        }
                        Err(Error::Cancelled) => return Ok(()),
                        Err(err) => {
                            // Keep leading until the token says
                            // otherwise; the next renewal may succeed.
                            warn!(err = %err, "renewal failed");
                        }
                    }
                }
            }
        }
    }

    /// Back off before contending again, jittered so competing trackers
    /// do not thunder at the manager in lockstep.
    async fn wait_to_contend(&self, cancel: &CancellationToken) {
        let base = self.duration.mul_f64(1.0 - RENEW_FRACTION);
        let jitter = rand::thread_rng().gen_range(0.0..0.5);
        let delay = base.mul_f64(1.0 + jitter);
        select! {
            _ = cancel.cancelled() => {}
            _ = self.clock.sleep(delay) => {}
        }
    }
}
