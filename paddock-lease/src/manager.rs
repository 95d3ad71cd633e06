use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, SystemTime},
};

use anyhow::anyhow;
use prometheus::Registry;
use tokio::{select, task::AbortHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Level};

use crate::{
    actor::{Actor, ActorClient, Respondable, ResponseChannel},
    clock::Clock,
    metrics::{
        ManagerMetrics, OUTCOME_DENIED, OUTCOME_ERROR, OUTCOME_EXTENDED, OUTCOME_GRANTED,
        OUTCOME_INVALID,
    },
    retry::{with_backoff, RetryPolicy},
    store::{ClaimRequest, Entry, Key, Store},
    Error, Result,
};

const MAX_NAME_LEN: usize = 256;

/// Construction contract for the lease manager. Validated eagerly; a bad
/// configuration prevents the manager from starting at all.
pub struct ManagerConfig {
    /// Shortest lease a caller may request.
    pub min_duration: Duration,
    /// Longest lease a caller may request.
    pub max_duration: Duration,
    /// Backoff schedule for transient store failures.
    pub retry: RetryPolicy,
    /// Registry the manager's metrics are registered against.
    pub registry: Registry,
}

impl Default for ManagerConfig {
    fn default() -> ManagerConfig {
        ManagerConfig {
            min_duration: Duration::from_secs(1),
            max_duration: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            registry: Registry::new(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_duration.is_zero() {
            return Err(Error::Invalid("min_duration must be non-zero".into()));
        }
        if self.max_duration < self.min_duration {
            return Err(Error::Invalid(
                "max_duration must be >= min_duration".into(),
            ));
        }
        self.retry.validate()
    }
}

/// Capability held by a successful claimant: proof of "I currently hold
/// this lease", invalidated the instant the manager observes loss. Never
/// reused across holder changes; extension by the same holder keeps the
/// token alive.
#[derive(Clone, Debug)]
pub struct Token {
    key: Key,
    holder: String,
    expiry: SystemTime,
    lost: CancellationToken,
}

impl Token {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Expiry at grant time. A later extension pushes the real expiry out
    /// without reissuing the token.
    pub fn expiry(&self) -> SystemTime {
        self.expiry
    }

    /// Block until the lease is lost, whether by expiry, revocation or
    /// manager shutdown. Signalled exactly once per lease instance.
    pub async fn wait_loss(&self) {
        self.lost.cancelled().await
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }
}

/// Lease manager request messages.
pub enum Request {
    /// Acquire or extend the lease on `key` for `holder`.
    Claim {
        response_tx: ResponseChannel<Response>,
        key: Key,
        holder: String,
        duration: Duration,
    },

    /// Explicitly release the lease on `key` held by `holder`.
    Revoke {
        response_tx: ResponseChannel<Response>,
        key: Key,
        holder: String,
    },

    /// Who currently holds the lease on `key`, if anyone.
    Holder {
        response_tx: ResponseChannel<Response>,
        key: Key,
    },
}

impl Request {
    fn key(&self) -> &Key {
        match self {
            Request::Claim { key, .. } => key,
            Request::Revoke { key, .. } => key,
            Request::Holder { key, .. } => key,
        }
    }
}

impl Respondable for Request {
    type Response = Response;

    fn set_response(&mut self, ch: ResponseChannel<Self::Response>) {
        match self {
            Request::Claim { response_tx, .. } => *response_tx = ch,
            Request::Revoke { response_tx, .. } => *response_tx = ch,
            Request::Holder { response_tx, .. } => *response_tx = ch,
        }
    }
}

/// Lease manager response messages.
#[derive(Debug)]
pub enum Response {
    Claim(Result<Token>),
    Revoke(Result<()>),
    Holder(Result<Option<Entry>>),
}

#[derive(Clone, Copy, Debug)]
enum ClaimKind {
    Granted,
    Extended,
}

/// Internal completions fed back into the serialized loop: expiry timers
/// and finished store round-trips.
enum Event {
    TimerFired {
        key: Key,
    },
    ClaimDone {
        key: Key,
        result: Result<(Entry, ClaimKind)>,
        response_tx: ResponseChannel<Response>,
    },
    RevokeDone {
        key: Key,
        result: Result<()>,
        response_tx: ResponseChannel<Response>,
    },
    HolderDone {
        key: Key,
        result: Result<HashMap<String, Entry>>,
        response_tx: ResponseChannel<Response>,
    },
    Revalidated {
        key: Key,
        result: Result<HashMap<String, Entry>>,
    },
}

/// Work parked behind an in-flight store decision for the same key.
enum Pending {
    Caller(Request),
    Timer,
}

struct CacheEntry {
    entry: Entry,
    lost: CancellationToken,
    timer: Option<AbortHandle>,
    // A local caller holds a token for this entry.
    held: bool,
}

impl CacheEntry {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// The in-process lease authority. All claim/extend/revoke/check traffic
/// is funnelled through one request queue, so local races are decided
/// once, before touching the store; the store remains the final arbiter
/// against other manager instances in the fleet.
///
/// The cache is an optimization: it starts empty, is repopulated lazily
/// from store reads, and always yields to the store on conflict.
pub struct LeaseManager<S: Store, C: Clock> {
    clock: C,
    store: S,
    config: ManagerConfig,
    metrics: ManagerMetrics,
    cache: HashMap<Key, CacheEntry>,
    inflight: HashSet<Key>,
    deferred: HashMap<Key, VecDeque<Pending>>,
    event_tx: flume::Sender<Event>,
    event_rx: flume::Receiver<Event>,
}

impl<S: Store, C: Clock> LeaseManager<S, C> {
    pub fn new(clock: C, store: S, config: ManagerConfig) -> Result<LeaseManager<S, C>> {
        config.validate()?;
        let metrics = ManagerMetrics::new(&config.registry)?;
        let (event_tx, event_rx) = flume::unbounded();
        Ok(LeaseManager {
            clock,
            store,
            config,
            metrics,
            cache: HashMap::new(),
            inflight: HashSet::new(),
            deferred: HashMap::new(),
            event_tx,
            event_rx,
        })
    }

    fn handle_request(&mut self, cancel: &CancellationToken, req: Request) {
        let key = req.key().clone();
        if self.inflight.contains(&key) {
            self.deferred
                .entry(key)
                .or_default()
                .push_back(Pending::Caller(req));
            return;
        }
        self.dispatch(cancel, req);
    }

    fn dispatch(&mut self, cancel: &CancellationToken, req: Request) {
        match req {
            Request::Claim {
                response_tx,
                key,
                holder,
                duration,
            } => self.start_claim(cancel, key, holder, duration, response_tx),
            Request::Revoke {
                response_tx,
                key,
                holder,
            } => self.start_revoke(cancel, key, holder, response_tx),
            Request::Holder { response_tx, key } => self.start_holder(cancel, key, response_tx),
        }
    }

    fn handle_event(&mut self, cancel: &CancellationToken, event: Event) {
        match event {
            Event::TimerFired { key } => self.handle_timer(cancel, key),
            Event::ClaimDone {
                key,
                result,
                response_tx,
            } => {
                self.inflight.remove(&key);
                self.finish_claim(&key, result, response_tx);
                self.drain_deferred(cancel, &key);
            }
            Event::RevokeDone {
                key,
                result,
                response_tx,
            } => {
                self.inflight.remove(&key);
                self.finish_revoke(&key, result, response_tx);
                self.drain_deferred(cancel, &key);
            }
            Event::HolderDone {
                key,
                result,
                response_tx,
            } => {
                self.inflight.remove(&key);
                self.finish_holder(&key, result, response_tx);
                self.drain_deferred(cancel, &key);
            }
            Event::Revalidated { key, result } => {
                self.inflight.remove(&key);
                self.finish_revalidate(&key, result);
                self.drain_deferred(cancel, &key);
            }
        }
    }

    fn start_claim(
        &mut self,
        cancel: &CancellationToken,
        key: Key,
        holder: String,
        duration: Duration,
        response_tx: ResponseChannel<Response>,
    ) {
        if let Err(err) = self.validate_claim(&key, &holder, duration) {
            self.metrics.claim_outcome(OUTCOME_INVALID);
            response_tx.send(Response::Claim(Err(err)));
            return;
        }
        let now = self.clock.now();
        let try_extend = match self.cache.get(&key) {
            Some(cached) if cached.entry.holder != holder && !cached.entry.expired(now) => {
                debug!(%key, holder, current = %cached.entry.holder, "claim denied from cache");
                self.metrics.claim_outcome(OUTCOME_DENIED);
                response_tx.send(Response::Claim(Err(Error::Held {
                    holder: cached.entry.holder.clone(),
                    expiry: cached.entry.expiry(),
                })));
                return;
            }
            Some(cached) => cached.entry.holder == holder,
            None => false,
        };

        self.inflight.insert(key.clone());
        let store = self.store.clone();
        let retry = self.config.retry.clone();
        let retries = self.metrics.retries.clone();
        let event_tx = self.event_tx.clone();
        let cancel = cancel.child_token();
        let request = ClaimRequest {
            holder,
            duration,
        };
        tokio::spawn(async move {
            let mut attempt = 0u32;
            let result = with_backoff(&cancel, &retry, || {
                attempt += 1;
                if attempt > 1 {
                    retries.inc();
                }
                let store = store.clone();
                let key = key.clone();
                let request = request.clone();
                let cancel = cancel.clone();
                async move {
                    if try_extend {
                        match store.extend(cancel.clone(), &key, &request).await {
                            Ok(entry) => Ok((entry, ClaimKind::Extended)),
                            // The store no longer has our lease: it lapsed
                            // and was swept. Fall back to a fresh claim.
                            Err(Error::NotHeld) => store
                                .claim(cancel, &key, &request)
                                .await
                                .map(|entry| (entry, ClaimKind::Granted)),
                            Err(err) => Err(err),
                        }
                    } else {
                        store
                            .claim(cancel, &key, &request)
                            .await
                            .map(|entry| (entry, ClaimKind::Granted))
                    }
                }
            })
            .await;
            let _ = event_tx
                .send_async(Event::ClaimDone {
                    key,
                    result,
                    response_tx,
                })
                .await;
        });
    }

    fn finish_claim(
        &mut self,
        key: &Key,
        result: Result<(Entry, ClaimKind)>,
        response_tx: ResponseChannel<Response>,
    ) {
        match result {
            Ok((entry, kind)) => {
                let reuse_token = matches!(kind, ClaimKind::Extended);
                let lost = self.upsert(key, entry.clone(), reuse_token, true);
                match kind {
                    ClaimKind::Granted => {
                        info!(%key, holder = %entry.holder, expiry = ?entry.expiry(), "lease granted");
                        self.metrics.claim_outcome(OUTCOME_GRANTED);
                    }
                    ClaimKind::Extended => {
                        debug!(%key, holder = %entry.holder, expiry = ?entry.expiry(), "lease extended");
                        self.metrics.claim_outcome(OUTCOME_EXTENDED);
                    }
                }
                response_tx.send(Response::Claim(Ok(Token {
                    key: key.clone(),
                    holder: entry.holder,
                    expiry: entry.start + entry.duration,
                    lost,
                })));
            }
            Err(Error::Held { holder, expiry }) => {
                // Another process won the race; the store's verdict
                // overrides whatever the cache believed.
                let now = self.clock.now();
                self.upsert(
                    key,
                    Entry {
                        holder: holder.clone(),
                        start: now,
                        duration: expiry.duration_since(now).unwrap_or(Duration::ZERO),
                    },
                    true,
                    false,
                );
                debug!(%key, holder, "claim denied by store");
                self.metrics.claim_outcome(OUTCOME_DENIED);
                response_tx.send(Response::Claim(Err(Error::Held { holder, expiry })));
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(%key, err = %err, "claim failed after retries");
                }
                self.metrics.claim_outcome(OUTCOME_ERROR);
                response_tx.send(Response::Claim(Err(err)));
            }
        }
    }

    fn start_revoke(
        &mut self,
        cancel: &CancellationToken,
        key: Key,
        holder: String,
        response_tx: ResponseChannel<Response>,
    ) {
        if let Err(err) = validate_key(&key).and_then(|_| validate_name("holder", &holder)) {
            response_tx.send(Response::Revoke(Err(err)));
            return;
        }
        let now = self.clock.now();
        match self.cache.get(&key) {
            Some(cached) if cached.entry.holder != holder && !cached.entry.expired(now) => {
                response_tx.send(Response::Revoke(Err(Error::InvalidHolder {
                    holder: cached.entry.holder.clone(),
                })));
                return;
            }
            Some(cached) if cached.entry.holder == holder => {
                // Invalidate locally before the store round-trip: the
                // token must not claim to be held past the holder's own
                // release.
                if let Some(mut cached) = self.cache.remove(&key) {
                    cached.clear_timer();
                    cached.lost.cancel();
                }
                self.metrics.cache_entries.set(self.cache.len() as i64);
            }
            // Cold cache, or a stale record for a lease that may have
            // changed hands since it expired: the store decides.
            _ => {}
        }

        self.inflight.insert(key.clone());
        let store = self.store.clone();
        let retry = self.config.retry.clone();
        let retries = self.metrics.retries.clone();
        let event_tx = self.event_tx.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            let result = with_backoff(&cancel, &retry, || {
                attempt += 1;
                if attempt > 1 {
                    retries.inc();
                }
                let store = store.clone();
                let key = key.clone();
                let holder = holder.clone();
                let cancel = cancel.clone();
                async move { store.revoke(cancel, &key, &holder).await }
            })
            .await;
            let _ = event_tx
                .send_async(Event::RevokeDone {
                    key,
                    result,
                    response_tx,
                })
                .await;
        });
    }

    fn finish_revoke(&mut self, key: &Key, result: Result<()>, response_tx: ResponseChannel<Response>) {
        match &result {
            Ok(()) => {
                debug!(%key, "lease revoked");
                self.metrics.revocations.inc();
            }
            Err(err) => {
                // Best-effort from the store's perspective; the reaper
                // reclaims anything we failed to release here.
                debug!(%key, err = %err, "store revoke failed");
            }
        }
        response_tx.send(Response::Revoke(result));
    }

    fn start_holder(
        &mut self,
        cancel: &CancellationToken,
        key: Key,
        response_tx: ResponseChannel<Response>,
    ) {
        if let Err(err) = validate_key(&key) {
            response_tx.send(Response::Holder(Err(err)));
            return;
        }
        let now = self.clock.now();
        if let Some(cached) = self.cache.get(&key) {
            if !cached.entry.expired(now) {
                response_tx.send(Response::Holder(Ok(Some(cached.entry.clone()))));
                return;
            }
        }

        self.inflight.insert(key.clone());
        self.spawn_namespace_read(cancel, key, Some(response_tx));
    }

    fn finish_holder(
        &mut self,
        key: &Key,
        result: Result<HashMap<String, Entry>>,
        response_tx: ResponseChannel<Response>,
    ) {
        let now = self.clock.now();
        let response = match result {
            Ok(leases) => match leases.get(&key.name) {
                Some(entry) if !entry.expired(now) => {
                    self.upsert(key, entry.clone(), true, false);
                    Ok(Some(entry.clone()))
                }
                _ => {
                    self.expire_local(key);
                    Ok(None)
                }
            },
            Err(err) => Err(err),
        };
        response_tx.send(Response::Holder(response));
    }

    fn handle_timer(&mut self, cancel: &CancellationToken, key: Key) {
        if self.inflight.contains(&key) {
            self.deferred
                .entry(key)
                .or_default()
                .push_back(Pending::Timer);
            return;
        }
        let Some(expiry) = self.cache.get(&key).map(|cached| cached.entry.expiry()) else {
            // Revoked or replaced since the timer was set.
            return;
        };
        let now = self.clock.now();
        if expiry > now {
            // Extended since the timer was set; push the timer out.
            let timer = self.schedule_timer(&key, expiry.duration_since(now).unwrap_or_default());
            if let Some(cached) = self.cache.get_mut(&key) {
                if let Some(old) = cached.timer.replace(timer) {
                    old.abort();
                }
            }
            return;
        }

        // The lease looks expired locally, but a just-completed extend
        // elsewhere may have raced the timer: reconfirm with the store
        // before notifying waiters.
        trace!(%key, "expiry timer fired, revalidating");
        self.inflight.insert(key.clone());
        self.spawn_revalidate(cancel, key);
    }

    fn finish_revalidate(&mut self, key: &Key, result: Result<HashMap<String, Entry>>) {
        let now = self.clock.now();
        match result {
            Ok(leases) => match leases.get(&key.name) {
                Some(entry) if !entry.expired(now) => {
                    let same_holder = self
                        .cache
                        .get(key)
                        .map(|cached| cached.entry.holder == entry.holder)
                        .unwrap_or(false);
                    if same_holder {
                        trace!(%key, "lease extended behind the timer, rescheduling");
                        self.upsert(key, entry.clone(), true, false);
                    } else {
                        // A different holder took over; the local lease
                        // instance is gone.
                        self.metrics.expirations.inc();
                        self.upsert(key, entry.clone(), false, false);
                    }
                }
                _ => {
                    debug!(%key, "lease expiry confirmed");
                    self.expire_local(key);
                    self.metrics.expirations.inc();
                }
            },
            Err(err) => {
                // Cannot confirm the lease still stands. Erring toward
                // loss is safe: a token invalidated early never violates
                // the single-winner invariant, a stale "still held" does.
                warn!(%key, err = %err, "revalidation failed, treating lease as lost");
                self.expire_local(key);
                self.metrics.expirations.inc();
            }
        }
    }

    fn spawn_revalidate(&mut self, cancel: &CancellationToken, key: Key) {
        self.spawn_namespace_read(cancel, key, None);
    }

    /// Snapshot the key's namespace from the store. With a response
    /// channel the completion answers a holder query; without one it
    /// revalidates a fired expiry timer.
    fn spawn_namespace_read(
        &mut self,
        cancel: &CancellationToken,
        key: Key,
        response_tx: Option<ResponseChannel<Response>>,
    ) {
        let store = self.store.clone();
        let retry = self.config.retry.clone();
        let retries = self.metrics.retries.clone();
        let event_tx = self.event_tx.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            let result = with_backoff(&cancel, &retry, || {
                attempt += 1;
                if attempt > 1 {
                    retries.inc();
                }
                let store = store.clone();
                let namespace = key.namespace.clone();
                let cancel = cancel.clone();
                async move { store.leases(cancel, &namespace).await }
            })
            .await;
            let event = match response_tx {
                Some(response_tx) => Event::HolderDone {
                    key,
                    result,
                    response_tx,
                },
                None => Event::Revalidated { key, result },
            };
            let _ = event_tx.send_async(event).await;
        });
    }

    /// Install or refresh a cache entry. Returns the entry's loss token.
    /// `reuse_token` keeps the existing token when the holder is
    /// unchanged (same lease instance); a new lease instance cancels the
    /// old token and issues a fresh one. `grant` marks the entry as held
    /// by a local caller; only held entries get an expiry timer, records
    /// cached for leases held elsewhere revalidate lazily on the next
    /// touch instead of generating background store traffic.
    fn upsert(&mut self, key: &Key, entry: Entry, reuse_token: bool, grant: bool) -> CancellationToken {
        let now = self.clock.now();
        let (lost, held) = match self.cache.remove(key) {
            Some(mut prior) => {
                prior.clear_timer();
                if reuse_token && prior.entry.holder == entry.holder {
                    (prior.lost, grant || prior.held)
                } else {
                    prior.lost.cancel();
                    (CancellationToken::new(), grant)
                }
            }
            None => (CancellationToken::new(), grant),
        };
        let timer = if held {
            let delay = entry.expiry().duration_since(now).unwrap_or(Duration::ZERO);
            Some(self.schedule_timer(key, delay))
        } else {
            None
        };
        self.cache.insert(
            key.clone(),
            CacheEntry {
                entry,
                lost: lost.clone(),
                timer,
                held,
            },
        );
        self.metrics.cache_entries.set(self.cache.len() as i64);
        lost
    }

    fn expire_local(&mut self, key: &Key) {
        if let Some(mut cached) = self.cache.remove(key) {
            cached.clear_timer();
            cached.lost.cancel();
            self.metrics.cache_entries.set(self.cache.len() as i64);
        }
    }

    fn schedule_timer(&self, key: &Key, delay: Duration) -> AbortHandle {
        let clock = self.clock.clone();
        let event_tx = self.event_tx.clone();
        let key = key.clone();
        tokio::spawn(async move {
            clock.sleep(delay).await;
            let _ = event_tx.send_async(Event::TimerFired { key }).await;
        })
        .abort_handle()
    }

    fn drain_deferred(&mut self, cancel: &CancellationToken, key: &Key) {
        loop {
            if self.inflight.contains(key) {
                return;
            }
            let pending = match self.deferred.get_mut(key) {
                Some(queue) => match queue.pop_front() {
                    Some(pending) => {
                        if queue.is_empty() {
                            self.deferred.remove(key);
                        }
                        pending
                    }
                    None => {
                        self.deferred.remove(key);
                        return;
                    }
                },
                None => return,
            };
            match pending {
                Pending::Caller(req) => self.dispatch(cancel, req),
                Pending::Timer => self.handle_timer(cancel, key.clone()),
            }
        }
    }

    fn validate_claim(&self, key: &Key, holder: &str, duration: Duration) -> Result<()> {
        validate_key(key)?;
        validate_name("holder", holder)?;
        if duration < self.config.min_duration || duration > self.config.max_duration {
            return Err(Error::Invalid(format!(
                "duration {duration:?} outside [{:?}, {:?}]",
                self.config.min_duration, self.config.max_duration
            )));
        }
        Ok(())
    }

    /// Waiters are notified on shutdown: with no manager to maintain the
    /// lease locally, holders must not keep acting on their tokens.
    fn shutdown(&mut self) {
        for (_, mut cached) in self.cache.drain() {
            cached.clear_timer();
            cached.lost.cancel();
        }
        self.metrics.cache_entries.set(0);
        debug!("lease manager stopped");
    }
}

impl<S: Store, C: Clock> Actor for LeaseManager<S, C> {
    type Request = Request;
    type Response = Response;

    #[tracing::instrument(skip_all, err(level = Level::TRACE), level = Level::TRACE)]
    async fn run(
        &mut self,
        cancel: CancellationToken,
        request_rx: flume::Receiver<Self::Request>,
    ) -> Result<()> {
        info!("lease manager started");
        let event_rx = self.event_rx.clone();
        loop {
            select! {
                biased;
                _ = cancel.cancelled() => {
                    self.shutdown();
                    return Ok(());
                }
                res = request_rx.recv_async() => {
                    match res {
                        Ok(req) => self.handle_request(&cancel, req),
                        // All clients gone.
                        Err(_) => {
                            self.shutdown();
                            return Ok(());
                        }
                    }
                }
                res = event_rx.recv_async() => {
                    if let Ok(event) = res {
                        self.handle_event(&cancel, event);
                    }
                }
            }
        }
    }
}

fn validate_key(key: &Key) -> Result<()> {
    validate_name("namespace", &key.namespace)?;
    validate_name("lease name", &key.name)
}

fn validate_name(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Invalid(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(Error::Invalid(format!(
            "{kind} must be at most {MAX_NAME_LEN} bytes"
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Invalid(format!(
            "{kind} must not contain whitespace or control characters"
        )));
    }
    Ok(())
}

/// Typed client handle over the manager's request channel.
#[derive(Clone)]
pub struct LeaseClient {
    client: ActorClient<Request>,
}

impl LeaseClient {
    pub fn new(client: ActorClient<Request>) -> LeaseClient {
        LeaseClient { client }
    }

    /// Claim the lease on `key` for `holder`, or extend it if `holder`
    /// already holds it.
    pub async fn claim(
        &self,
        key: Key,
        holder: impl Into<String>,
        duration: Duration,
    ) -> Result<Token> {
        let req = Request::Claim {
            response_tx: ResponseChannel::default(),
            key,
            holder: holder.into(),
            duration,
        };
        match self.client.call(req).await? {
            Response::Claim(result) => result,
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn revoke(&self, key: Key, holder: impl Into<String>) -> Result<()> {
        let req = Request::Revoke {
            response_tx: ResponseChannel::default(),
            key,
            holder: holder.into(),
        };
        match self.client.call(req).await? {
            Response::Revoke(result) => result,
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn holder(&self, key: Key) -> Result<Option<Entry>> {
        let req = Request::Holder {
            response_tx: ResponseChannel::default(),
            key,
        };
        match self.client.call(req).await? {
            Response::Holder(result) => result,
            other => Err(unexpected_response(other)),
        }
    }
}

fn unexpected_response(response: Response) -> Error {
    Error::Other(anyhow!("unexpected response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::{Duration, UNIX_EPOCH},
    };

    use anyhow::anyhow;
    use prometheus::Registry;
    use tokio::select;
    use tokio_util::sync::CancellationToken;

    use super::{LeaseClient, LeaseManager, ManagerConfig, Request};
    use crate::{
        actor::Operator,
        clock::ManualClock,
        retry::RetryPolicy,
        store::{Entry, Key, MemoryStore, Store},
        tests::StubStore,
        Error,
    };

    fn key() -> Key {
        Key::new("app", "leader")
    }

    fn thirty() -> Duration {
        Duration::from_secs(30)
    }

    fn spawn_manager<S: Store>(
        clock: ManualClock,
        store: S,
        config: ManagerConfig,
    ) -> (CancellationToken, Operator<Request>, LeaseClient) {
        let cancel = CancellationToken::new();
        let manager = LeaseManager::new(clock, store, config).expect("manager");
        let operator = Operator::new(cancel.clone(), manager);
        let client = LeaseClient::new(operator.client());
        (cancel, operator, client)
    }

    fn memory_setup() -> (
        ManualClock,
        MemoryStore<ManualClock>,
        CancellationToken,
        Operator<Request>,
        LeaseClient,
    ) {
        let clock = ManualClock::new(UNIX_EPOCH);
        let store = MemoryStore::new(clock.clone());
        let (cancel, operator, client) =
            spawn_manager(clock.clone(), store.clone(), ManagerConfig::default());
        (clock, store, cancel, operator, client)
    }

    #[tokio::test]
    async fn claim_grants_a_token() {
        let (_, _, _cancel, _operator, client) = memory_setup();
        let token = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("claim");
        assert_eq!(token.holder(), "agent-a");
        assert_eq!(token.expiry(), UNIX_EPOCH + Duration::from_secs(30));
        assert!(!token.is_lost());

        let entry = client.holder(key()).await.expect("holder").expect("held");
        assert_eq!(entry.holder, "agent-a");
    }

    #[tokio::test]
    async fn contested_claim_is_denied_from_cache() {
        let clock = ManualClock::new(UNIX_EPOCH);
        let store = StubStore::new();
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = calls.clone();
            *store.claim_result.lock().expect("lock") = Box::new(move |_key, request| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Entry {
                    holder: request.holder.clone(),
                    start: UNIX_EPOCH,
                    duration: request.duration,
                })
            });
        }
        let (_cancel, _operator, client) =
            spawn_manager(clock, store, ManagerConfig::default());

        client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("claim");
        // The loser is turned away by the cache; the store sees exactly
        // one claim.
        let err = client
            .claim(key(), "agent-b", thirty())
            .await
            .expect_err("contested claim");
        match err {
            Error::Held { holder, expiry } => {
                assert_eq!(holder, "agent-a");
                assert_eq!(expiry, UNIX_EPOCH + Duration::from_secs(30));
            }
            other => panic!("expected Held, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extend_moves_expiry_and_keeps_the_token() {
        let (clock, store, cancel, _operator, client) = memory_setup();
        let token = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("claim");

        clock.advance(Duration::from_secs(10));
        let renewed = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("extend");
        assert_eq!(renewed.expiry(), UNIX_EPOCH + Duration::from_secs(40));
        assert!(!token.is_lost());

        let leases = store
            .leases(cancel.child_token(), "app")
            .await
            .expect("leases");
        assert_eq!(
            leases.get("leader").expect("entry").expiry(),
            UNIX_EPOCH + Duration::from_secs(40)
        );
    }

    #[tokio::test]
    async fn expiry_notifies_loss_and_frees_the_key() {
        let (clock, _, _cancel, _operator, client) = memory_setup();
        let token = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("claim");

        clock.advance(Duration::from_secs(31));
        tokio::time::timeout(Duration::from_secs(5), token.wait_loss())
            .await
            .expect("loss before timeout");

        let successor = client
            .claim(key(), "agent-b", thirty())
            .await
            .expect("claim after expiry");
        assert_eq!(successor.holder(), "agent-b");
    }

    #[tokio::test]
    async fn racing_extend_reschedules_the_timer() {
        let (clock, store, cancel, _operator, client) = memory_setup();
        let token = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("claim");

        // Another manager instance extends the same holder's lease just
        // before our local timer fires.
        clock.advance(Duration::from_secs(29));
        store
            .extend(
                cancel.child_token(),
                &key(),
                &crate::store::ClaimRequest {
                    holder: "agent-a".to_owned(),
                    duration: thirty(),
                },
            )
            .await
            .expect("external extend");

        clock.advance(Duration::from_secs(2));
        // Revalidation sees the lease alive and must not signal loss.
        let entry = client.holder(key()).await.expect("holder").expect("held");
        assert_eq!(entry.holder, "agent-a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_lost());

        // Once the extended expiry truly passes, loss is signalled.
        clock.advance(Duration::from_secs(30));
        tokio::time::timeout(Duration::from_secs(5), token.wait_loss())
            .await
            .expect("loss before timeout");
    }

    #[tokio::test]
    async fn revoke_invalidates_immediately() {
        let (_, _, _cancel, _operator, client) = memory_setup();
        let token = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("claim");

        client.revoke(key(), "agent-a").await.expect("revoke");
        assert!(token.is_lost());
        assert!(client.holder(key()).await.expect("holder").is_none());

        client
            .claim(key(), "agent-b", thirty())
            .await
            .expect("claim after revoke");
    }

    #[tokio::test]
    async fn revoke_by_non_holder_is_rejected() {
        let (_, _, _cancel, _operator, client) = memory_setup();
        let token = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("claim");

        let err = client
            .revoke(key(), "agent-b")
            .await
            .expect_err("revoke by non-holder");
        match err {
            Error::InvalidHolder { holder } => assert_eq!(holder, "agent-a"),
            other => panic!("expected InvalidHolder, got {other:?}"),
        }
        assert!(!token.is_lost());
    }

    #[tokio::test]
    async fn malformed_requests_never_reach_the_store() {
        // Every stub operation panics if called.
        let clock = ManualClock::new(UNIX_EPOCH);
        let (_cancel, _operator, client) =
            spawn_manager(clock, StubStore::new(), ManagerConfig::default());

        for (key, holder, duration) in [
            (Key::new("", "leader"), "agent-a", thirty()),
            (Key::new("app", ""), "agent-a", thirty()),
            (Key::new("app", "lea der"), "agent-a", thirty()),
            (Key::new("app", "leader"), "", thirty()),
            (Key::new("app", "leader"), "agent-a", Duration::ZERO),
            (Key::new("app", "leader"), "agent-a", Duration::from_secs(601)),
        ] {
            let err = client
                .claim(key, holder, duration)
                .await
                .expect_err("invalid claim");
            assert!(matches!(err, Error::Invalid(_)), "got {err:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_errors_are_retried() {
        let clock = ManualClock::new(UNIX_EPOCH);
        let store = StubStore::new();
        let attempts = Arc::new(AtomicU32::new(0));
        {
            let attempts = attempts.clone();
            *store.claim_result.lock().expect("lock") = Box::new(move |_key, request| {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::unavailable(anyhow!("store down")))
                } else {
                    Ok(Entry {
                        holder: request.holder.clone(),
                        start: UNIX_EPOCH,
                        duration: request.duration,
                    })
                }
            });
        }
        let (_cancel, _operator, client) =
            spawn_manager(clock, store, ManagerConfig::default());

        let token = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("claim after retries");
        assert_eq!(token.holder(), "agent-a");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_errors_escalate_after_the_budget() {
        let clock = ManualClock::new(UNIX_EPOCH);
        let store = StubStore::new();
        let attempts = Arc::new(AtomicU32::new(0));
        {
            let attempts = attempts.clone();
            *store.claim_result.lock().expect("lock") = Box::new(move |_key, _request| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::unavailable(anyhow!("store down")))
            });
        }
        let config = ManagerConfig {
            retry: RetryPolicy {
                max_retries: 1,
                ..RetryPolicy::default()
            },
            ..ManagerConfig::default()
        };
        let (_cancel, _operator, client) = spawn_manager(clock, store, config);

        let err = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect_err("claim fails");
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_conflict_refreshes_the_cache() {
        let clock = ManualClock::new(UNIX_EPOCH);
        let store = StubStore::new();
        *store.claim_result.lock().expect("lock") = Box::new(|_key, _request| {
            Err(Error::Held {
                holder: "agent-elsewhere".to_owned(),
                expiry: UNIX_EPOCH + Duration::from_secs(30),
            })
        });
        let (_cancel, _operator, client) =
            spawn_manager(clock, store, ManagerConfig::default());

        let err = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect_err("denied by store");
        assert_eq!(err.held_by(), Some("agent-elsewhere"));

        // The holder query is answered from the refreshed cache; the
        // stub's leases closure would panic if consulted.
        let entry = client.holder(key()).await.expect("holder").expect("held");
        assert_eq!(entry.holder, "agent-elsewhere");
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_at_expiry_is_treated_as_loss() {
        let clock = ManualClock::new(UNIX_EPOCH);
        let store = StubStore::new();
        *store.claim_result.lock().expect("lock") = Box::new(|_key, request| {
            Ok(Entry {
                holder: request.holder.clone(),
                start: UNIX_EPOCH,
                duration: request.duration,
            })
        });
        *store.leases_result.lock().expect("lock") =
            Box::new(|_namespace| Err(Error::unavailable(anyhow!("store down"))));
        let registry = Registry::new();
        let config = ManagerConfig {
            registry: registry.clone(),
            retry: RetryPolicy {
                max_retries: 1,
                ..RetryPolicy::default()
            },
            ..ManagerConfig::default()
        };
        let (_cancel, _operator, client) = spawn_manager(clock.clone(), store, config);

        let token = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect("claim");

        // The timer fires but revalidation cannot reach the store. The
        // lease must be treated as lost rather than silently kept.
        clock.advance(Duration::from_secs(31));
        tokio::time::timeout(Duration::from_secs(5), token.wait_loss())
            .await
            .expect("loss before timeout");

        let cache_entries = registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "paddock_lease_cache_entries")
            .expect("gauge");
        assert_eq!(cache_entries.get_metric()[0].get_gauge().get_value(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_does_not_abandon_the_claim() {
        let clock = ManualClock::new(UNIX_EPOCH);
        let store = StubStore::new();
        let (started_tx, started_rx) = flume::unbounded();
        {
            let mut first = true;
            *store.claim_result.lock().expect("lock") = Box::new(move |_key, request| {
                if first {
                    first = false;
                    started_tx.send(()).expect("send started");
                    Err(Error::unavailable(anyhow!("store down")))
                } else {
                    Ok(Entry {
                        holder: request.holder.clone(),
                        start: UNIX_EPOCH,
                        duration: request.duration,
                    })
                }
            });
        }
        let (_cancel, _operator, client) =
            spawn_manager(clock, store, ManagerConfig::default());

        // Walk the claim far enough to reach the store, then stop
        // waiting while the retry is still pending.
        let mut claim = Box::pin(client.claim(key(), "agent-a", thirty()));
        select! {
            _ = &mut claim => panic!("claim resolved before the store did"),
            res = started_rx.recv_async() => res.expect("claim reached the store"),
        }
        drop(claim);

        // The manager still finishes the round-trip and reconciles its
        // cache; the stub's leases closure would panic if consulted.
        let entry = tokio::time::timeout(Duration::from_secs(5), client.holder(key()))
            .await
            .expect("holder before timeout")
            .expect("holder")
            .expect("held");
        assert_eq!(entry.holder, "agent-a");
    }

    #[tokio::test]
    async fn revoke_after_foreign_expiry_defers_to_the_store() {
        let clock = ManualClock::new(UNIX_EPOCH);
        let store = StubStore::new();
        *store.claim_result.lock().expect("lock") = Box::new(|_key, _request| {
            Err(Error::Held {
                holder: "agent-b".to_owned(),
                expiry: UNIX_EPOCH + Duration::from_secs(30),
            })
        });
        *store.revoke_result.lock().expect("lock") = Box::new(|_key, _holder| Ok(()));
        let (_cancel, _operator, client) =
            spawn_manager(clock.clone(), store, ManagerConfig::default());

        // Prime the cache with the foreign holder's record.
        let err = client
            .claim(key(), "agent-a", thirty())
            .await
            .expect_err("denied by store");
        assert_eq!(err.held_by(), Some("agent-b"));

        // Once that record has expired the lease may have changed hands
        // through another manager; the stale cache entry must not veto
        // the revoke on its own.
        clock.advance(Duration::from_secs(31));
        client
            .revoke(key(), "agent-a")
            .await
            .expect("revoke decided by the store");
    }

    #[tokio::test]
    async fn foreign_leases_are_cached_without_timers() {
        let clock = ManualClock::new(UNIX_EPOCH);
        let store = StubStore::new();
        *store.claim_result.lock().expect("lock") = Box::new(|_key, _request| {
            Err(Error::Held {
                holder: "agent-b".to_owned(),
                expiry: UNIX_EPOCH + Duration::from_secs(30),
            })
        });
        let leases_calls = Arc::new(AtomicU32::new(0));
        {
            let leases_calls = leases_calls.clone();
            *store.leases_result.lock().expect("lock") = Box::new(move |_namespace| {
                leases_calls.fetch_add(1, Ordering::SeqCst);
                Ok(HashMap::new())
            });
        }
        let (_cancel, _operator, client) =
            spawn_manager(clock.clone(), store, ManagerConfig::default());

        client
            .claim(key(), "agent-a", thirty())
            .await
            .expect_err("denied by store");

        // No local caller holds this lease, so its expiry must not
        // trigger background revalidation.
        clock.advance(Duration::from_secs(40));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(leases_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_validation_fails_fast() {
        let bad = ManagerConfig {
            min_duration: Duration::from_secs(10),
            max_duration: Duration::from_secs(1),
            ..ManagerConfig::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Invalid(_))));

        let bad = ManagerConfig {
            min_duration: Duration::ZERO,
            ..ManagerConfig::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Invalid(_))));
    }
}
