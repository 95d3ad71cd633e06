use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::{Error, Result};

pub(crate) const OUTCOME_GRANTED: &str = "granted";
pub(crate) const OUTCOME_EXTENDED: &str = "extended";
pub(crate) const OUTCOME_DENIED: &str = "denied";
pub(crate) const OUTCOME_INVALID: &str = "invalid";
pub(crate) const OUTCOME_ERROR: &str = "error";

/// Manager instrumentation, registered against the injected registry at
/// construction. Registration failure is a configuration error.
#[derive(Clone, Debug)]
pub struct ManagerMetrics {
    pub(crate) claims: IntCounterVec,
    pub(crate) revocations: IntCounter,
    pub(crate) expirations: IntCounter,
    pub(crate) retries: IntCounter,
    pub(crate) cache_entries: IntGauge,
}

impl ManagerMetrics {
    pub fn new(registry: &Registry) -> Result<ManagerMetrics> {
        let claims = IntCounterVec::new(
            Opts::new("paddock_lease_claims_total", "Lease claim requests by outcome"),
            &["outcome"],
        )
        .map_err(invalid)?;
        let revocations = IntCounter::new(
            "paddock_lease_revocations_total",
            "Leases explicitly revoked by their holder",
        )
        .map_err(invalid)?;
        let expirations = IntCounter::new(
            "paddock_lease_expirations_total",
            "Leases observed expired after store reconfirmation",
        )
        .map_err(invalid)?;
        let retries = IntCounter::new(
            "paddock_lease_store_retries_total",
            "Store operations retried after a transient failure",
        )
        .map_err(invalid)?;
        let cache_entries = IntGauge::new(
            "paddock_lease_cache_entries",
            "Lease records currently cached by this manager",
        )
        .map_err(invalid)?;

        registry.register(Box::new(claims.clone())).map_err(invalid)?;
        registry
            .register(Box::new(revocations.clone()))
            .map_err(invalid)?;
        registry
            .register(Box::new(expirations.clone()))
            .map_err(invalid)?;
        registry.register(Box::new(retries.clone())).map_err(invalid)?;
        registry
            .register(Box::new(cache_entries.clone()))
            .map_err(invalid)?;

        Ok(ManagerMetrics {
            claims,
            revocations,
            expirations,
            retries,
            cache_entries,
        })
    }

    pub(crate) fn claim_outcome(&self, outcome: &str) {
        self.claims.with_label_values(&[outcome]).inc();
    }
}

fn invalid(err: prometheus::Error) -> Error {
    Error::Invalid(format!("metrics registration: {err}"))
}
