//! The pollster framework: pluggable sample producers with per-resource
//! failure isolation.
//!
//! A [`Pollster`] turns one instance into the samples of one metric family.
//! The production loop, [`run_pollsters`], iterates the discovered instances
//! for each pollster and applies a single shared failure classification: no
//! instance's failure may terminate sampling for the rest of the batch, and no
//! pollster's failure may terminate the rest of the pollster set.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::credentials::{CredentialBroker, IdentityClient};
use crate::resources::Instance;
use crate::sample::Sample;

/// Failure of the underlying inspection capability for one resource.
///
/// The variants are the classification applied by [`run_pollsters`]; a
/// pollster maps whatever its inspector reports onto them and the runner
/// decides how loudly to log and always continues with the next resource.
#[derive(Debug, Error)]
pub enum InspectError {
    /// The resource disappeared mid-cycle (e.g. the instance was deleted
    /// between discovery and inspection).
    #[error("resource is gone")]
    Gone,
    /// The capability is not implemented for this resource or backend.
    #[error("inspection not supported")]
    Unsupported,
    /// The resource cannot be inspected right now (shut off, no data yet).
    #[error("no data: {0}")]
    Unavailable(String),
    /// Anything else.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Transient per-cycle storage shared across pollsters.
///
/// Used to avoid duplicating expensive per-resource inspection work within one
/// cycle, e.g. one pollster's computed inspection duration is reused by
/// another. Dropped at the end of the cycle.
#[derive(Default)]
pub struct CycleCache {
    values: FxHashMap<String, f64>,
}

impl CycleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn get_or_insert_with(&mut self, key: &str, f: impl FnOnce() -> f64) -> f64 {
        *self.values.entry(key.to_owned()).or_insert_with(f)
    }

    pub fn put(&mut self, key: impl Into<String>, value: f64) {
        self.values.insert(key.into(), value);
    }
}

/// What the polling loop hands to each pollster, besides the cycle cache and
/// the instance itself.
pub struct PollContext<'a> {
    /// Name of the monitored host.
    pub host: &'a str,
    /// Start of the current cycle.
    pub cycle_start: SystemTime,
    credentials: &'a CredentialBroker,
}

impl<'a> PollContext<'a> {
    pub fn new(host: &'a str, cycle_start: SystemTime, credentials: &'a CredentialBroker) -> Self {
        Self {
            host,
            cycle_start,
            credentials,
        }
    }

    /// The per-cycle identity client, see [`CredentialBroker::get`].
    pub fn identity(&self) -> Result<Arc<dyn IdentityClient>, crate::credentials::AuthError> {
        self.credentials.get()
    }

    /// Time elapsed since the start of the cycle, used as the inspection
    /// duration by pollsters that need an observation window.
    pub fn inspection_duration(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.cycle_start)
            .unwrap_or(Duration::ZERO)
    }
}

/// A pluggable sample producer for one metric family.
pub trait Pollster: Send {
    /// Name of the pollster, for logs.
    fn name(&self) -> &'static str;

    /// Produces the samples of this pollster's metric family for one
    /// instance.
    ///
    /// Errors are classified and logged by the runner; implementations must
    /// map their inspector's failures onto [`InspectError`] and never panic on
    /// a misbehaving resource.
    fn sample(
        &mut self,
        ctx: &PollContext,
        cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError>;
}

/// Runs every pollster over every instance and collects the produced samples.
///
/// Per-resource failure isolation: a failure for one instance is logged
/// according to its classification and sampling continues with the next
/// instance, then with the next pollster.
pub fn run_pollsters(
    pollsters: &mut [Box<dyn Pollster>],
    ctx: &PollContext,
    cache: &mut CycleCache,
    instances: &[Instance],
) -> Vec<Sample> {
    let mut batch = Vec::new();
    for pollster in pollsters.iter_mut() {
        for instance in instances {
            match pollster.sample(ctx, cache, instance) {
                Ok(samples) => batch.extend(samples),
                Err(InspectError::Gone) => {
                    log::debug!("{}: instance {} is gone, skipping", pollster.name(), instance.id);
                }
                Err(InspectError::Unsupported) => {
                    log::debug!("{}: not supported for instance {}", pollster.name(), instance.id);
                }
                Err(InspectError::Unavailable(reason)) => {
                    log::warn!(
                        "{}: cannot inspect instance {}, non-fatal reason: {reason}",
                        pollster.name(),
                        instance.id
                    );
                }
                Err(InspectError::Unexpected(e)) => {
                    log::error!(
                        "{}: unexpected error while inspecting instance {}: {e:#}",
                        pollster.name(),
                        instance.id
                    );
                }
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{AuthError, CredentialSource};
    use crate::resources::InstanceStatus;
    use crate::sample::SampleKind;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    struct NoIdentity;
    impl CredentialSource for NoIdentity {
        fn new_client(&self) -> Result<Arc<dyn IdentityClient>, AuthError> {
            Err(AuthError::new("no identity service in tests"))
        }
    }

    fn instance(id: &str) -> Instance {
        Instance {
            id: id.to_owned(),
            name: id.to_owned(),
            status: InstanceStatus::Active,
            user_id: "u".to_owned(),
            project_id: "p".to_owned(),
            flavor: "m1.small".to_owned(),
            metadata: BTreeMap::new(),
        }
    }

    /// Fails for the instance named in `fail`, succeeds for the others.
    struct FlakyPollster {
        fail: String,
        error: fn() -> InspectError,
    }

    impl Pollster for FlakyPollster {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn sample(
            &mut self,
            _ctx: &PollContext,
            _cache: &mut CycleCache,
            instance: &Instance,
        ) -> Result<Vec<Sample>, InspectError> {
            if instance.id == self.fail {
                Err((self.error)())
            } else {
                Ok(vec![Sample::from_instance(
                    instance,
                    "test.meter",
                    SampleKind::Gauge,
                    "unit",
                    1.0,
                )])
            }
        }
    }

    fn run_with_failure(error: fn() -> InspectError) -> Vec<Sample> {
        let broker = CredentialBroker::new(Box::new(NoIdentity));
        let ctx = PollContext::new("cn-7", SystemTime::now(), &broker);
        let mut cache = CycleCache::new();
        let mut pollsters: Vec<Box<dyn Pollster>> = vec![Box::new(FlakyPollster {
            fail: "b".to_owned(),
            error,
        })];
        let instances = [instance("a"), instance("b"), instance("c")];
        run_pollsters(&mut pollsters, &ctx, &mut cache, &instances)
    }

    #[test]
    fn failures_are_isolated_per_resource() {
        for error in [
            (|| InspectError::Gone) as fn() -> InspectError,
            || InspectError::Unsupported,
            || InspectError::Unavailable("shut off".to_owned()),
            || InspectError::Unexpected(anyhow::anyhow!("boom")),
        ] {
            let batch = run_with_failure(error);
            let ids: Vec<&str> = batch.iter().map(|s| s.resource_id.as_str()).collect();
            assert_eq!(ids, ["a", "c"]);
        }
    }

    #[test]
    fn cycle_cache_shares_work_across_pollsters() {
        let mut cache = CycleCache::new();
        let first = cache.get_or_insert_with("inspection_duration", || 1.5);
        let second = cache.get_or_insert_with("inspection_duration", || panic!("must reuse the cached value"));
        assert_eq!(first, 1.5);
        assert_eq!(second, 1.5);
        assert_eq!(cache.get("missing"), None);
    }
}
