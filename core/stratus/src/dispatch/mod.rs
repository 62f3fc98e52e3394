//! The metrics dispatcher: batches a cycle's samples, maps them onto backend
//! resource/metric definitions and reconciles them into the backend.
//!
//! One [`dispatch`](MetricsDispatcher::dispatch) call processes one cycle's
//! batch:
//! 1. samples generated by the backend's own service activity are filtered
//!    out,
//! 2. the batch is grouped deterministically by `(resource_id, meter)`,
//! 3. measurements are posted per meter group; an "unknown metric" failure
//!    triggers the idempotent ensure-resource-and-metric repair and exactly
//!    one retry,
//! 4. the resource's extra attributes are reconciled behind a TTL cache with
//!    a double-checked lock, so that many dispatcher instances (threads or
//!    processes) do not flood the backend with identical updates.
//!
//! Workflow errors are isolated per meter group and per resource group: they
//! are logged and the rest of the batch proceeds.

pub mod backend;
pub mod cache;
pub mod definitions;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::credentials::CredentialBroker;
use crate::sample::Sample;
use backend::{BackendResource, CreateMetricError, CreateResourceError, Measurement, MetricsBackend, PostError};
use cache::{AttributeCache, attribute_hash, cache_key};
use definitions::{ResourceDefinition, ResourceDefinitions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Filter out samples generated by the metrics backend's own service
    /// activity.
    pub filter_service_activity: bool,
    /// Name of the service project whose activity is filtered out.
    pub filter_project: String,
    /// Archive policy used when a definition does not specify one.
    pub archive_policy: Option<String>,
    /// Resource type under which the backend exposes its own storage
    /// accounts as monitorable resources.
    pub storage_account_resource_type: String,
    /// How long a reconciled attribute hash stays cached.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            filter_service_activity: true,
            filter_project: String::from("metering"),
            archive_policy: None,
            storage_account_resource_type: String::from("storage_account"),
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Records each meter of a sample batch into the metrics backend.
pub struct MetricsDispatcher {
    backend: Box<dyn MetricsBackend>,
    credentials: Arc<CredentialBroker>,
    definitions: ResourceDefinitions,
    config: DispatcherConfig,
    cache: Option<Arc<dyn AttributeCache>>,
    /// Lazily resolved id of the backend's own service project.
    service_project_id: Mutex<Option<String>>,
    /// Guards the check-then-update sequence of attribute reconciliation.
    reconcile_lock: Mutex<()>,
}

impl MetricsDispatcher {
    pub fn new(
        backend: Box<dyn MetricsBackend>,
        credentials: Arc<CredentialBroker>,
        definitions: ResourceDefinitions,
        cache: Option<Arc<dyn AttributeCache>>,
        config: DispatcherConfig,
    ) -> Self {
        if cache.is_none() {
            log::warn!("no attribute cache configured, every cycle will update resource attributes");
        }
        Self {
            backend,
            credentials,
            definitions,
            config,
            cache,
            service_project_id: Mutex::new(None),
            reconcile_lock: Mutex::new(()),
        }
    }

    /// Dispatches one cycle's batch of samples.
    ///
    /// Returns an error only for failures that invalidate the whole batch
    /// (resolving the service project id); everything else is logged and
    /// isolated to its meter or resource group.
    pub fn dispatch(&self, mut batch: Vec<Sample>) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        if self.config.filter_service_activity {
            // required for correctness of the filter, failure is fatal
            let service_project_id = self.service_project_id()?;
            batch.retain(|s| !self.is_service_activity(s, &service_project_id));
        }

        // Deterministic processing order: samples are uniquely identified by
        // (resource_id, meter, timestamp), so this sort gives identical call
        // sequences for identical input sets regardless of input order.
        batch.sort_by(|a, b| {
            (&a.resource_id, &a.meter, a.timestamp).cmp(&(&b.resource_id, &b.meter, b.timestamp))
        });

        let mut groups: BTreeMap<String, BTreeMap<String, Vec<Sample>>> = BTreeMap::new();
        for sample in batch {
            groups
                .entry(sample.resource_id.clone())
                .or_default()
                .entry(sample.meter.clone())
                .or_default()
                .push(sample);
        }

        for (resource_id, meter_groups) in groups {
            if let Err(e) = self.process_resource(&resource_id, meter_groups) {
                log::error!("failed to process resource {resource_id}: {e:#}");
            }
        }
        Ok(())
    }

    /// Resolves the id of the backend's own service project, once.
    fn service_project_id(&self) -> anyhow::Result<String> {
        let mut cached = self.service_project_id.lock().unwrap();
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let identity = self.credentials.get()?;
        let id = identity
            .find_project_id(&self.config.filter_project)
            .with_context(|| format!("cannot resolve service project '{}'", self.config.filter_project))?;
        log::debug!("service project found: {id}");
        *cached = Some(id.clone());
        Ok(id)
    }

    /// `true` for samples that the backend generated about itself: anything
    /// from the service project, and anything in the storage account the
    /// backend uses for its own data.
    fn is_service_activity(&self, sample: &Sample, service_project_id: &str) -> bool {
        sample.project_id == service_project_id
            || (sample.resource_id == service_project_id
                && self
                    .definitions
                    .matches_resource_type(&sample.meter, &self.config.storage_account_resource_type))
    }

    fn process_resource(
        &self,
        resource_id: &str,
        meter_groups: BTreeMap<String, Vec<Sample>>,
    ) -> anyhow::Result<()> {
        let mut extras: BTreeMap<String, String> = BTreeMap::new();
        let mut reconcile_type: Option<String> = None;

        for (meter, samples) in meter_groups {
            let Some(rd) = self.definitions.find(&meter) else {
                log::warn!("meter {meter} is not handled by any resource definition");
                continue;
            };
            if rd.ignore {
                continue;
            }

            let mut measurements = Vec::with_capacity(samples.len());
            for sample in &samples {
                extras.extend(rd.attributes(sample));
                measurements.push(Measurement {
                    timestamp: sample.timestamp,
                    value: sample.volume,
                });
            }
            let resource = BackendResource {
                id: resource_id.to_owned(),
                user_id: samples[0].user_id.clone(),
                project_id: samples[0].project_id.clone(),
                metrics: rd.metrics(self.config.archive_policy.as_deref()),
                attributes: extras.clone(),
            };
            reconcile_type = Some(rd.resource_type.clone());

            // per-meter-group isolation
            if let Err(e) = self.post_with_repair(rd, &resource, &meter, &measurements) {
                log::error!("measurement workflow failed for {resource_id}/{meter}: {e:#}");
            }
        }

        if !extras.is_empty()
            && let Some(resource_type) = reconcile_type
        {
            self.reconcile_attributes(&resource_type, resource_id, &extras)?;
        }
        Ok(())
    }

    /// Posts the measurements, repairing the backend resource/metric and
    /// retrying exactly once on an "unknown metric" failure.
    fn post_with_repair(
        &self,
        rd: &ResourceDefinition,
        resource: &BackendResource,
        meter: &str,
        measurements: &[Measurement],
    ) -> anyhow::Result<()> {
        match self
            .backend
            .post_measurements(&rd.resource_type, &resource.id, meter, measurements)
        {
            Ok(()) => Ok(()),
            Err(PostError::NoSuchMetric) => {
                self.ensure_resource_and_metric(rd, resource, meter)?;
                match self
                    .backend
                    .post_measurements(&rd.resource_type, &resource.id, meter, measurements)
                {
                    Ok(()) => Ok(()),
                    Err(PostError::NoSuchMetric) => {
                        // no further retries
                        log::error!("failed to post measurements for {}/{meter}", resource.id);
                        Ok(())
                    }
                    Err(PostError::Other(e)) => Err(e.context("retried post failed")),
                }
            }
            Err(PostError::Other(e)) => Err(e.context("post failed")),
        }
    }

    /// Creates the backend resource with its full declared metric-policy map,
    /// or just the missing metric when the resource already exists.
    ///
    /// Idempotent and race-tolerant: "already exists" at any point means a
    /// concurrent dispatcher won the race, which is success.
    fn ensure_resource_and_metric(
        &self,
        rd: &ResourceDefinition,
        resource: &BackendResource,
        meter: &str,
    ) -> anyhow::Result<()> {
        match self.backend.create_resource(&rd.resource_type, resource) {
            Ok(()) => Ok(()),
            Err(CreateResourceError::AlreadyExists) => {
                let policy = rd.policy(self.config.archive_policy.as_deref());
                match self
                    .backend
                    .create_metric(&rd.resource_type, &resource.id, meter, &policy)
                {
                    Ok(()) | Err(CreateMetricError::AlreadyExists) => Ok(()),
                    Err(CreateMetricError::Other(e)) => Err(e.context("cannot create metric")),
                }
            }
            Err(CreateResourceError::Other(e)) => Err(e.context("cannot create resource")),
        }
    }

    /// Pushes the accumulated extra attributes to the backend, unless the
    /// cache proves the backend already has them.
    ///
    /// Without a cache the update is always sent: correctness over
    /// efficiency. With a cache, the content hash is compared before and,
    /// double-checked, after taking the reconciliation lock, because other
    /// dispatcher instances may race between the unlocked check and the lock
    /// acquisition. The TTL makes the suppression a soft, best-effort
    /// throttle across processes; a duplicate update is acceptable (updates
    /// are idempotent), a missed one is not.
    fn reconcile_attributes(
        &self,
        resource_type: &str,
        resource_id: &str,
        extras: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let Some(cache) = &self.cache else {
            return self
                .backend
                .update_resource(resource_type, resource_id, extras)
                .context("cannot update resource");
        };

        let key = cache_key(resource_id);
        let fresh = attribute_hash(extras);
        if cache.get(&key).as_deref() == Some(fresh.as_str()) {
            log::debug!("resource cache hit for update {resource_id}");
            return Ok(());
        }
        let _guard = self.reconcile_lock.lock().unwrap();
        if cache.get(&key).as_deref() == Some(fresh.as_str()) {
            log::debug!("recheck resource cache hit for update {resource_id}");
            return Ok(());
        }
        self.backend
            .update_resource(resource_type, resource_id, extras)
            .context("cannot update resource")?;
        cache.set(&key, &fresh, self.config.cache_ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
