//! Incremental discovery of the instances owned by this host.
//!
//! The full instance list is only fetched once; afterwards the inventory is
//! asked for the instances that changed since the previous run, and never more
//! often than the configured period. The tracked set is owned exclusively by
//! [`InstanceDiscovery`] and mutated only by its refresh step.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::resources::Instance;

/// Read access to the platform inventory. Implemented by the deployment's
/// inventory client (out of scope here).
pub trait ComputeInventory: Send {
    /// Lists all instances hosted on `host`.
    fn list_by_host(&self, host: &str) -> anyhow::Result<Vec<Instance>>;

    /// Lists the instances hosted on `host` that changed since `since`.
    fn list_by_host_since(&self, host: &str, since: SystemTime) -> anyhow::Result<Vec<Instance>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Name of the host whose instances this agent monitors.
    pub host: String,
    /// Minimum delay between two inventory queries.
    #[serde(with = "humantime_serde")]
    pub query_period: Duration,
    /// Enables workload partitioning: multiple agents can run simultaneously,
    /// each owning the instances of its own host.
    #[serde(default)]
    pub workload_partitioning: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            query_period: Duration::from_secs(120),
            workload_partitioning: false,
        }
    }
}

/// Incremental enumeration of the instances owned by this agent's host.
pub struct InstanceDiscovery {
    inventory: Box<dyn ComputeInventory>,
    config: DiscoveryConfig,
    last_run: Option<SystemTime>,
    instances: HashMap<String, Instance>,
}

impl InstanceDiscovery {
    pub fn new(inventory: Box<dyn ComputeInventory>, config: DiscoveryConfig) -> Self {
        Self {
            inventory,
            config,
            last_run: None,
            instances: HashMap::new(),
        }
    }

    /// Refreshes the tracked set if the query period elapsed, and returns the
    /// current full set (not just the delta).
    ///
    /// The first invocation performs a full enumeration; later invocations ask
    /// only for the instances that changed since the previous run. Instances
    /// whose status is terminal are evicted, the others are upserted.
    pub fn discover(&mut self) -> anyhow::Result<Vec<Instance>> {
        self.discover_at(SystemTime::now())
    }

    fn discover_at(&mut self, now: SystemTime) -> anyhow::Result<Vec<Instance>> {
        match self.last_run {
            None => {
                let changed = self.inventory.list_by_host(&self.config.host)?;
                self.apply(changed);
                self.last_run = Some(now);
            }
            Some(last_run) => {
                let elapsed = now.duration_since(last_run).unwrap_or(Duration::ZERO);
                if elapsed > self.config.query_period {
                    let changed = self.inventory.list_by_host_since(&self.config.host, last_run)?;
                    self.apply(changed);
                    self.last_run = Some(now);
                }
                // within the period: serve the tracked set without a network call
            }
        }
        Ok(self.instances.values().cloned().collect())
    }

    fn apply(&mut self, changed: Vec<Instance>) {
        for instance in changed {
            if instance.status.is_terminal() {
                self.instances.remove(&instance.id);
            } else {
                self.instances.insert(instance.id.clone(), instance);
            }
        }
    }

    /// Stable partition key for workload partitioning, `None` when the
    /// feature is disabled.
    pub fn group_id(&self) -> Option<&str> {
        if self.config.workload_partitioning {
            Some(&self.config.host)
        } else {
            None
        }
    }
}
