//! Polling-cycle orchestration.
//!
//! A [`PollingManager`] owns the credential broker, the discovery, the
//! pollster set and the dispatcher, and runs them as bounded units of work:
//! one [`run_cycle`](PollingManager::run_cycle) per polling interval.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;

use crate::credentials::CredentialBroker;
use crate::discovery::InstanceDiscovery;
use crate::dispatch::MetricsDispatcher;
use crate::pollster::{CycleCache, PollContext, Pollster, run_pollsters};

pub struct PollingManager {
    host: String,
    credentials: Arc<CredentialBroker>,
    discovery: InstanceDiscovery,
    pollsters: Vec<Box<dyn Pollster>>,
    dispatcher: MetricsDispatcher,
}

impl PollingManager {
    pub fn new(
        host: impl Into<String>,
        credentials: Arc<CredentialBroker>,
        discovery: InstanceDiscovery,
        pollsters: Vec<Box<dyn Pollster>>,
        dispatcher: MetricsDispatcher,
    ) -> Self {
        Self {
            host: host.into(),
            credentials,
            discovery,
            pollsters,
            dispatcher,
        }
    }

    /// Runs one polling cycle: refresh credentials, discover, sample,
    /// dispatch.
    ///
    /// Per-resource and per-group failures are handled (and logged) inside
    /// the pollster runner and the dispatcher; an error from this function
    /// means the whole cycle failed (discovery unreachable, credentials
    /// unavailable while filtering) and should be logged by the caller. The
    /// next cycle starts fresh.
    pub fn run_cycle(&mut self) -> anyhow::Result<()> {
        // drop the previous cycle's client and cached failure
        self.credentials.reset_for_cycle();

        let instances = self.discovery.discover().context("resource discovery failed")?;
        log::debug!("cycle started: {} instances on host {}", instances.len(), self.host);

        let ctx = PollContext::new(&self.host, SystemTime::now(), &self.credentials);
        let mut cache = CycleCache::new();
        let batch = run_pollsters(&mut self.pollsters, &ctx, &mut cache, &instances);
        log::debug!("pollsters produced {} samples", batch.len());

        self.dispatcher.dispatch(batch).context("dispatch failed")
    }

    /// Stable partition key for workload partitioning, when enabled.
    pub fn group_id(&self) -> Option<&str> {
        self.discovery.group_id()
    }
}
