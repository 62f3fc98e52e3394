//! Pollsters for compute instances.
//!
//! The pollsters of this crate are written against the [`Inspector`] trait:
//! the concrete hypervisor or guest-agent inspection is an external
//! collaborator supplied by the deployment. Each pollster maps its
//! inspector's failures onto [`InspectError`](stratus::pollster::InspectError)
//! and the shared runner takes care of per-resource isolation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stratus::pollster::{InspectError, Pollster};
use stratus::resources::Instance;

mod instance;
mod memory;

pub use instance::{InstanceFlavorPollster, InstancePollster};
pub use memory::{
    MemoryBufferPollster, MemoryCachedPollster, MemoryResidentPollster, MemorySwapPollster, MemoryTotalPollster,
    MemoryUnusedPollster, MemoryUsagePollster,
};

/// Guest memory counters, in megabytes, as reported by the guest agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryInfo {
    pub total_mb: f64,
    pub used_mb: f64,
    pub swap_total_mb: f64,
    pub swap_used_mb: f64,
    /// Page-cache counters, `None` when the guest agent does not report them.
    pub buffer_mb: Option<f64>,
    pub cached_mb: Option<f64>,
}

/// The hypervisor/guest inspection capability consumed by the pollsters.
///
/// Implementations report per-method support through
/// [`InspectError::Unsupported`]; a partially implemented inspector is
/// normal.
pub trait Inspector: Send + Sync {
    /// Active memory of the instance, in MB, observed over `duration`.
    fn inspect_memory_usage(&self, instance: &Instance, duration: Duration) -> Result<f64, InspectError>;

    /// Resident (host-side) memory of the instance, in MB, observed over
    /// `duration`.
    fn inspect_memory_resident(&self, instance: &Instance, duration: Duration) -> Result<f64, InspectError>;

    /// Guest memory counters, as reported by the guest agent.
    fn inspect_memory_info(&self, instance: &Instance) -> Result<MemoryInfo, InspectError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_enabled")]
    pub instance: bool,
    #[serde(default = "default_enabled")]
    pub instance_flavor: bool,
    #[serde(default = "default_enabled")]
    pub memory_usage: bool,
    #[serde(default = "default_enabled")]
    pub memory_resident: bool,
    #[serde(default = "default_enabled")]
    pub memory_total: bool,
    #[serde(default = "default_enabled")]
    pub memory_unused: bool,
    #[serde(default = "default_enabled")]
    pub memory_swap: bool,
    #[serde(default = "default_enabled")]
    pub memory_buffer: bool,
    #[serde(default = "default_enabled")]
    pub memory_cached: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance: true,
            instance_flavor: true,
            memory_usage: true,
            memory_resident: true,
            memory_total: true,
            memory_unused: true,
            memory_swap: true,
            memory_buffer: true,
            memory_cached: true,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Assembles the enabled pollsters over the given inspector.
pub fn pollsters(config: &Config, inspector: Arc<dyn Inspector>) -> Vec<Box<dyn Pollster>> {
    let mut pollsters: Vec<Box<dyn Pollster>> = Vec::new();
    if config.instance {
        pollsters.push(Box::new(InstancePollster));
    }
    if config.instance_flavor {
        pollsters.push(Box::new(InstanceFlavorPollster));
    }
    if config.memory_usage {
        pollsters.push(Box::new(MemoryUsagePollster::new(Arc::clone(&inspector))));
    }
    if config.memory_resident {
        pollsters.push(Box::new(MemoryResidentPollster::new(Arc::clone(&inspector))));
    }
    if config.memory_total {
        pollsters.push(Box::new(MemoryTotalPollster::new(Arc::clone(&inspector))));
    }
    if config.memory_unused {
        pollsters.push(Box::new(MemoryUnusedPollster::new(Arc::clone(&inspector))));
    }
    if config.memory_swap {
        pollsters.push(Box::new(MemorySwapPollster::new(Arc::clone(&inspector))));
    }
    if config.memory_buffer {
        pollsters.push(Box::new(MemoryBufferPollster::new(Arc::clone(&inspector))));
    }
    if config.memory_cached {
        pollsters.push(Box::new(MemoryCachedPollster::new(inspector)));
    }
    pollsters
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use stratus::credentials::{AuthError, CredentialBroker, CredentialSource, IdentityClient};
    use stratus::pollster::PollContext;
    use stratus::resources::InstanceStatus;
    use std::time::SystemTime;

    pub struct NoIdentity;
    impl CredentialSource for NoIdentity {
        fn new_client(&self) -> Result<Arc<dyn IdentityClient>, AuthError> {
            Err(AuthError::new("no identity service in tests"))
        }
    }

    pub fn instance(id: &str) -> Instance {
        Instance {
            id: id.to_owned(),
            name: format!("vm-{id}"),
            status: InstanceStatus::Active,
            user_id: "u-1".to_owned(),
            project_id: "p-1".to_owned(),
            flavor: "m1.small".to_owned(),
            metadata: BTreeMap::from([("host".to_owned(), "cn-7".to_owned())]),
        }
    }

    pub fn with_context<R>(f: impl FnOnce(&PollContext) -> R) -> R {
        let broker = CredentialBroker::new(Box::new(NoIdentity));
        let ctx = PollContext::new("cn-7", SystemTime::now(), &broker);
        f(&ctx)
    }
}
