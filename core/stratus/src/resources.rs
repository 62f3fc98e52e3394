//! Discovered resources (compute instances).
//!
//! An [`Instance`] is the platform's record of a virtual machine running on
//! the host monitored by this agent. Discovery keeps a map of them; pollsters
//! read it. Instances whose lifecycle reached a terminal state must leave the
//! tracked set, see [`InstanceStatus::is_terminal`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an instance, as reported by the inventory service.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Building,
    Paused,
    ShutOff,
    Shelved,
    Deleted,
    Error,
}

impl InstanceStatus {
    /// `true` if the instance will never produce measurements again and must
    /// be evicted from the tracked set.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Deleted | InstanceStatus::Error)
    }
}

/// A compute instance as reported by the inventory service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    /// Human-readable name ("display name").
    pub name: String,
    pub status: InstanceStatus,
    pub user_id: String,
    pub project_id: String,
    /// Name of the flavor (instance type) the instance was launched with.
    pub flavor: String,
    /// Additional platform metadata (host, availability zone, image, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}
