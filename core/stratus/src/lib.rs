//! Telemetry agent core for cloud compute infrastructure.
//!
//! Stratus discovers the compute instances running on a host, samples metrics
//! about them through pluggable [pollsters](pollster::Pollster), and reconciles
//! the samples into a remote time-series backend that models data as
//! `{resource, metric, measurements}`.
//!
//! The crate is organized around one polling cycle:
//! 1. [`discovery`] refreshes the set of instances owned by this host,
//! 2. the pollsters turn that set into a batch of [`Sample`](sample::Sample)s,
//!    with per-resource failure isolation,
//! 3. [`dispatch`] groups the batch deterministically, posts measurements and
//!    repairs missing backend resources/metrics, and reconciles resource
//!    attributes behind a TTL cache so that a fleet of agents does not hammer
//!    the backend with redundant updates.
//!
//! The concrete inventory, identity, backend and cache clients are external
//! collaborators: deployments implement [`discovery::ComputeInventory`],
//! [`credentials::CredentialSource`], [`dispatch::backend::MetricsBackend`]
//! and [`dispatch::cache::AttributeCache`], then drive
//! [`agent::PollingManager`].

pub mod agent;
pub mod credentials;
pub mod discovery;
pub mod dispatch;
pub mod pollster;
pub mod resources;
pub mod sample;
