//! The metrics backend client seam.
//!
//! The backend models data as `{resource, metric, measurements}`. The wire
//! protocol and HTTP client are external collaborators; the dispatcher only
//! needs the four operations of [`MetricsBackend`] and their typed outcomes.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;

/// One `{timestamp, value}` point posted to a metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub timestamp: SystemTime,
    pub value: f64,
}

/// Archive policy reference attached to a metric when it is created.
///
/// The empty policy (no name) lets the backend apply its own default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_policy_name: Option<String>,
}

/// The backend-side view of a resource, built per dispatch group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendResource {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    /// Declared metrics, keyed by meter-name pattern.
    pub metrics: BTreeMap<String, MetricPolicy>,
    /// Extra attributes merged from the matching resource definitions.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum PostError {
    /// The metric (or its resource) does not exist yet on the backend.
    #[error("no such metric")]
    NoSuchMetric,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CreateResourceError {
    /// Another dispatcher created the resource first.
    #[error("resource already exists")]
    AlreadyExists,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CreateMetricError {
    /// Another dispatcher created the metric first.
    #[error("metric already exists")]
    AlreadyExists,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The operations the dispatcher consumes from the metrics backend.
///
/// All calls block the calling thread; timeouts and cancellation are the
/// implementation's responsibility.
pub trait MetricsBackend: Send + Sync {
    fn post_measurements(
        &self,
        resource_type: &str,
        resource_id: &str,
        meter: &str,
        measurements: &[Measurement],
    ) -> Result<(), PostError>;

    fn create_resource(&self, resource_type: &str, resource: &BackendResource) -> Result<(), CreateResourceError>;

    fn create_metric(
        &self,
        resource_type: &str,
        resource_id: &str,
        meter: &str,
        policy: &MetricPolicy,
    ) -> Result<(), CreateMetricError>;

    fn update_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        attributes: &BTreeMap<String, String>,
    ) -> anyhow::Result<()>;
}
