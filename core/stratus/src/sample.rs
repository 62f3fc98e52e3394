//! The measurement sample model.
//!
//! A [`Sample`] is one measured observation for one resource at one instant.
//! Samples are transient: they are produced by pollsters and consumed by the
//! dispatcher within a single polling cycle, never persisted by this crate.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// How the measured value relates to previous values of the same meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    /// An instantaneous reading (e.g. current memory usage).
    Gauge,
    /// A monotonically increasing total (e.g. bytes transmitted since boot).
    Cumulative,
    /// The change since the previous reading.
    Delta,
}

/// One measured metric observation for one resource at one instant.
///
/// For dispatch purposes a sample is uniquely identified by
/// `(resource_id, meter, timestamp)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Id of the resource the measurement applies to.
    pub resource_id: String,
    /// Name of the meter, e.g. `memory.usage`.
    pub meter: String,
    pub kind: SampleKind,
    /// Unit of `volume`, e.g. `MB`.
    pub unit: String,
    /// The measured value.
    pub volume: f64,
    pub timestamp: SystemTime,
    /// Owner of the resource.
    pub user_id: String,
    /// Project (tenant) the resource belongs to.
    pub project_id: String,
    /// Free-form metadata attached by the pollster, used by the attribute
    /// extractors of the resource definitions.
    pub metadata: BTreeMap<String, String>,
}

impl Sample {
    /// Builds a sample from an instance, filling the ownership fields and the
    /// metadata that the attribute extractors commonly rely on.
    pub fn from_instance(
        instance: &crate::resources::Instance,
        meter: impl Into<String>,
        kind: SampleKind,
        unit: impl Into<String>,
        volume: f64,
    ) -> Self {
        let mut metadata = instance.metadata.clone();
        metadata.insert("display_name".to_owned(), instance.name.clone());
        metadata.insert("flavor".to_owned(), instance.flavor.clone());
        Self {
            resource_id: instance.id.clone(),
            meter: meter.into(),
            kind,
            unit: unit.into(),
            volume,
            timestamp: SystemTime::now(),
            user_id: instance.user_id.clone(),
            project_id: instance.project_id.clone(),
            metadata,
        }
    }

    /// Adds one metadata entry, overwriting any previous value for the key.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
