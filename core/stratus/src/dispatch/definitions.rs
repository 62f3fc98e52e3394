//! Declarative mapping from meter names to backend resource types.
//!
//! Resource definitions are loaded once at startup from a TOML document and
//! are immutable for the rest of the run. Their order is significant: the
//! first definition whose pattern list matches a meter name wins. A malformed
//! document (missing mandatory field, wrong type, empty metrics list, bad
//! pattern, unknown extractor field) aborts startup, never a running cycle.
//!
//! ```toml
//! [[resources]]
//! resource_type = "instance"
//! metrics = ["instance", "instance:*", "memory*"]
//! archive_policy = "low"
//!
//! [resources.attributes]
//! host = "$.metadata.host"
//! flavor = "$.metadata.flavor"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::dispatch::backend::MetricPolicy;
use crate::sample::Sample;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("cannot read resource definitions: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed resource definitions: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("resource definition '{resource_type}' has an empty metrics list")]
    EmptyMetrics { resource_type: String },
    #[error("resource definition '{resource_type}': invalid pattern '{pattern}': {source}")]
    BadPattern {
        resource_type: String,
        pattern: String,
        source: PatternParseError,
    },
    #[error("resource definition '{resource_type}': attribute '{name}': unknown sample field '{path}'")]
    UnknownField {
        resource_type: String,
        name: String,
        path: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternParseError {
    #[error("asterisk '*' in the middle of the pattern")]
    Asterisk,
    #[error("the pattern is empty")]
    Empty,
}

/// A meter-name pattern with a single optional `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterPattern {
    Exact(String),
    StartWith(String),
    EndWith(String),
    Any,
}

impl MeterPattern {
    pub fn matches(&self, meter: &str) -> bool {
        match self {
            MeterPattern::Exact(pat) => pat == meter,
            MeterPattern::StartWith(pat) => meter.starts_with(pat),
            MeterPattern::EndWith(pat) => meter.ends_with(pat),
            MeterPattern::Any => true,
        }
    }
}

impl FromStr for MeterPattern {
    type Err = PatternParseError;

    /// The only special character is `*`, allowed at the start or the end of
    /// the pattern. For instance, `memory*` matches every meter whose name
    /// begins with `memory`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(PatternParseError::Empty)
        } else if s == "*" {
            Ok(MeterPattern::Any)
        } else if let Some(suffix) = s.strip_prefix('*') {
            if suffix.contains('*') {
                Err(PatternParseError::Asterisk)
            } else {
                Ok(MeterPattern::EndWith(suffix.to_owned()))
            }
        } else if let Some(prefix) = s.strip_suffix('*') {
            if prefix.contains('*') {
                Err(PatternParseError::Asterisk)
            } else {
                Ok(MeterPattern::StartWith(prefix.to_owned()))
            }
        } else if s.contains('*') {
            Err(PatternParseError::Asterisk)
        } else {
            Ok(MeterPattern::Exact(s.to_owned()))
        }
    }
}

/// Extracts one resource attribute value from a sample.
///
/// Specs starting with `$.` reference a sample field (`$.resource_id`,
/// `$.user_id`, `$.project_id`, `$.unit`, `$.meter`, `$.metadata.<key>`);
/// anything else is a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Extractor {
    Literal(String),
    ResourceId,
    UserId,
    ProjectId,
    Unit,
    Meter,
    Metadata(String),
}

impl Extractor {
    fn parse(spec: &str) -> Option<Self> {
        let Some(path) = spec.strip_prefix("$.") else {
            return Some(Extractor::Literal(spec.to_owned()));
        };
        match path {
            "resource_id" => Some(Extractor::ResourceId),
            "user_id" => Some(Extractor::UserId),
            "project_id" => Some(Extractor::ProjectId),
            "unit" => Some(Extractor::Unit),
            "meter" => Some(Extractor::Meter),
            _ => path.strip_prefix("metadata.").map(|key| Extractor::Metadata(key.to_owned())),
        }
    }

    /// `None` when the sample carries no value for this extractor.
    fn evaluate(&self, sample: &Sample) -> Option<String> {
        match self {
            Extractor::Literal(value) => Some(value.clone()),
            Extractor::ResourceId => Some(sample.resource_id.clone()),
            Extractor::UserId => Some(sample.user_id.clone()),
            Extractor::ProjectId => Some(sample.project_id.clone()),
            Extractor::Unit => Some(sample.unit.clone()),
            Extractor::Meter => Some(sample.meter.clone()),
            Extractor::Metadata(key) => sample.metadata.get(key).cloned(),
        }
    }
}

/// One declarative rule: meter-name patterns, the backend resource type they
/// map to, the attribute extractors and the archive policy.
#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    pub resource_type: String,
    /// `(source text, parsed pattern)`, in declaration order.
    patterns: Vec<(String, MeterPattern)>,
    attributes: BTreeMap<String, Extractor>,
    pub archive_policy: Option<String>,
    pub ignore: bool,
}

impl ResourceDefinition {
    /// `true` if any of the declared patterns matches the meter name.
    pub fn matches(&self, meter: &str) -> bool {
        self.patterns.iter().any(|(_, p)| p.matches(meter))
    }

    /// Evaluates the configured extractors against the sample, omitting any
    /// that yield no value.
    pub fn attributes(&self, sample: &Sample) -> BTreeMap<String, String> {
        self.attributes
            .iter()
            .filter_map(|(name, extractor)| extractor.evaluate(sample).map(|v| (name.clone(), v)))
            .collect()
    }

    /// The full metric-policy map declared by this definition, keyed by
    /// pattern text. Falls back to `default_policy` when the definition
    /// specifies none, and to the empty policy when there is no default
    /// either.
    pub fn metrics(&self, default_policy: Option<&str>) -> BTreeMap<String, MetricPolicy> {
        let policy = self.policy(default_policy);
        self.patterns
            .iter()
            .map(|(text, _)| (text.clone(), policy.clone()))
            .collect()
    }

    /// The archive policy to use when creating a single metric under this
    /// definition's resource type.
    pub fn policy(&self, default_policy: Option<&str>) -> MetricPolicy {
        MetricPolicy {
            archive_policy_name: self
                .archive_policy
                .clone()
                .or_else(|| default_policy.map(str::to_owned)),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionFile {
    #[serde(default)]
    resources: Vec<RawDefinition>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefinition {
    resource_type: String,
    metrics: Vec<String>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    archive_policy: Option<String>,
    #[serde(default)]
    ignore: bool,
}

/// The ordered list of resource definitions. First match wins.
#[derive(Debug, Clone, Default)]
pub struct ResourceDefinitions {
    definitions: Vec<ResourceDefinition>,
}

impl ResourceDefinitions {
    /// Loads and validates definitions from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parses and validates definitions from a TOML document.
    pub fn parse(document: &str) -> Result<Self, DefinitionError> {
        let file: DefinitionFile = toml::from_str(document)?;
        let definitions = file.resources.into_iter().map(Self::validate).collect::<Result<_, _>>()?;
        Ok(Self { definitions })
    }

    fn validate(raw: RawDefinition) -> Result<ResourceDefinition, DefinitionError> {
        if raw.metrics.is_empty() {
            return Err(DefinitionError::EmptyMetrics {
                resource_type: raw.resource_type,
            });
        }
        let mut patterns = Vec::with_capacity(raw.metrics.len());
        for text in raw.metrics {
            let pattern = MeterPattern::from_str(&text).map_err(|source| DefinitionError::BadPattern {
                resource_type: raw.resource_type.clone(),
                pattern: text.clone(),
                source,
            })?;
            patterns.push((text, pattern));
        }
        let mut attributes = BTreeMap::new();
        for (name, spec) in raw.attributes {
            let extractor = Extractor::parse(&spec).ok_or_else(|| DefinitionError::UnknownField {
                resource_type: raw.resource_type.clone(),
                name: name.clone(),
                path: spec.clone(),
            })?;
            attributes.insert(name, extractor);
        }
        Ok(ResourceDefinition {
            resource_type: raw.resource_type,
            patterns,
            attributes,
            archive_policy: raw.archive_policy,
            ignore: raw.ignore,
        })
    }

    /// Returns the first definition whose pattern list matches the meter name.
    pub fn find(&self, meter: &str) -> Option<&ResourceDefinition> {
        self.definitions.iter().find(|rd| rd.matches(meter))
    }

    /// `true` if the meter matches a definition of the given resource type.
    pub fn matches_resource_type(&self, meter: &str, resource_type: &str) -> bool {
        self.definitions
            .iter()
            .any(|rd| rd.resource_type == resource_type && rd.matches(meter))
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
