//! Existence pollsters: one gauge per running instance.

use stratus::pollster::{CycleCache, InspectError, PollContext, Pollster};
use stratus::resources::Instance;
use stratus::sample::{Sample, SampleKind};

/// Gauges `instance` = 1 for every tracked instance.
pub struct InstancePollster;

impl Pollster for InstancePollster {
    fn name(&self) -> &'static str {
        "instance"
    }

    fn sample(
        &mut self,
        _ctx: &PollContext,
        _cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError> {
        Ok(vec![Sample::from_instance(
            instance,
            "instance",
            SampleKind::Gauge,
            "instance",
            1.0,
        )])
    }
}

/// Gauges `instance:<flavor>` = 1, so that deployments can meter per flavor.
pub struct InstanceFlavorPollster;

impl Pollster for InstanceFlavorPollster {
    fn name(&self) -> &'static str {
        "instance.flavor"
    }

    fn sample(
        &mut self,
        _ctx: &PollContext,
        _cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError> {
        Ok(vec![Sample::from_instance(
            instance,
            format!("instance:{}", instance.flavor),
            SampleKind::Gauge,
            "instance",
            1.0,
        )])
    }
}
