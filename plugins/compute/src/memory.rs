//! Memory pollsters.
//!
//! The usage and resident pollsters share one inspection window per cycle
//! through the cycle cache: whichever runs first stores the elapsed duration
//! under [`INSPECTION_DURATION_KEY`] and the other reuses it, so both observe
//! the same window.

use std::sync::Arc;
use std::time::Duration;

use stratus::pollster::{CycleCache, InspectError, PollContext, Pollster};
use stratus::resources::Instance;
use stratus::sample::{Sample, SampleKind};

use crate::Inspector;

/// Cycle-cache key under which the inspection duration (in seconds) is
/// shared between the memory pollsters.
pub const INSPECTION_DURATION_KEY: &str = "compute.inspection_duration";

fn shared_duration(ctx: &PollContext, cache: &mut CycleCache) -> Duration {
    let secs = cache.get_or_insert_with(INSPECTION_DURATION_KEY, || ctx.inspection_duration().as_secs_f64());
    Duration::from_secs_f64(secs)
}

/// Samples `memory.usage`: active guest memory in MB.
pub struct MemoryUsagePollster {
    inspector: Arc<dyn Inspector>,
}

impl MemoryUsagePollster {
    pub fn new(inspector: Arc<dyn Inspector>) -> Self {
        Self { inspector }
    }
}

impl Pollster for MemoryUsagePollster {
    fn name(&self) -> &'static str {
        "memory.usage"
    }

    fn sample(
        &mut self,
        ctx: &PollContext,
        cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError> {
        let duration = shared_duration(ctx, cache);
        log::debug!("checking memory usage for instance {}", instance.id);
        let usage = self.inspector.inspect_memory_usage(instance, duration)?;
        Ok(vec![Sample::from_instance(
            instance,
            "memory.usage",
            SampleKind::Gauge,
            "MB",
            usage,
        )])
    }
}

/// Samples `memory.resident`: host-side resident memory in MB.
pub struct MemoryResidentPollster {
    inspector: Arc<dyn Inspector>,
}

impl MemoryResidentPollster {
    pub fn new(inspector: Arc<dyn Inspector>) -> Self {
        Self { inspector }
    }
}

impl Pollster for MemoryResidentPollster {
    fn name(&self) -> &'static str {
        "memory.resident"
    }

    fn sample(
        &mut self,
        ctx: &PollContext,
        cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError> {
        let duration = shared_duration(ctx, cache);
        log::debug!("checking resident memory for instance {}", instance.id);
        let resident = self.inspector.inspect_memory_resident(instance, duration)?;
        Ok(vec![Sample::from_instance(
            instance,
            "memory.resident",
            SampleKind::Gauge,
            "MB",
            resident,
        )])
    }
}

/// Samples `memory.total`: guest-reported total memory in MB.
pub struct MemoryTotalPollster {
    inspector: Arc<dyn Inspector>,
}

impl MemoryTotalPollster {
    pub fn new(inspector: Arc<dyn Inspector>) -> Self {
        Self { inspector }
    }
}

impl Pollster for MemoryTotalPollster {
    fn name(&self) -> &'static str {
        "memory.total"
    }

    fn sample(
        &mut self,
        _ctx: &PollContext,
        _cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError> {
        log::debug!("checking memory total for instance {}", instance.id);
        let info = self.inspector.inspect_memory_info(instance)?;
        Ok(vec![Sample::from_instance(
            instance,
            "memory.total",
            SampleKind::Gauge,
            "MB",
            info.total_mb,
        )])
    }
}

/// Samples `memory.unused`: guest memory not claimed by anything, in MB.
pub struct MemoryUnusedPollster {
    inspector: Arc<dyn Inspector>,
}

impl MemoryUnusedPollster {
    pub fn new(inspector: Arc<dyn Inspector>) -> Self {
        Self { inspector }
    }
}

impl Pollster for MemoryUnusedPollster {
    fn name(&self) -> &'static str {
        "memory.unused"
    }

    fn sample(
        &mut self,
        _ctx: &PollContext,
        _cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError> {
        log::debug!("checking memory unused for instance {}", instance.id);
        let info = self.inspector.inspect_memory_info(instance)?;
        Ok(vec![Sample::from_instance(
            instance,
            "memory.unused",
            SampleKind::Gauge,
            "MB",
            info.total_mb - info.used_mb,
        )])
    }
}

/// Samples `memory.buffer`: guest buffer memory in MB. Reported by Linux
/// guest agents only.
pub struct MemoryBufferPollster {
    inspector: Arc<dyn Inspector>,
}

impl MemoryBufferPollster {
    pub fn new(inspector: Arc<dyn Inspector>) -> Self {
        Self { inspector }
    }
}

impl Pollster for MemoryBufferPollster {
    fn name(&self) -> &'static str {
        "memory.buffer"
    }

    fn sample(
        &mut self,
        _ctx: &PollContext,
        _cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError> {
        log::debug!("checking memory buffer for instance {}", instance.id);
        let info = self.inspector.inspect_memory_info(instance)?;
        let buffer = info.buffer_mb.ok_or(InspectError::Unsupported)?;
        Ok(vec![Sample::from_instance(
            instance,
            "memory.buffer",
            SampleKind::Gauge,
            "MB",
            buffer,
        )])
    }
}

/// Samples `memory.cached`: guest page-cache memory in MB. Reported by Linux
/// guest agents only.
pub struct MemoryCachedPollster {
    inspector: Arc<dyn Inspector>,
}

impl MemoryCachedPollster {
    pub fn new(inspector: Arc<dyn Inspector>) -> Self {
        Self { inspector }
    }
}

impl Pollster for MemoryCachedPollster {
    fn name(&self) -> &'static str {
        "memory.cached"
    }

    fn sample(
        &mut self,
        _ctx: &PollContext,
        _cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError> {
        log::debug!("checking memory cached for instance {}", instance.id);
        let info = self.inspector.inspect_memory_info(instance)?;
        let cached = info.cached_mb.ok_or(InspectError::Unsupported)?;
        Ok(vec![Sample::from_instance(
            instance,
            "memory.cached",
            SampleKind::Gauge,
            "MB",
            cached,
        )])
    }
}

/// Samples `memory.swap.total` and `memory.swap.free` in MB.
pub struct MemorySwapPollster {
    inspector: Arc<dyn Inspector>,
}

impl MemorySwapPollster {
    pub fn new(inspector: Arc<dyn Inspector>) -> Self {
        Self { inspector }
    }
}

impl Pollster for MemorySwapPollster {
    fn name(&self) -> &'static str {
        "memory.swap"
    }

    fn sample(
        &mut self,
        _ctx: &PollContext,
        _cache: &mut CycleCache,
        instance: &Instance,
    ) -> Result<Vec<Sample>, InspectError> {
        log::debug!("checking swap for instance {}", instance.id);
        let info = self.inspector.inspect_memory_info(instance)?;
        Ok(vec![
            Sample::from_instance(instance, "memory.swap.total", SampleKind::Gauge, "MB", info.swap_total_mb),
            Sample::from_instance(
                instance,
                "memory.swap.free",
                SampleKind::Gauge,
                "MB",
                info.swap_total_mb - info.swap_used_mb,
            ),
        ])
    }
}
