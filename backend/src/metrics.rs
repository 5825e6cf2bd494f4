//! Allocator counters exported as pull gauges.
//!
//! Nothing is cached: each scrape advances the allocator's stats epoch once,
//! then reads every counter straight from the allocator.

use std::{fmt, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use prometheus_client::{
    collector::Collector,
    encoding::{text::encode, DescriptorEncoder, EncodeMetric},
    metrics::gauge::ConstGauge,
    registry::Registry,
};

use crate::allocator::{AllocatorCounter, SharedAllocator};

/// Subsystem every allocator gauge is registered under.
pub const SUBSYSTEM: &str = "jemalloc";

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Registers one gauge per [`AllocatorCounter`] as
/// `<namespace>_jemalloc_<counter>`.
///
/// Returns `false` and registers nothing when the allocator was built without
/// stats. Must be called at most once per registry.
pub fn register_allocator_metrics(
    namespace: &str,
    registry: &mut Registry,
    allocator: &SharedAllocator,
) -> bool {
    if !allocator.is_stats_enabled() {
        tracing::info!("jemalloc stats is not enabled, skipping metric registration");
        return false;
    }
    tracing::info!("register jemalloc stats metrics");

    let registry = if namespace.is_empty() {
        registry
    } else {
        registry.sub_registry_with_prefix(namespace)
    };
    let registry = registry.sub_registry_with_prefix(SUBSYSTEM);
    // collectors encode in registration order, so the epoch moves first
    registry.register_collector(Box::new(StatsEpoch {
        allocator: Arc::clone(allocator),
    }));
    for counter in AllocatorCounter::ALL {
        registry.register_collector(Box::new(CounterGauge {
            counter,
            allocator: Arc::clone(allocator),
        }));
    }
    true
}

/// Emits nothing; advances the stats epoch ahead of the counter gauges.
struct StatsEpoch {
    allocator: SharedAllocator,
}

impl fmt::Debug for StatsEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsEpoch").finish_non_exhaustive()
    }
}

impl Collector for StatsEpoch {
    fn encode(&self, _encoder: DescriptorEncoder) -> Result<(), fmt::Error> {
        let status = self.allocator.refresh_stats();
        if status != 0 {
            tracing::warn!(
                "jemalloc stats epoch refresh failed with code {status}, serving stale values"
            );
        }
        Ok(())
    }
}

struct CounterGauge {
    counter: AllocatorCounter,
    allocator: SharedAllocator,
}

impl fmt::Debug for CounterGauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterGauge")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl Collector for CounterGauge {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), fmt::Error> {
        let value = self.allocator.read_counter(self.counter);
        let gauge = ConstGauge::new(i64::try_from(value).unwrap_or(i64::MAX));
        let metric_encoder = encoder.encode_descriptor(
            self.counter.name(),
            self.counter.help(),
            None,
            gauge.metric_type(),
        )?;
        gauge.encode(metric_encoder)
    }
}

/// Renders `registry` in the OpenMetrics text format.
pub fn render(registry: &Registry) -> Result<String, fmt::Error> {
    let mut body = String::new();
    encode(&mut body, registry)?;
    Ok(body)
}

/// `GET /metrics`
pub async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    match render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::warn!("failed to encode metrics: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n").into_response()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeAllocator;

    fn registry_with(fake: &Arc<FakeAllocator>, namespace: &str) -> (Registry, bool) {
        let mut registry = Registry::default();
        let allocator: SharedAllocator = fake.clone();
        let registered = register_allocator_metrics(namespace, &mut registry, &allocator);
        (registry, registered)
    }

    #[test]
    fn every_counter_is_exported_under_namespace() {
        let fake = Arc::new(FakeAllocator::new());
        let (registry, registered) = registry_with(&fake, "heapctl");
        assert!(registered);

        let body = render(&registry).expect("encode");
        for counter in AllocatorCounter::ALL {
            let line = format!("heapctl_jemalloc_{} 0\n", counter.name());
            assert!(body.contains(&line), "missing {line:?} in {body}");
        }
        assert!(body.contains("# TYPE heapctl_jemalloc_allocated gauge"));
    }

    #[test]
    fn values_are_read_at_scrape_time() {
        let fake = Arc::new(FakeAllocator::new());
        let (registry, _) = registry_with(&fake, "heapctl");

        fake.set_counter(AllocatorCounter::Allocated, 1024);
        assert!(render(&registry)
            .expect("encode")
            .contains("heapctl_jemalloc_allocated 1024\n"));

        fake.set_counter(AllocatorCounter::Allocated, 2048);
        fake.set_counter(AllocatorCounter::BackgroundThreadNumRuns, 3);
        let body = render(&registry).expect("encode");
        assert!(body.contains("heapctl_jemalloc_allocated 2048\n"));
        assert!(body.contains("heapctl_jemalloc_background_thread_num_runs 3\n"));
    }

    #[test]
    fn empty_namespace_keeps_subsystem_prefix() {
        let fake = Arc::new(FakeAllocator::new());
        let (registry, _) = registry_with(&fake, "");
        let body = render(&registry).expect("encode");
        assert!(body.contains("\njemalloc_resident 0\n"), "{body}");
    }

    #[test]
    fn nothing_registered_without_stats() {
        let fake = Arc::new(FakeAllocator::new().without_stats());
        let (registry, registered) = registry_with(&fake, "heapctl");
        assert!(!registered);
        assert!(!render(&registry).expect("encode").contains("jemalloc"));
    }

    #[test]
    fn each_scrape_refreshes_stats_once() {
        let fake = Arc::new(FakeAllocator::new());
        let (registry, _) = registry_with(&fake, "heapctl");
        assert_eq!(fake.stats_refreshes(), 0);

        render(&registry).expect("encode");
        assert_eq!(fake.stats_refreshes(), 1);
        render(&registry).expect("encode");
        assert_eq!(fake.stats_refreshes(), 2);
    }

    #[test]
    fn failed_refresh_still_serves_counters() {
        let fake = Arc::new(FakeAllocator::new());
        fake.set_refresh_status(libc::EAGAIN);
        fake.set_counter(AllocatorCounter::Active, 4096);
        let (registry, _) = registry_with(&fake, "heapctl");

        let body = render(&registry).expect("encode");
        assert_eq!(fake.stats_refreshes(), 1);
        assert!(body.contains("heapctl_jemalloc_active 4096\n"), "{body}");
    }

    #[test]
    fn oversized_counter_saturates() {
        let fake = Arc::new(FakeAllocator::new());
        fake.set_counter(AllocatorCounter::Mapped, u64::MAX);
        let (registry, _) = registry_with(&fake, "heapctl");
        let body = render(&registry).expect("encode");
        assert!(body.contains(&format!("heapctl_jemalloc_mapped {}\n", i64::MAX)));
    }
}
