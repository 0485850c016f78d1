use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{IntCounter, IntGauge, Registry};
use serde::Serialize;

/// Max-delay trackers stay at zero until this many binds have completed.
pub const WARM_UP_BINDS: u64 = 200;

/// Process-wide session statistics shared by every session of a client context.
///
/// Counters are prometheus `IntCounter`s, so increments from concurrent sessions
/// are never lost. Max delays are kept in milliseconds.
pub struct Stats {
    registry: Registry,

    pub create_pending: IntCounter,
    pub create_done: IntCounter,
    pub bind_pending: IntCounter,
    pub bind_done: IntCounter,
    pub sub_pending: IntCounter,
    pub sub_done: IntCounter,
    pub conn_errors: IntCounter,
    pub socket_errors: IntCounter,
    pub bytes_read: IntCounter,

    max_create_delay: AtomicU64,
    max_bind_delay: AtomicU64,
    max_sub_delay: AtomicU64,
    max_delay_gauges: [IntGauge; 3],
}

/// Point-in-time copy of [`Stats`]; each field is read atomically on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub create_pending: u64,
    pub create_done: u64,
    pub bind_pending: u64,
    pub bind_done: u64,
    pub sub_pending: u64,
    pub sub_done: u64,
    pub conn_errors: u64,
    pub socket_errors: u64,
    pub bytes_read: u64,
    pub max_create_delay_ms: u64,
    pub max_bind_delay_ms: u64,
    pub max_sub_delay_ms: u64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Stats {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("streamload".to_string()), None)?;

        Ok(Self {
            create_pending: counter(&registry, "create_pending", "Session creations started")?,
            create_done: counter(&registry, "create_done", "Session creations acknowledged")?,
            bind_pending: counter(&registry, "bind_pending", "Session binds started")?,
            bind_done: counter(&registry, "bind_done", "Session binds completed")?,
            sub_pending: counter(&registry, "sub_pending", "Subscriptions requested")?,
            sub_done: counter(&registry, "sub_done", "Subscriptions acknowledged")?,
            conn_errors: counter(&registry, "conn_errors", "Transport level failures")?,
            socket_errors: counter(
                &registry,
                "socket_errors",
                "Server reported or decode failures",
            )?,
            bytes_read: counter(&registry, "bytes_read", "Stream bytes received")?,
            max_create_delay: AtomicU64::new(0),
            max_bind_delay: AtomicU64::new(0),
            max_sub_delay: AtomicU64::new(0),
            max_delay_gauges: [
                gauge(&registry, "max_create_delay_ms", "Slowest session creation")?,
                gauge(&registry, "max_bind_delay_ms", "Slowest session bind")?,
                gauge(&registry, "max_sub_delay_ms", "Slowest subscription")?,
            ],
            registry,
        })
    }

    pub fn notify_create_delay(&self, delay: Duration) {
        self.update_max(&self.max_create_delay, delay);
    }

    pub fn notify_bind_delay(&self, delay: Duration) {
        self.update_max(&self.max_bind_delay, delay);
    }

    pub fn notify_sub_delay(&self, delay: Duration) {
        self.update_max(&self.max_sub_delay, delay);
    }

    fn update_max(&self, max: &AtomicU64, delay: Duration) {
        if self.bind_done.get() > WARM_UP_BINDS {
            max.fetch_max(delay.as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            create_pending: self.create_pending.get(),
            create_done: self.create_done.get(),
            bind_pending: self.bind_pending.get(),
            bind_done: self.bind_done.get(),
            sub_pending: self.sub_pending.get(),
            sub_done: self.sub_done.get(),
            conn_errors: self.conn_errors.get(),
            socket_errors: self.socket_errors.get(),
            bytes_read: self.bytes_read.get(),
            max_create_delay_ms: self.max_create_delay.load(Ordering::Relaxed),
            max_bind_delay_ms: self.max_bind_delay.load(Ordering::Relaxed),
            max_sub_delay_ms: self.max_sub_delay.load(Ordering::Relaxed),
        }
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        let maxes = [&self.max_create_delay, &self.max_bind_delay, &self.max_sub_delay];
        for (gauge, max) in self.max_delay_gauges.iter().zip(maxes) {
            gauge.set(max.load(Ordering::Relaxed) as i64);
        }

        self.registry.gather()
    }

    /// Zeroes everything. Only meant for test harnesses.
    pub fn reset(&self) {
        for counter in [
            &self.create_pending,
            &self.create_done,
            &self.bind_pending,
            &self.bind_done,
            &self.sub_pending,
            &self.sub_done,
            &self.conn_errors,
            &self.socket_errors,
            &self.bytes_read,
        ] {
            counter.reset();
        }

        for max in [&self.max_create_delay, &self.max_bind_delay, &self.max_sub_delay] {
            max.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Stats").field(&self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_max_delay_ignores_warm_up() {
        let stats = Stats::new().unwrap();

        stats.notify_bind_delay(Duration::from_millis(900));
        assert_eq!(stats.snapshot().max_bind_delay_ms, 0);

        stats.bind_done.inc_by(WARM_UP_BINDS + 1);
        stats.notify_bind_delay(Duration::from_millis(40));
        stats.notify_bind_delay(Duration::from_millis(15));

        assert_eq!(stats.snapshot().max_bind_delay_ms, 40);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let stats = Arc::new(Stats::new().unwrap());
        stats.bind_done.inc_by(WARM_UP_BINDS + 1);

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    let mut last_seen = 0;
                    for i in 0..500u64 {
                        stats.sub_done.inc();
                        stats.notify_sub_delay(Duration::from_millis(t * 1000 + i));

                        let now = stats.snapshot().max_sub_delay_ms;
                        assert!(now >= last_seen);
                        last_seen = now;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sub_done, 8 * 500);
        assert_eq!(snapshot.max_sub_delay_ms, 7 * 1000 + 499);
    }

    #[test]
    fn test_gather_exports_counters() {
        let stats = Stats::new().unwrap();
        stats.bytes_read.inc_by(42);

        let families = stats.gather();
        let bytes = families
            .iter()
            .find(|f| f.get_name() == "streamload_bytes_read")
            .unwrap();

        assert_eq!(bytes.get_metric()[0].get_counter().get_value(), 42.0);
        let names: Vec<_> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"streamload_max_sub_delay_ms"));
    }

    #[test]
    fn test_reset() {
        let stats = Stats::new().unwrap();
        stats.conn_errors.inc();
        stats.reset();

        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
