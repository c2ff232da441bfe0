use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub tasks: TaskMetrics,
    pub deferrals: DeferralMetrics,
    pub performance: PerformanceMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub stalled: u64,
    pub success_rate: f64,
}

/// Tasks held back this run, by gate.
#[derive(Debug, Clone, Serialize)]
pub struct DeferralMetrics {
    pub cooldown: u64,
    pub duplicate: u64,
    pub rate_limited: u64,
    pub throttled: u64,
    pub lock_contended: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub total_duration_ms: u64,
    pub avg_task_duration_ms: f64,
    pub min_task_duration_ms: u64,
    pub max_task_duration_ms: u64,
}

#[derive(Debug)]
pub struct MetricsCollector {
    tasks_total: AtomicU64,
    tasks_success: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_stalled: AtomicU64,
    deferred_cooldown: AtomicU64,
    deferred_duplicate: AtomicU64,
    deferred_rate_limited: AtomicU64,
    deferred_throttled: AtomicU64,
    deferred_lock: AtomicU64,
    deferred_skipped: AtomicU64,
    task_duration_sum_ms: AtomicU64,
    task_min_duration_ms: AtomicU64,
    task_max_duration_ms: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            tasks_total: AtomicU64::new(0),
            tasks_success: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_stalled: AtomicU64::new(0),
            deferred_cooldown: AtomicU64::new(0),
            deferred_duplicate: AtomicU64::new(0),
            deferred_rate_limited: AtomicU64::new(0),
            deferred_throttled: AtomicU64::new(0),
            deferred_lock: AtomicU64::new(0),
            deferred_skipped: AtomicU64::new(0),
            task_duration_sum_ms: AtomicU64::new(0),
            task_min_duration_ms: AtomicU64::new(u64::MAX),
            task_max_duration_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl MetricsCollector {
    pub fn global() -> &'static Self {
        static INSTANCE: std::sync::OnceLock<MetricsCollector> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(MetricsCollector::default)
    }

    pub fn record_task(&self, duration: Duration, success: bool) {
        self.tasks_total.fetch_add(1, Ordering::SeqCst);
        let duration_ms = duration.as_millis() as u64;
        self.task_duration_sum_ms
            .fetch_add(duration_ms, Ordering::SeqCst);
        self.task_min_duration_ms
            .fetch_min(duration_ms, Ordering::SeqCst);
        self.task_max_duration_ms
            .fetch_max(duration_ms, Ordering::SeqCst);

        if success {
            self.tasks_success.fetch_add(1, Ordering::SeqCst);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_stall(&self) {
        self.tasks_stalled.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_deferral(&self, reason: &str) {
        let counter = match reason {
            "cooldown" => &self.deferred_cooldown,
            "duplicate" => &self.deferred_duplicate,
            "rate_limited" => &self.deferred_rate_limited,
            "throttled" => &self.deferred_throttled,
            "lock_contended" => &self.deferred_lock,
            _ => &self.deferred_skipped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_tasks = self.tasks_total.load(Ordering::SeqCst);
        let total_success = self.tasks_success.load(Ordering::SeqCst);
        let total_duration = self.task_duration_sum_ms.load(Ordering::SeqCst);
        let min_duration = self.task_min_duration_ms.load(Ordering::SeqCst);

        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            tasks: TaskMetrics {
                total: total_tasks,
                success: total_success,
                failed: self.tasks_failed.load(Ordering::SeqCst),
                stalled: self.tasks_stalled.load(Ordering::SeqCst),
                success_rate: if total_tasks > 0 {
                    total_success as f64 / total_tasks as f64 * 100.0
                } else {
                    0.0
                },
            },
            deferrals: DeferralMetrics {
                cooldown: self.deferred_cooldown.load(Ordering::SeqCst),
                duplicate: self.deferred_duplicate.load(Ordering::SeqCst),
                rate_limited: self.deferred_rate_limited.load(Ordering::SeqCst),
                throttled: self.deferred_throttled.load(Ordering::SeqCst),
                lock_contended: self.deferred_lock.load(Ordering::SeqCst),
                skipped: self.deferred_skipped.load(Ordering::SeqCst),
            },
            performance: PerformanceMetrics {
                total_duration_ms: total_duration,
                avg_task_duration_ms: if total_tasks > 0 {
                    total_duration as f64 / total_tasks as f64
                } else {
                    0.0
                },
                min_task_duration_ms: if min_duration == u64::MAX {
                    0
                } else {
                    min_duration
                },
                max_task_duration_ms: self.task_max_duration_ms.load(Ordering::SeqCst),
            },
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    pub async fn export_to_file(&self, path: &str) -> std::io::Result<()> {
        tokio::fs::write(path, self.to_json()).await
    }

    pub fn tasks_total(&self) -> u64 {
        self.tasks_total.load(Ordering::SeqCst)
    }

    pub fn tasks_success(&self) -> u64 {
        self.tasks_success.load(Ordering::SeqCst)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_aggregate_into_snapshot() {
        let metrics = MetricsCollector::default();

        metrics.record_task(Duration::from_millis(100), true);
        metrics.record_task(Duration::from_millis(200), true);
        metrics.record_task(Duration::from_millis(150), false);
        metrics.record_deferral("cooldown");
        metrics.record_deferral("cooldown");
        metrics.record_deferral("throttled");

        assert_eq!(metrics.tasks_total(), 3);
        assert_eq!(metrics.tasks_success(), 2);
        assert_eq!(metrics.tasks_failed(), 1);

        let snapshot = metrics.snapshot();
        assert!((snapshot.tasks.success_rate - 66.67).abs() < 0.1);
        assert_eq!(snapshot.deferrals.cooldown, 2);
        assert_eq!(snapshot.deferrals.throttled, 1);
        assert_eq!(snapshot.performance.min_task_duration_ms, 100);
        assert_eq!(snapshot.performance.max_task_duration_ms, 200);
    }

    #[test]
    fn json_export_contains_sections() {
        let metrics = MetricsCollector::default();
        metrics.record_task(Duration::from_millis(100), true);

        let json = metrics.to_json();
        assert!(json.contains("tasks"));
        assert!(json.contains("deferrals"));
        assert!(json.contains("performance"));
    }
}
