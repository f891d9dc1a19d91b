//! Thread-safe metrics collection
//!
//! Atomic counters for pipeline runs, agent executions, bus traffic, and
//! context lifecycle, plus a bounded window of durations for percentiles.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DURATION_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

#[derive(Debug, Default)]
struct DurationWindow {
    samples: Mutex<VecDeque<u64>>,
}

impl DurationWindow {
    fn record(&self, duration: Duration) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push_back(duration.as_millis() as u64);
            if samples.len() > DURATION_WINDOW {
                samples.pop_front();
            }
        }
    }

    fn stats(&self) -> DurationStats {
        let mut sorted: Vec<u64> = match self.samples.lock() {
            Ok(samples) => samples.iter().copied().collect(),
            Err(_) => Vec::new(),
        };
        if sorted.is_empty() {
            return DurationStats::default();
        }
        sorted.sort_unstable();

        DurationStats {
            avg_ms: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
        }
    }

    fn clear(&self) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
        }
    }
}

/// Thread-safe metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    pipelines_started: AtomicU64,
    pipelines_completed: AtomicU64,
    pipelines_failed: AtomicU64,
    pipelines_cancelled: AtomicU64,
    pipelines_running: AtomicU64,
    pipeline_durations: DurationWindow,

    agent_executions_succeeded: AtomicU64,
    agent_executions_failed: AtomicU64,
    agent_executions_timed_out: AtomicU64,
    agent_durations: DurationWindow,

    messages_published: AtomicU64,
    messages_rejected: AtomicU64,
    requests_timed_out: AtomicU64,
    circuit_opens: AtomicU64,

    contexts_created: AtomicU64,
    contexts_expired: AtomicU64,

    started_at: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            pipelines_started: AtomicU64::new(0),
            pipelines_completed: AtomicU64::new(0),
            pipelines_failed: AtomicU64::new(0),
            pipelines_cancelled: AtomicU64::new(0),
            pipelines_running: AtomicU64::new(0),
            pipeline_durations: DurationWindow::default(),
            agent_executions_succeeded: AtomicU64::new(0),
            agent_executions_failed: AtomicU64::new(0),
            agent_executions_timed_out: AtomicU64::new(0),
            agent_durations: DurationWindow::default(),
            messages_published: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            circuit_opens: AtomicU64::new(0),
            contexts_created: AtomicU64::new(0),
            contexts_expired: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Pipeline runs
    pub fn record_pipeline_started(&self) {
        self.pipelines_started.fetch_add(1, Ordering::Relaxed);
        self.pipelines_running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_completed(&self, duration: Duration) {
        self.pipelines_completed.fetch_add(1, Ordering::Relaxed);
        self.finish_pipeline(duration);
    }

    pub fn record_pipeline_failed(&self, duration: Duration) {
        self.pipelines_failed.fetch_add(1, Ordering::Relaxed);
        self.finish_pipeline(duration);
    }

    pub fn record_pipeline_cancelled(&self, duration: Duration) {
        self.pipelines_cancelled.fetch_add(1, Ordering::Relaxed);
        self.finish_pipeline(duration);
    }

    fn finish_pipeline(&self, duration: Duration) {
        let _ = self
            .pipelines_running
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.pipeline_durations.record(duration);
    }

    // Agent executions
    pub fn record_agent_execution(&self, success: bool, duration: Duration) {
        if success {
            self.agent_executions_succeeded
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.agent_executions_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.agent_durations.record(duration);
    }

    pub fn record_agent_timeout(&self) {
        self.agent_executions_timed_out
            .fetch_add(1, Ordering::Relaxed);
    }

    // Message bus
    pub fn record_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_timeout(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_opened(&self) {
        self.circuit_opens.fetch_add(1, Ordering::Relaxed);
    }

    // Contexts
    pub fn record_context_created(&self) {
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contexts_expired(&self, count: u64) {
        self.contexts_expired.fetch_add(count, Ordering::Relaxed);
    }

    /// Reset every counter (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.pipelines_started,
            &self.pipelines_completed,
            &self.pipelines_failed,
            &self.pipelines_cancelled,
            &self.pipelines_running,
            &self.agent_executions_succeeded,
            &self.agent_executions_failed,
            &self.agent_executions_timed_out,
            &self.messages_published,
            &self.messages_rejected,
            &self.requests_timed_out,
            &self.circuit_opens,
            &self.contexts_created,
            &self.contexts_expired,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.pipeline_durations.clear();
        self.agent_durations.clear();
        self.started_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Point-in-time copy of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            pipelines: PipelineMetrics {
                started: load(&self.pipelines_started),
                completed: load(&self.pipelines_completed),
                failed: load(&self.pipelines_failed),
                cancelled: load(&self.pipelines_cancelled),
                running: load(&self.pipelines_running),
                duration: self.pipeline_durations.stats(),
            },
            agents: AgentMetrics {
                succeeded: load(&self.agent_executions_succeeded),
                failed: load(&self.agent_executions_failed),
                timed_out: load(&self.agent_executions_timed_out),
                duration: self.agent_durations.stats(),
            },
            bus: BusMetrics {
                messages_published: load(&self.messages_published),
                messages_rejected: load(&self.messages_rejected),
                requests_timed_out: load(&self.requests_timed_out),
                circuit_opens: load(&self.circuit_opens),
            },
            contexts: ContextMetrics {
                created: load(&self.contexts_created),
                expired: load(&self.contexts_expired),
            },
            uptime_seconds: now.saturating_sub(load(&self.started_at)),
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DurationStats {
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub pipelines: PipelineMetrics,
    pub agents: AgentMetrics,
    pub bus: BusMetrics,
    pub contexts: ContextMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub running: u64,
    pub duration: DurationStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub duration: DurationStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusMetrics {
    pub messages_published: u64,
    pub messages_rejected: u64,
    pub requests_timed_out: u64,
    pub circuit_opens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextMetrics {
    pub created: u64,
    pub expired: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    if lower == upper {
        sorted_data[lower] as f64
    } else {
        let weight = index - lower as f64;
        sorted_data[lower] as f64 * (1.0 - weight) + sorted_data[upper] as f64 * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_counters() {
        let m = MetricsCollector::new();
        m.record_pipeline_started();
        m.record_pipeline_started();
        m.record_pipeline_completed(Duration::from_millis(10));
        m.record_pipeline_cancelled(Duration::from_millis(30));

        let snap = m.snapshot();
        assert_eq!(snap.pipelines.started, 2);
        assert_eq!(snap.pipelines.completed, 1);
        assert_eq!(snap.pipelines.cancelled, 1);
        assert_eq!(snap.pipelines.running, 0);
        assert_eq!(snap.pipelines.duration.avg_ms, 20.0);
    }

    #[test]
    fn test_running_never_underflows() {
        let m = MetricsCollector::new();
        m.record_pipeline_failed(Duration::ZERO);
        assert_eq!(m.snapshot().pipelines.running, 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let m = MetricsCollector::new();
        m.record_agent_execution(true, Duration::from_millis(5));
        m.record_message_published();
        m.record_contexts_expired(4);
        m.reset();

        let snap = m.snapshot();
        assert_eq!(snap.agents.succeeded, 0);
        assert_eq!(snap.bus.messages_published, 0);
        assert_eq!(snap.contexts.expired, 0);
        assert_eq!(snap.agents.duration.p99_ms, 0.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let data = [10, 20, 30, 40];
        assert_eq!(percentile(&data, 0.0), 10.0);
        assert_eq!(percentile(&data, 100.0), 40.0);
        assert_eq!(percentile(&data, 50.0), 25.0);
    }

    #[test]
    fn test_duration_window_is_bounded() {
        let window = DurationWindow::default();
        for i in 0..(DURATION_WINDOW + 10) {
            window.record(Duration::from_millis(i as u64));
        }
        assert_eq!(window.samples.lock().unwrap().len(), DURATION_WINDOW);
    }
}
