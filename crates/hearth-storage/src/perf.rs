//! Per-description database time accounting.
//!
//! Every finished transaction attempt adds its duration under its
//! description. Once per reporting interval the runner asks for the share of
//! wall time each description consumed since the previous report.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

#[derive(Clone, Copy, Debug, Default)]
struct Totals {
    count: u64,
    cumulative: Duration,
}

/// Activity of one description over one interval.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceSample {
    /// Transaction description.
    pub desc: String,
    /// Attempts finished during the interval.
    pub count: u64,
    /// Time spent during the interval.
    pub duration: Duration,
    /// `duration / interval`.
    pub ratio: f64,
}

impl PerformanceSample {
    /// `"{desc}({count}): {pct:.3}%"`.
    pub fn render(&self) -> String {
        format!("{}({}): {:.3}%", self.desc, self.count, self.ratio * 100.0)
    }
}

/// Cumulative `(count, duration)` per description, with the values as of the
/// previous report.
#[derive(Debug, Default)]
pub struct PerformanceCounters {
    current: HashMap<String, Totals>,
    previous: HashMap<String, Totals>,
}

impl PerformanceCounters {
    /// Empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one finished attempt.
    pub fn update(&mut self, desc: &str, elapsed: Duration) {
        let totals = self.current.entry(desc.to_owned()).or_default();
        totals.count += 1;
        totals.cumulative += elapsed;
    }

    /// The `limit` busiest descriptions since the previous call, busiest
    /// first. Advances the baseline.
    pub fn interval_samples(&mut self, interval: Duration, limit: usize) -> Vec<PerformanceSample> {
        let interval_secs = interval.as_secs_f64();
        let mut samples: Vec<PerformanceSample> = self
            .current
            .iter()
            .map(|(desc, now)| {
                let before = self.previous.get(desc).copied().unwrap_or_default();
                let duration = now.cumulative.saturating_sub(before.cumulative);
                let ratio = if interval_secs > 0.0 {
                    duration.as_secs_f64() / interval_secs
                } else {
                    0.0
                };
                PerformanceSample {
                    desc: desc.clone(),
                    count: now.count - before.count,
                    duration,
                    ratio,
                }
            })
            .collect();

        samples.sort_by(|a, b| {
            b.ratio
                .total_cmp(&a.ratio)
                .then_with(|| a.desc.cmp(&b.desc))
        });
        samples.truncate(limit);

        self.previous.clone_from(&self.current);
        samples
    }

    /// [`interval_samples`](Self::interval_samples) rendered as one line.
    pub fn interval(&mut self, interval: Duration, limit: usize) -> String {
        self.interval_samples(interval, limit)
            .iter()
            .map(PerformanceSample::render)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn reports_busiest_first() {
        let mut perf = PerformanceCounters::new();
        perf.update("get_user", ms(100));
        perf.update("get_user", ms(100));
        perf.update("store_event", ms(500));
        perf.update("get_room", ms(10));

        let line = perf.interval(Duration::from_secs(1), 2);
        assert_eq!(line, "store_event(1): 50.000%, get_user(2): 20.000%");
    }

    #[test]
    fn second_interval_reports_only_new_activity() {
        let mut perf = PerformanceCounters::new();
        perf.update("get_user", ms(300));
        let _ = perf.interval(Duration::from_secs(1), 3);

        perf.update("get_user", ms(100));
        let samples = perf.interval_samples(Duration::from_secs(1), 3);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].count, 1);
        assert_eq!(samples[0].duration, ms(100));
    }

    #[test]
    fn idle_description_reports_zero() {
        let mut perf = PerformanceCounters::new();
        perf.update("get_user", ms(300));
        let _ = perf.interval(Duration::from_secs(1), 3);

        assert_eq!(
            perf.interval(Duration::from_secs(1), 3),
            "get_user(0): 0.000%"
        );
    }

    #[test]
    fn empty_counters_render_empty() {
        let mut perf = PerformanceCounters::new();
        assert_eq!(perf.interval(Duration::from_secs(10), 3), "");
    }

    #[test]
    fn zero_interval_does_not_divide_by_zero() {
        let mut perf = PerformanceCounters::new();
        perf.update("get_user", ms(5));
        let samples = perf.interval_samples(Duration::ZERO, 3);
        assert!(samples[0].ratio.abs() < f64::EPSILON);
    }
}
