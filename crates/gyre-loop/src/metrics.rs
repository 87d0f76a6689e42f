// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Optional loop metrics.
//!
//! Queue depths are folded into an exponential moving average (α = 1/8)
//! with an observed max, sampled once per tick. Task execution latency
//! feeds P² (p-square) streaming quantile estimators for p50/p90/p99;
//! below five observations the estimate is exact from a sorted buffer.
//! Throughput is tasks over a sliding one-second window.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const EMA_ALPHA: f64 = 1.0 / 8.0;

/// EMA + max of a sampled queue depth.
struct DepthStat {
    ema: f64,
    max: usize,
}

impl DepthStat {
    fn new() -> Self {
        Self { ema: 0.0, max: 0 }
    }

    fn sample(&mut self, depth: usize) {
        self.ema += (depth as f64 - self.ema) * EMA_ALPHA;
        self.max = self.max.max(depth);
    }
}

/// P² estimator for one quantile. Five markers track the running
/// quantile without storing the observations.
struct PSquare {
    p: f64,
    count: usize,
    heights: [f64; 5],
    positions: [f64; 5],
    desired: [f64; 5],
    increments: [f64; 5],
}

impl PSquare {
    fn new(p: f64) -> Self {
        Self {
            p,
            count: 0,
            heights: [0.0; 5],
            positions: [1.0, 2.0, 3.0, 4.0, 5.0],
            desired: [1.0, 1.0 + 2.0 * p, 1.0 + 4.0 * p, 3.0 + 2.0 * p, 5.0],
            increments: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
        }
    }

    fn record(&mut self, x: f64) {
        if self.count < 5 {
            self.heights[self.count] = x;
            self.count += 1;
            if self.count == 5 {
                self.heights.sort_by(|a, b| a.partial_cmp(b).unwrap());
            }
            return;
        }

        // Locate the cell and stretch the extremes.
        let k = if x < self.heights[0] {
            self.heights[0] = x;
            0
        } else if x >= self.heights[4] {
            self.heights[4] = x;
            3
        } else {
            let mut cell = 0;
            for i in 0..4 {
                if self.heights[i] <= x && x < self.heights[i + 1] {
                    cell = i;
                    break;
                }
            }
            cell
        };

        for i in (k + 1)..5 {
            self.positions[i] += 1.0;
        }
        for i in 0..5 {
            self.desired[i] += self.increments[i];
        }

        // Nudge the interior markers toward their desired positions.
        for i in 1..4 {
            let d = self.desired[i] - self.positions[i];
            let ahead = self.positions[i + 1] - self.positions[i];
            let behind = self.positions[i - 1] - self.positions[i];
            if (d >= 1.0 && ahead > 1.0) || (d <= -1.0 && behind < -1.0) {
                let d = d.signum();
                let parabolic = self.parabolic(i, d);
                self.heights[i] = if self.heights[i - 1] < parabolic && parabolic < self.heights[i + 1]
                {
                    parabolic
                } else {
                    self.linear(i, d)
                };
                self.positions[i] += d;
            }
        }

        self.count += 1;
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let q = &self.heights;
        let n = &self.positions;
        q[i] + d / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + d) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - d) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let j = if d > 0.0 { i + 1 } else { i - 1 };
        self.heights[i] + d * (self.heights[j] - self.heights[i]) / (self.positions[j] - self.positions[i])
    }

    fn estimate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        if self.count < 5 {
            // Exact quantile over the few samples seen so far.
            let mut buf = self.heights[..self.count].to_vec();
            buf.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let idx = ((buf.len() - 1) as f64 * self.p).round() as usize;
            return buf[idx];
        }
        self.heights[2]
    }
}

/// Tasks per second over a sliding window.
struct RateCounter {
    window_start: Instant,
    in_window: u64,
    last_rate: f64,
}

impl RateCounter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            in_window: 0,
            last_rate: 0.0,
        }
    }

    fn record(&mut self, now: Instant) {
        self.in_window += 1;
        let elapsed = now - self.window_start;
        if elapsed >= Duration::from_secs(1) {
            self.last_rate = self.in_window as f64 / elapsed.as_secs_f64();
            self.window_start = now;
            self.in_window = 0;
        }
    }

    fn rate(&self) -> f64 {
        self.last_rate
    }
}

struct MetricsInner {
    external_depth: DepthStat,
    internal_depth: DepthStat,
    microtask_depth: DepthStat,
    p50: PSquare,
    p90: PSquare,
    p99: PSquare,
    rate: RateCounter,
}

/// Shared metrics sink. All recording paths are no-ops when the loop is
/// built with metrics off (the collector simply isn't constructed).
pub(crate) struct MetricsCollector {
    inner: Mutex<MetricsInner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                external_depth: DepthStat::new(),
                internal_depth: DepthStat::new(),
                microtask_depth: DepthStat::new(),
                p50: PSquare::new(0.50),
                p90: PSquare::new(0.90),
                p99: PSquare::new(0.99),
                rate: RateCounter::new(Instant::now()),
            }),
        }
    }

    pub fn sample_depths(&self, external: usize, internal: usize, microtasks: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.external_depth.sample(external);
        inner.internal_depth.sample(internal);
        inner.microtask_depth.sample(microtasks);
    }

    pub fn record_task(&self, latency: Duration) {
        let micros = latency.as_secs_f64() * 1e6;
        let mut inner = self.inner.lock().unwrap();
        inner.p50.record(micros);
        inner.p90.record(micros);
        inner.p99.record(micros);
        inner.rate.record(Instant::now());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        MetricsSnapshot {
            external_depth_ema: inner.external_depth.ema,
            external_depth_max: inner.external_depth.max,
            internal_depth_ema: inner.internal_depth.ema,
            internal_depth_max: inner.internal_depth.max,
            microtask_depth_ema: inner.microtask_depth.ema,
            microtask_depth_max: inner.microtask_depth.max,
            task_latency_p50_us: inner.p50.estimate(),
            task_latency_p90_us: inner.p90.estimate(),
            task_latency_p99_us: inner.p99.estimate(),
            tasks_per_second: inner.rate.rate(),
        }
    }
}

/// Point-in-time metrics view. All zeros when metrics are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub external_depth_ema: f64,
    pub external_depth_max: usize,
    pub internal_depth_ema: f64,
    pub internal_depth_max: usize,
    pub microtask_depth_ema: f64,
    pub microtask_depth_max: usize,
    pub task_latency_p50_us: f64,
    pub task_latency_p90_us: f64,
    pub task_latency_p99_us: f64,
    pub tasks_per_second: f64,
}
