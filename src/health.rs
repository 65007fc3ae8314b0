//! Destination health monitoring.
//!
//! Keeps a fixed-size sliding window of recent outcomes per destination and
//! classifies it as Healthy, Degraded or Unhealthy. Advisory only: nothing here
//! blocks dispatch.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Window and thresholds used for classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of most recent outcomes kept per destination.
    pub window_size: usize,
    /// Below this many samples a destination is reported Healthy.
    pub min_samples: usize,
    /// Success rate at or above which a destination is Healthy.
    pub healthy_threshold: f64,
    /// Success rate at or above which a destination is Degraded rather than Unhealthy.
    pub degraded_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            min_samples: 5,
            healthy_threshold: 0.9,
            degraded_threshold: 0.5,
        }
    }
}

impl HealthConfig {
    fn classify(&self, samples: usize, success_rate: f64) -> HealthStatus {
        if samples < self.min_samples || success_rate >= self.healthy_threshold {
            HealthStatus::Healthy
        } else if success_rate >= self.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Point-in-time view of one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationHealth {
    pub status: HealthStatus,
    pub samples: usize,
    pub success_rate: f64,
    pub avg_latency_ms: u64,
    pub p95_latency_ms: u64,
}

/// Health of every destination seen so far, keyed by destination.
pub type HealthSnapshot = BTreeMap<String, DestinationHealth>;

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency_ms: u64,
}

#[derive(Debug)]
struct Window {
    samples: VecDeque<Sample>,
    status: HealthStatus,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            status: HealthStatus::Healthy,
        }
    }

    fn push(&mut self, sample: Sample, capacity: usize) {
        if self.samples.len() == capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn summarize(&self, config: &HealthConfig) -> DestinationHealth {
        let samples = self.samples.len();
        let successes = self.samples.iter().filter(|s| s.success).count();
        let success_rate = if samples == 0 {
            1.0
        } else {
            successes as f64 / samples as f64
        };

        let mut latencies: Vec<u64> = self.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();
        let avg_latency_ms = if samples == 0 {
            0
        } else {
            latencies.iter().sum::<u64>() / samples as u64
        };
        let p95_latency_ms = if samples == 0 {
            0
        } else {
            // Nearest-rank percentile.
            let rank = ((samples as f64) * 0.95).ceil() as usize;
            latencies[rank.clamp(1, samples) - 1]
        };

        DestinationHealth {
            status: config.classify(samples, success_rate),
            samples,
            success_rate,
            avg_latency_ms,
            p95_latency_ms,
        }
    }
}

/// Sliding-window outcome tracker, one window per destination.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
    windows: RwLock<HashMap<String, Arc<Mutex<Window>>>>,
}

impl HealthMonitor {
    /// A monitor with no recorded destinations.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Thresholds and window size in use.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    async fn window(&self, key: &str) -> Arc<Mutex<Window>> {
        if let Some(window) = self.windows.read().await.get(key) {
            return Arc::clone(window);
        }
        let mut windows = self.windows.write().await;
        Arc::clone(
            windows
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Window::new(self.config.window_size)))),
        )
    }

    /// Record one outcome for `key`, logging when its classification changes.
    pub async fn record(&self, key: &str, outcome: Outcome, latency_ms: u64) {
        let window = self.window(key).await;
        let mut window = window.lock().await;
        window.push(
            Sample {
                success: outcome == Outcome::Success,
                latency_ms,
            },
            self.config.window_size.max(1),
        );

        let summary = window.summarize(&self.config);
        if summary.status != window.status {
            match summary.status {
                HealthStatus::Healthy => tracing::info!(
                    destination = %key,
                    success_rate = summary.success_rate,
                    "destination recovered"
                ),
                status => tracing::warn!(
                    destination = %key,
                    %status,
                    success_rate = summary.success_rate,
                    samples = summary.samples,
                    "destination health changed"
                ),
            }
            window.status = summary.status;
        }
    }

    /// Current classification; unknown destinations are Healthy.
    pub async fn status(&self, key: &str) -> HealthStatus {
        self.destination(key)
            .await
            .map(|h| h.status)
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Summary of the current window for `key`, or `None` if nothing was recorded.
    pub async fn destination(&self, key: &str) -> Option<DestinationHealth> {
        let window = self.windows.read().await.get(key).cloned()?;
        let window = window.lock().await;
        Some(window.summarize(&self.config))
    }

    /// Summaries of every destination seen so far.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let windows: Vec<(String, Arc<Mutex<Window>>)> = self
            .windows
            .read()
            .await
            .iter()
            .map(|(k, w)| (k.clone(), Arc::clone(w)))
            .collect();

        let mut snapshot = HealthSnapshot::new();
        for (key, window) in windows {
            let summary = window.lock().await.summarize(&self.config);
            snapshot.insert(key, summary);
        }
        snapshot
    }
}
