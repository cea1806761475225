//! Replication timings and hardware samples of one node lifetime.

use crate::constants::SAMPLE_INTERVAL;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub ts: DateTime<Utc>,
    pub membytes: u64,
    pub cpupercent: f64,
}

/// How a replicated entry was accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationTiming {
    /// Written before this node started: part of the bootstrap backlog.
    Backlog,
    /// Written after startup: a steady-state replication lag sample.
    NewContribution,
}

#[derive(Debug, Clone)]
pub struct Benchmark {
    startup: DateTime<Utc>,
    bootstrap_latency: Duration,
    new_contribution_latencies: Vec<Duration>,
    region: String,
    samples: Vec<Sample>,
}

impl Benchmark {
    pub fn new(startup: DateTime<Utc>, region: impl Into<String>) -> Self {
        Self {
            startup,
            bootstrap_latency: Duration::ZERO,
            new_contribution_latencies: Vec::new(),
            region: region.into(),
            samples: Vec::new(),
        }
    }

    pub fn startup(&self) -> DateTime<Utc> {
        self.startup
    }

    pub fn bootstrap_latency(&self) -> Duration {
        self.bootstrap_latency
    }

    pub fn new_contribution_latencies(&self) -> &[Duration] {
        &self.new_contribution_latencies
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Account for an entry created at `created_at` that replicated at `now`.
    ///
    /// Backlog entries overwrite the bootstrap latency with the time elapsed
    /// since startup; later entries append their replication lag.
    pub fn record_replicated(
        &mut self,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ReplicationTiming {
        if created_at <= self.startup {
            self.bootstrap_latency = elapsed(self.startup, now);
            ReplicationTiming::Backlog
        } else {
            self.new_contribution_latencies
                .push(elapsed(created_at, now));
            ReplicationTiming::NewContribution
        }
    }

    pub fn push_sample(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn report(&self) -> BenchmarkReport {
        let seconds: Vec<f64> = self
            .new_contribution_latencies
            .iter()
            .map(Duration::as_secs_f64)
            .collect();

        let (minc, maxc, averagec) = if seconds.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let min = seconds.iter().copied().fold(f64::INFINITY, f64::min);
            let max = seconds.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let sum: f64 = seconds.iter().sum();
            (min, max, sum / seconds.len() as f64)
        };

        BenchmarkReport {
            bootstrap: self.bootstrap_latency.as_secs_f64(),
            averagec,
            minc,
            maxc,
            region: self.region.clone(),
            samples: self.samples.clone(),
        }
    }

    /// Write the serialized snapshot to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Benchmark written to {}", path.display());
        Ok(())
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

impl Serialize for Benchmark {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.report().serialize(serializer)
    }
}

/// Serialized form of a [`Benchmark`]; durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub bootstrap: f64,
    pub averagec: f64,
    pub minc: f64,
    pub maxc: f64,
    pub region: String,
    pub samples: Vec<Sample>,
}

/// Reads process memory and global CPU usage.
struct HardwareProbe {
    system: System,
    pid: Option<Pid>,
}

impl HardwareProbe {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(error) => {
                tracing::warn!("Cannot resolve own pid, memory samples will be zero: {}", error);
                None
            }
        };
        Self { system, pid }
    }

    fn sample(&mut self) -> Sample {
        self.system.refresh_cpu();
        let cpupercent = self.system.global_cpu_info().cpu_usage() as f64;

        let membytes = match self.pid {
            Some(pid) => {
                self.system.refresh_process(pid);
                self.system.process(pid).map(|process| process.memory()).unwrap_or(0)
            }
            None => 0,
        };

        Sample {
            ts: Utc::now(),
            membytes,
            cpupercent,
        }
    }
}

/// Append a hardware sample every [`SAMPLE_INTERVAL`] until `shutdown` fires.
pub fn spawn_sampler(
    benchmark: Arc<Mutex<Benchmark>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut probe = HardwareProbe::new();
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let sample = probe.sample();
                    match benchmark.lock() {
                        Ok(mut benchmark) => benchmark.push_sample(sample),
                        Err(_) => tracing::warn!("Benchmark lock poisoned, dropping sample"),
                    }
                }
            }
        }

        tracing::debug!("Hardware sampler stopped");
    })
}
