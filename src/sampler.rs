use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::ingest::IngestQueue;

const ENABLE_LOGS: bool = true;

use crate::log_info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// CPU used by this process, in percent of one core.
    pub cpu_usage: f64,
    /// System memory in use, in percent.
    pub memory_usage: f64,
    pub battery_level: Option<u8>,
}

/// Samples this process's CPU and the machine's memory pressure.
pub struct PerformanceSampler {
    system: System,
    pid: Pid,
}

impl PerformanceSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // CPU usage is a delta between refreshes; take the baseline now.
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system.refresh_memory();

        Self { system, pid }
    }

    pub fn sample(&mut self) -> ResourceUsage {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]));
        self.system.refresh_memory();

        let cpu_usage = self
            .system
            .process(self.pid)
            .map(|process| f64::from(process.cpu_usage()))
            .unwrap_or(0.0);
        let total = self.system.total_memory();
        let memory_usage = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64 * 100.0
        };

        ResourceUsage {
            cpu_usage,
            memory_usage,
            // sysinfo has no battery source
            battery_level: None,
        }
    }
}

impl Default for PerformanceSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds a performance sample into `queue` every `period` until cancelled.
pub async fn sampling_loop(queue: IngestQueue, period: Duration, cancel_token: CancellationToken) {
    let mut sampler = PerformanceSampler::new();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let usage = sampler.sample();
                queue.log_performance(usage.cpu_usage, usage.memory_usage, usage.battery_level);
            }
            _ = cancel_token.cancelled() => {
                log_info!("performance sampler shutting down");
                break;
            }
        }
    }
}

pub fn spawn_sampler(
    queue: IngestQueue,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(sampling_loop(queue, period, cancel_token))
}
