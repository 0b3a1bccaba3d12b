//! Per-sandbox resource sampling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, WsbError};
use crate::sandbox::SandboxId;
use crate::security::{AuditEvent, AuditLogger};

/// Deepest parent chain followed when attributing a process to a session.
const MAX_ANCESTRY_DEPTH: usize = 32;

/// Latest resource usage of one sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceStats {
    pub memory_mb: u64,
    /// Summed across attributed processes, so it can exceed 100 on multi-core hosts
    pub cpu_percent: f64,
    /// Virtual memory of the attributed processes. A rough stand-in for guest
    /// disk usage until a real signal is available.
    pub disk_mb: u64,
    pub process_count: usize,
    /// `None` until the first sample completes
    pub sampled_at: Option<DateTime<Utc>>,
}

impl ResourceStats {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Produces one resource sample per call.
#[async_trait]
pub trait ResourceSampler: Send {
    async fn sample(&mut self) -> Result<ResourceStats>;
}

/// The fields of a host process the sampler cares about.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub memory_bytes: u64,
    pub virtual_bytes: u64,
    pub cpu_percent: f32,
}

/// Sum the processes that belong to a session: the root process, any of its
/// descendants, and anything whose name is in `names` (compared
/// case-insensitively, with or without `.exe`).
pub fn aggregate(processes: &[ProcessInfo], root_pid: Option<u32>, names: &[String]) -> ResourceStats {
    let by_pid: HashMap<u32, &ProcessInfo> = processes.iter().map(|p| (p.pid, p)).collect();
    let names: Vec<String> = names.iter().map(|n| normalize_name(n)).collect();

    let descends_from_root =
        |process: &ProcessInfo| root_pid.is_some_and(|root| descends_from(process, root, &by_pid));

    let mut stats = ResourceStats {
        sampled_at: Some(Utc::now()),
        ..ResourceStats::zero()
    };
    let mut memory_bytes = 0u64;
    let mut virtual_bytes = 0u64;

    for process in processes {
        let attributed =
            names.contains(&normalize_name(&process.name)) || descends_from_root(process);
        if !attributed {
            continue;
        }
        memory_bytes += process.memory_bytes;
        virtual_bytes += process.virtual_bytes;
        stats.cpu_percent += f64::from(process.cpu_percent);
        stats.process_count += 1;
    }

    stats.memory_mb = memory_bytes / (1024 * 1024);
    stats.disk_mb = virtual_bytes / (1024 * 1024);
    stats
}

/// Whether `process` is `root` or one of its descendants in `by_pid`.
pub(crate) fn descends_from(
    process: &ProcessInfo,
    root: u32,
    by_pid: &HashMap<u32, &ProcessInfo>,
) -> bool {
    let mut current = Some(process);
    for _ in 0..MAX_ANCESTRY_DEPTH {
        match current {
            Some(p) if p.pid == root => return true,
            Some(p) => current = p.parent.and_then(|parent| by_pid.get(&parent).copied()),
            None => return false,
        }
    }
    false
}

/// The processes of a freshly refreshed `System`.
pub(crate) fn snapshot(system: &System) -> Vec<ProcessInfo> {
    system
        .processes()
        .values()
        .map(|p| ProcessInfo {
            pid: p.pid().as_u32(),
            parent: p.parent().map(|pid| pid.as_u32()),
            name: p.name().to_string_lossy().into_owned(),
            memory_bytes: p.memory(),
            virtual_bytes: p.virtual_memory(),
            cpu_percent: p.cpu_usage(),
        })
        .collect()
}

fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Samples host processes with `sysinfo`.
///
/// The `System` is kept between samples because CPU usage is computed from
/// the delta of two refreshes; the first sample reports 0% CPU.
pub struct ProcessSampler {
    system: Arc<Mutex<System>>,
    root_pid: Option<u32>,
    names: Vec<String>,
}

impl ProcessSampler {
    pub fn new(root_pid: Option<u32>, names: Vec<String>) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            root_pid,
            names,
        }
    }
}

#[async_trait]
impl ResourceSampler for ProcessSampler {
    async fn sample(&mut self) -> Result<ResourceStats> {
        let system = self.system.clone();
        let root_pid = self.root_pid;
        let names = self.names.clone();

        tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_processes(ProcessesToUpdate::All, true);
            aggregate(&snapshot(&system), root_pid, &names)
        })
        .await
        .map_err(|e| WsbError::Other(anyhow::anyhow!("Resource sampling task failed: {}", e)))
    }
}

struct MonitorTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct MonitorSlot {
    task: Option<MonitorTask>,
    closed: bool,
}

/// Background sampling loop with a non-blocking snapshot.
///
/// `stop()` is final: once called, later `start()` calls are ignored, so a
/// sandbox being torn down never gets a fresh loop.
pub struct ResourceMonitor {
    sandbox_id: SandboxId,
    interval: Duration,
    latest: Arc<watch::Sender<ResourceStats>>,
    audit: Arc<dyn AuditLogger>,
    slot: Mutex<MonitorSlot>,
}

impl ResourceMonitor {
    pub fn new(sandbox_id: SandboxId, interval: Duration, audit: Arc<dyn AuditLogger>) -> Self {
        let (latest, _) = watch::channel(ResourceStats::zero());
        Self {
            sandbox_id,
            interval,
            latest: Arc::new(latest),
            audit,
            slot: Mutex::new(MonitorSlot::default()),
        }
    }

    /// Begin sampling. Returns false if already running or stopped.
    pub fn start(&self, sampler: Box<dyn ResourceSampler>) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.closed || slot.task.is_some() {
            return false;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sample_loop(
            self.sandbox_id,
            self.interval,
            sampler,
            self.latest.clone(),
            self.audit.clone(),
            stop_rx,
        ));
        slot.task = Some(MonitorTask { stop, handle });

        debug!(sandbox_id = %self.sandbox_id, interval_ms = self.interval.as_millis() as u64, "Resource monitor started");
        true
    }

    /// Stop sampling and wait for the loop to exit.
    pub async fn stop(&self) {
        let task = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            slot.closed = true;
            slot.task.take()
        };

        if let Some(task) = task {
            task.stop.send_replace(true);
            if let Err(e) = task.handle.await {
                warn!(sandbox_id = %self.sandbox_id, error = %e, "Resource monitor ended abnormally");
            }
            debug!(sandbox_id = %self.sandbox_id, "Resource monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .task
            .is_some()
    }

    /// The most recent sample, or [`ResourceStats::zero`] before the first one.
    pub fn get_stats(&self) -> ResourceStats {
        self.latest.borrow().clone()
    }
}

async fn sample_loop(
    sandbox_id: SandboxId,
    interval: Duration,
    mut sampler: Box<dyn ResourceSampler>,
    latest: Arc<watch::Sender<ResourceStats>>,
    audit: Arc<dyn AuditLogger>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            result = sampler.sample() => match result {
                Ok(stats) => {
                    latest.send_replace(stats);
                }
                Err(e) => {
                    warn!(sandbox_id = %sandbox_id, error = %e, "Resource sampling failed");
                    audit.record(AuditEvent::MonitorError {
                        sandbox_id,
                        error: e.to_string(),
                    });
                }
            },
        }

        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
