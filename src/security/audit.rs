use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::sandbox::SandboxId;

/// Structured lifecycle events handed to the audit collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    SandboxCreated {
        sandbox_id: SandboxId,
        name: String,
        memory_mb: u64,
        cpu_cores: u32,
    },
    SandboxCreationFailed {
        sandbox_id: SandboxId,
        name: String,
        reason: String,
    },
    SandboxStopped {
        sandbox_id: SandboxId,
    },
    SandboxShutdownFailed {
        sandbox_id: SandboxId,
        reason: String,
        forced: bool,
    },
    CommandExecuted {
        sandbox_id: SandboxId,
        command: String,
        exit_code: i32,
        duration_ms: u64,
        timed_out: bool,
    },
    CommandRejected {
        sandbox_id: SandboxId,
        command: String,
        reason: String,
    },
    StartupCommandFailed {
        sandbox_id: SandboxId,
        command: String,
        reason: String,
    },
    MonitorError {
        sandbox_id: SandboxId,
        error: String,
    },
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// Fire-and-forget sink for audit events.
///
/// Implementations must never fail the caller: a broken sink degrades to a
/// warning in the log.
pub trait AuditLogger: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// `tracing` target of [`TracingAuditLogger`] events.
pub const AUDIT_TARGET: &str = "wsb::audit";

/// Emits audit events through `tracing` under the [`AUDIT_TARGET`] target.
#[derive(Debug, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: AUDIT_TARGET, event = %json, "audit"),
            Err(e) => warn!(target: AUDIT_TARGET, error = %e, "Failed to serialize audit event"),
        }
    }
}

/// Appends one JSON object per line to a file.
///
/// `record` only queues the line; a dedicated writer thread does the file
/// I/O, so callers on async worker threads never block on disk. Queued lines
/// are written out by [`close`](Self::close) or on drop.
#[derive(Debug)]
pub struct JsonlAuditLogger {
    path: PathBuf,
    lines: Mutex<Option<mpsc::Sender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl JsonlAuditLogger {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let (lines, queued) = mpsc::channel();
        let writer_path = path.to_path_buf();
        let writer = thread::Builder::new()
            .name("wsb-audit".to_string())
            .spawn(move || write_lines(&writer_path, file, queued))?;

        Ok(Self {
            path: path.to_path_buf(),
            lines: Mutex::new(Some(lines)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Write out everything queued so far and stop the writer. Later records
    /// are dropped with a warning.
    pub fn close(&self) {
        drop(self.lines.lock().unwrap_or_else(PoisonError::into_inner).take());
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            if writer.join().is_err() {
                warn!(path = %self.path.display(), "Audit log writer panicked");
            }
        }
    }
}

impl Drop for JsonlAuditLogger {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_lines(path: &Path, file: File, queued: mpsc::Receiver<String>) {
    let mut out = BufWriter::new(file);
    while let Ok(line) = queued.recv() {
        let mut written = writeln!(out, "{}", line);
        for line in queued.try_iter() {
            written = written.and_then(|_| writeln!(out, "{}", line));
        }
        if let Err(e) = written.and_then(|_| out.flush()) {
            warn!(path = %path.display(), error = %e, "Failed to write audit log");
        }
    }
}

impl AuditLogger for JsonlAuditLogger {
    fn record(&self, event: AuditEvent) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            event: &event,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize audit event");
                return;
            }
        };

        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let queued = lines.as_ref().map(|lines| lines.send(line).is_ok());
        if queued != Some(true) {
            warn!(path = %self.path.display(), "Audit log is closed, event dropped");
        }
    }
}
