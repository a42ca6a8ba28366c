// ARCHITECTURE: Audit Logger - Append-Only Event Trail
//
// WRITE-BEHIND DESIGN:
// - Callers enqueue on a bounded channel; a full channel waits at most
//   `enqueue_timeout` and then fails, so request latency stays bounded
// - One writer task owns the sequence counter, the optional JSON-lines file
//   and an in-memory tail; events are numbered in receive order
// - A caller's events are enqueued in program order and the channel is FIFO,
//   so each client's events keep their chronological order
//
// `flush` rides the same channel, so when it returns every event recorded
// before it has been written.

use std::{
    collections::{BTreeMap, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::{mpsc, oneshot, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    AuthSuccess,
    AuthFailure,
    RateLimited,
    ValidationRejected,
    InferenceTimeout,
    InferenceFallback,
    InferenceSuccess,
    ResourceExhausted,
    InternalError,
}

// RECORD: AuditEvent - One persisted entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub kind: AuditEventKind,
    pub metadata: BTreeMap<String, String>,
}

/// Event as submitted by a caller, before the writer numbers it.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub client_id: String,
    pub kind: AuditEventKind,
    pub metadata: BTreeMap<String, String>,
}

impl AuditRecord {
    pub fn new(client_id: impl Into<String>, kind: AuditEventKind) -> Self {
        Self {
            client_id: client_id.into(),
            kind,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit channel full for {0:?}")]
    Backpressure(Duration),

    #[error("audit writer is not running")]
    WriterStopped,
}

// CONFIGURATION: AuditConfig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub log_path: Option<PathBuf>,    // JSON-lines file (default: none, memory only)
    pub channel_capacity: usize,      // Pending events before backpressure (default: 1024)
    pub enqueue_timeout_ms: u64,      // Longest wait on a full channel (default: 100ms)
    pub recent_capacity: usize,       // Events kept for `recent` (default: 1000)
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            channel_capacity: 1024,
            enqueue_timeout_ms: 100,
            recent_capacity: 1000,
        }
    }
}

enum Command {
    Record(AuditRecord, DateTime<Utc>),
    Flush(oneshot::Sender<()>),
}

// CORE SYSTEM: AuditLogger
pub struct AuditLogger {
    config: AuditConfig,
    sender: mpsc::Sender<Command>,
    recent: Arc<RwLock<VecDeque<AuditEvent>>>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Spawns the writer task. Must be called inside a tokio runtime.
    pub async fn start(config: AuditConfig) -> anyhow::Result<Self> {
        let file = match &config.log_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path).await?;
                info!(path = %path.display(), "Audit log opened");
                Some(file)
            }
            None => None,
        };

        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let recent = Arc::new(RwLock::new(VecDeque::with_capacity(config.recent_capacity)));
        let writer = tokio::spawn(run_writer(receiver, file, recent.clone(), config.recent_capacity));

        Ok(Self {
            config,
            sender,
            recent,
            writer: std::sync::Mutex::new(Some(writer)),
        })
    }

    // CORE FUNCTION: Enqueue one event with a bounded wait
    pub async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let timeout = Duration::from_millis(self.config.enqueue_timeout_ms);
        self.sender
            .send_timeout(Command::Record(record, Utc::now()), timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => AuditError::Backpressure(timeout),
                mpsc::error::SendTimeoutError::Closed(_) => AuditError::WriterStopped,
            })
    }

    /// Waits until everything recorded before this call has been written.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (ack, done) = oneshot::channel();
        self.sender
            .send(Command::Flush(ack))
            .await
            .map_err(|_| AuditError::WriterStopped)?;
        done.await.map_err(|_| AuditError::WriterStopped)
    }

    /// Most recent events, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let recent = self.recent.read().await;
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    pub fn stop(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            if let Some(handle) = writer.take() {
                handle.abort();
                info!("Audit writer stopped");
            }
        }
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_writer(
    mut receiver: mpsc::Receiver<Command>,
    mut file: Option<tokio::fs::File>,
    recent: Arc<RwLock<VecDeque<AuditEvent>>>,
    recent_capacity: usize,
) {
    let mut seq: u64 = 0;

    while let Some(command) = receiver.recv().await {
        match command {
            Command::Record(record, timestamp) => {
                seq += 1;
                let event = AuditEvent {
                    seq,
                    timestamp,
                    client_id: record.client_id,
                    kind: record.kind,
                    metadata: record.metadata,
                };

                if let Some(out) = file.as_mut() {
                    if let Err(e) = append_line(out, &event).await {
                        error!(seq, error = %e, "Failed to append audit event");
                    }
                }

                debug!(seq, client_id = %event.client_id, kind = ?event.kind, "Audit event");

                let mut recent = recent.write().await;
                if recent_capacity > 0 {
                    if recent.len() == recent_capacity {
                        recent.pop_front();
                    }
                    recent.push_back(event);
                }
            }
            Command::Flush(ack) => {
                if let Some(out) = file.as_mut() {
                    if let Err(e) = out.flush().await {
                        error!(error = %e, "Failed to flush audit log");
                    }
                }
                let _ = ack.send(());
            }
        }
    }
}

async fn append_line(file: &mut tokio::fs::File, event: &AuditEvent) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    Ok(())
}
