//! Append-only trail of XA phase commands.
//!
//! Records are JSON Lines. [`FileTransactionLog`] hands them to a blocking
//! writer task through a bounded channel. A record that finds the queue full
//! is appended directly instead, so nothing is ever dropped.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHANNEL_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// A phase command was issued
    Phase,
    /// The outcome on some participant is unknown and needs manual repair
    Mend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XaLogRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub xid: String,
    pub command: String,
    /// `addr@thread_id` of every participant the command went to
    pub participants: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl XaLogRecord {
    pub fn phase(xid: &str, command: impl Into<String>, participants: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: RecordKind::Phase,
            xid: xid.to_string(),
            command: command.into(),
            participants,
            reason: None,
        }
    }

    pub fn mend(xid: &str, command: impl Into<String>, participants: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: RecordKind::Mend,
            xid: xid.to_string(),
            command: command.into(),
            participants,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum XaLogError {
    #[error("Failed to open transaction log: {0}")]
    Open(#[from] io::Error),

    #[error("Failed to write transaction log: {0}")]
    Write(io::Error),

    #[error("Transaction log writer has stopped")]
    Closed,
}

/// Write-only sink for XA records
pub trait TransactionLog: Send + Sync {
    fn append(&self, record: XaLogRecord) -> Result<(), XaLogError>;
}

enum LogMessage {
    Record(Box<XaLogRecord>),
    Shutdown,
}

/// JSON Lines file written by a background task
pub struct FileTransactionLog {
    path: PathBuf,
    tx: mpsc::Sender<LogMessage>,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Direct append handle used while the queue is full
    overflow: Mutex<File>,
}

impl FileTransactionLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, XaLogError> {
        Self::with_capacity(path, CHANNEL_BUFFER_SIZE)
    }

    pub fn with_capacity(path: impl AsRef<Path>, capacity: usize) -> Result<Self, XaLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let open = || OpenOptions::new().create(true).append(true).open(&path);
        let file = open()?;
        let overflow = open()?;
        info!(path = %path.display(), "Transaction log opened");

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::task::spawn_blocking(move || run_writer(rx, BufWriter::new(file)));
        Ok(Self {
            path,
            tx,
            writer: Mutex::new(Some(handle)),
            overflow: Mutex::new(overflow),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain queued records and stop the writer
    pub async fn shutdown(&self) {
        let _ = self.tx.send(LogMessage::Shutdown).await;
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl TransactionLog for FileTransactionLog {
    fn append(&self, record: XaLogRecord) -> Result<(), XaLogError> {
        match self.tx.try_send(LogMessage::Record(Box::new(record))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(XaLogError::Closed),
            Err(mpsc::error::TrySendError::Full(LogMessage::Record(record))) => {
                warn!(xid = %record.xid, "Transaction log queue full, appending directly");
                let mut line = serde_json::to_vec(&*record).map_err(|e| XaLogError::Write(io::Error::other(e)))?;
                line.push(b'\n');
                // one write per line keeps concurrent appends whole
                self.overflow.lock().write_all(&line).map_err(XaLogError::Write)
            }
            Err(mpsc::error::TrySendError::Full(LogMessage::Shutdown)) => Err(XaLogError::Closed),
        }
    }
}

fn run_writer(mut rx: mpsc::Receiver<LogMessage>, mut out: BufWriter<File>) {
    let mut written: u64 = 0;
    while let Some(message) = rx.blocking_recv() {
        match message {
            LogMessage::Record(record) => {
                if let Err(e) = write_record(&mut out, &record) {
                    warn!(xid = %record.xid, error = %e, "Failed to write transaction log record");
                    continue;
                }
                written += 1;
                if let Err(e) = out.flush() {
                    warn!(error = %e, "Failed to flush transaction log");
                }
            }
            LogMessage::Shutdown => break,
        }
    }
    let _ = out.flush();
    debug!(records = written, "Transaction log writer stopped");
}

fn write_record(out: &mut impl Write, record: &XaLogRecord) -> io::Result<()> {
    let json = serde_json::to_string(record).map_err(io::Error::other)?;
    writeln!(out, "{}", json)
}

/// Sink for a proxy that never opens distributed transactions
pub struct NullTransactionLog;

impl TransactionLog for NullTransactionLog {
    fn append(&self, record: XaLogRecord) -> Result<(), XaLogError> {
        debug!(xid = %record.xid, "Transaction log disabled, record discarded");
        Ok(())
    }
}

/// In-memory log
#[cfg(test)]
#[derive(Default)]
pub struct MemoryTransactionLog {
    records: Mutex<Vec<XaLogRecord>>,
}

#[cfg(test)]
impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<XaLogRecord> {
        self.records.lock().clone()
    }
}

#[cfg(test)]
impl TransactionLog for MemoryTransactionLog {
    fn append(&self, record: XaLogRecord) -> Result<(), XaLogError> {
        self.records.lock().push(record);
        Ok(())
    }
}
