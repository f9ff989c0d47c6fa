use crate::events::{EventLog, ExecutionEvent};
use crate::types::ExecutionId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::RwLock;

const FLUSH_THRESHOLD: usize = 100;

/// Event log implementation using gzip-compressed JSONL, partitioned by day:
/// `events/YYYY/MM/DD/<execution_id>.jsonl.gz`.
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Buffer of not-yet-flushed events across executions.
    buffer: RwLock<Vec<ExecutionEvent>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(Vec::new()),
        })
    }

    fn log_path(&self, execution_id: &ExecutionId, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", execution_id))
    }

    /// Flush buffered events belonging to one execution; events of other
    /// executions stay buffered.
    async fn flush(&self, execution_id: &ExecutionId) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        let mut flushing = Vec::new();
        buffer.retain(|event| {
            if event.execution_id == *execution_id {
                flushing.push(event.clone());
                false
            } else {
                true
            }
        });
        drop(buffer);

        if flushing.is_empty() {
            return Ok(());
        }

        // Group by day, since an execution can cross midnight.
        let mut by_date: std::collections::HashMap<(i32, u32, u32), Vec<ExecutionEvent>> =
            std::collections::HashMap::new();
        for event in flushing {
            let key = (
                event.timestamp.year(),
                event.timestamp.month(),
                event.timestamp.day(),
            );
            by_date.entry(key).or_default().push(event);
        }

        for (_, events) in by_date {
            let path = self.log_path(execution_id, &events[0].timestamp);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);
            write_jsonl_gz(&path, &all_events)?;
        }

        Ok(())
    }

    /// Find every log file written for an execution.
    fn log_files(&self, execution_id: &ExecutionId) -> Vec<PathBuf> {
        let events_dir = self.base_path.join("events");
        let filename = format!("{}.jsonl.gz", execution_id);
        walkdir::WalkDir::new(events_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.file_name().to_string_lossy() == filename)
            .map(|entry| entry.into_path())
            .collect()
    }
}

fn read_jsonl_gz(path: &PathBuf) -> Result<Vec<ExecutionEvent>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let decoder = GzDecoder::new(file);
    let reader = std::io::BufReader::new(decoder);

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        let event: ExecutionEvent =
            serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }
    Ok(events)
}

fn write_jsonl_gz(path: &PathBuf, events: &[ExecutionEvent]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }
    let compressed = encoder.finish().context("Failed to finish compression")?;
    std::fs::write(path, compressed).context("Failed to write event log file")?;
    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: ExecutionEvent) -> Result<()> {
        let execution_id = event.execution_id;
        let mut buffer = self.buffer.write().await;
        buffer.push(event);
        let should_flush = buffer.len() > FLUSH_THRESHOLD;
        drop(buffer);

        if should_flush {
            self.flush(&execution_id).await?;
        }
        Ok(())
    }

    async fn execution_events(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionEvent>> {
        self.flush(&execution_id).await?;

        let mut all_events = Vec::new();
        for file in self.log_files(&execution_id) {
            all_events.extend(read_jsonl_gz(&file)?);
        }
        all_events.sort_by_key(|e| e.timestamp);
        Ok(all_events)
    }
}

/// In-memory event log for tests and embedders that do not persist events.
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: ExecutionEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn execution_events(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionEvent>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }
}
