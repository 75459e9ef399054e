//! Append-only run event log.
//!
//! Events are stored as newline-delimited JSON (JSONL) under
//! `<run_root>/logs/events.jsonl`, one object per line, flushed per append.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::paths::LOGS_DIR;
use crate::domain::{Event, EventType};

/// File name of the event log inside the logs directory
pub const EVENTS_FILE: &str = "events.jsonl";

/// JSONL event log for one run
#[derive(Debug, Clone)]
pub struct RunLog {
    events_path: PathBuf,
}

impl RunLog {
    /// Open the log of the run rooted at `run_root`
    pub fn for_run(run_root: &Path) -> Self {
        Self {
            events_path: run_root.join(LOGS_DIR).join(EVENTS_FILE),
        }
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        if let Some(parent) = self.events_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!("Failed to open events file: {}", self.events_path.display())
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !fs::try_exists(&self.events_path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path).await.with_context(|| {
            format!("Failed to open events file: {}", self.events_path.display())
        })?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Events concerning one step, in order
    pub async fn step_events(&self, step_id: &str) -> Result<Vec<Event>> {
        let events = self.replay().await?;
        Ok(events
            .into_iter()
            .filter(|e| e.step_id.as_deref() == Some(step_id))
            .collect())
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }
}
