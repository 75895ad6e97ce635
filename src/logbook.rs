//! Structured event logbook
//!
//! Platform events (discovery results, per-device failures, handler
//! responses) are product data, not process diagnostics: downstream
//! dashboards pattern-match on their fixed message templates. The
//! logbook fans each [`EventRecord`] out to every configured output;
//! one failing output is reported through `log::warn!` and never
//! blocks the others.
//!
//! Outputs and their thresholds: a record at `level` is emitted iff
//! `min_level <= level < max_level` (the upper bound is optional and
//! exclusive, so a terminal output can take everything below WARNING
//! while a chat bot takes only ERROR).

use crate::bus::EventPublisher;
use crate::error::Result;
use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Severity of an event record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One structured platform event.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub source_name: String,
    pub level: Level,
    pub message: String,
    /// Command-specific structured payload; `Null` when the event is a
    /// bare message.
    pub context: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(source_name: &str, level: Level, message: &str) -> Self {
        EventRecord {
            source_name: source_name.to_string(),
            level,
            message: message.to_string(),
            context: serde_json::Value::Null,
            emitted_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    fn render(&self) -> String {
        let context = if self.context.is_null() {
            String::new()
        } else {
            format!(" {}", self.context)
        };
        format!(
            "{} [{}] {}: {}{}",
            self.emitted_at.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.source_name,
            self.message,
            context
        )
    }
}

/// Rotation cadence for [`LogOutput::TimedRotatingFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationWhen {
    Hourly,
    Daily,
}

impl RotationWhen {
    fn period_key(&self, at: DateTime<Utc>) -> String {
        match self {
            RotationWhen::Hourly => format!("{}_{:02}", at.format("%Y-%m-%d"), at.hour()),
            RotationWhen::Daily => at.format("%Y-%m-%d").to_string(),
        }
    }
}

/// One logbook destination.
pub enum LogOutput {
    /// Republish on the station's event socket.
    Bus {
        min_level: Level,
        max_level: Option<Level>,
        publisher: Arc<EventPublisher>,
    },
    /// Plain lines on stdout.
    Stream {
        min_level: Level,
        max_level: Option<Level>,
    },
    /// Size-capped file with numbered backups.
    RotatingFile {
        min_level: Level,
        max_level: Option<Level>,
        path: PathBuf,
        max_bytes: u64,
        backup_count: u32,
    },
    /// File rotated at period boundaries.
    TimedRotatingFile {
        min_level: Level,
        max_level: Option<Level>,
        path: PathBuf,
        when: RotationWhen,
        backup_count: u32,
        current_period: Option<String>,
    },
    /// Transactional mail via an HTTP endpoint.
    Mail {
        min_level: Level,
        max_level: Option<Level>,
        endpoint: String,
        token: String,
        recipients: Vec<String>,
        subject: String,
        client: reqwest::blocking::Client,
    },
    /// Chat bot message via an HTTP endpoint.
    Chat {
        min_level: Level,
        max_level: Option<Level>,
        endpoint: String,
        token: String,
        chat_ids: Vec<String>,
        client: reqwest::blocking::Client,
    },
    /// Record capture for assertions.
    #[cfg(test)]
    Capture {
        min_level: Level,
        max_level: Option<Level>,
        records: Arc<Mutex<Vec<EventRecord>>>,
    },
}

impl LogOutput {
    fn thresholds(&self) -> (Level, Option<Level>) {
        match self {
            LogOutput::Bus {
                min_level,
                max_level,
                ..
            }
            | LogOutput::Stream {
                min_level,
                max_level,
            }
            | LogOutput::RotatingFile {
                min_level,
                max_level,
                ..
            }
            | LogOutput::TimedRotatingFile {
                min_level,
                max_level,
                ..
            }
            | LogOutput::Mail {
                min_level,
                max_level,
                ..
            }
            | LogOutput::Chat {
                min_level,
                max_level,
                ..
            } => (*min_level, *max_level),
            #[cfg(test)]
            LogOutput::Capture {
                min_level,
                max_level,
                ..
            } => (*min_level, *max_level),
        }
    }

    fn accepts(&self, level: Level) -> bool {
        let (min, max) = self.thresholds();
        level >= min && max.map_or(true, |m| level < m)
    }

    fn name(&self) -> &'static str {
        match self {
            LogOutput::Bus { .. } => "bus",
            LogOutput::Stream { .. } => "stream",
            LogOutput::RotatingFile { .. } => "rotating-file",
            LogOutput::TimedRotatingFile { .. } => "timed-rotating-file",
            LogOutput::Mail { .. } => "mail",
            LogOutput::Chat { .. } => "chat",
            #[cfg(test)]
            LogOutput::Capture { .. } => "capture",
        }
    }

    fn emit(&mut self, record: &EventRecord) -> Result<()> {
        match self {
            LogOutput::Bus { publisher, .. } => {
                publisher.publish_event(record);
                Ok(())
            }
            LogOutput::Stream { .. } => {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{}", record.render())?;
                Ok(())
            }
            LogOutput::RotatingFile {
                path,
                max_bytes,
                backup_count,
                ..
            } => {
                append_line(path, &record.render())?;
                let size = std::fs::metadata(&*path).map(|m| m.len()).unwrap_or(0);
                if size > *max_bytes {
                    rotate_numbered(path, *backup_count)?;
                }
                Ok(())
            }
            LogOutput::TimedRotatingFile {
                path,
                when,
                backup_count,
                current_period,
                ..
            } => {
                let period = when.period_key(record.emitted_at);
                match current_period {
                    Some(open) if *open != period => {
                        rotate_timed(path, open, *backup_count)?;
                        *current_period = Some(period);
                    }
                    None => *current_period = Some(period),
                    _ => {}
                }
                append_line(path, &record.render())
            }
            LogOutput::Mail {
                endpoint,
                token,
                recipients,
                subject,
                client,
                ..
            } => {
                client
                    .post(&*endpoint)
                    .bearer_auth(&*token)
                    .json(&serde_json::json!({
                        "to": recipients,
                        "subject": subject,
                        "text": record.render(),
                    }))
                    .send()?
                    .error_for_status()?;
                Ok(())
            }
            LogOutput::Chat {
                endpoint,
                token,
                chat_ids,
                client,
                ..
            } => {
                for chat_id in chat_ids.iter() {
                    client
                        .post(&*endpoint)
                        .bearer_auth(&*token)
                        .json(&serde_json::json!({
                            "chat_id": chat_id,
                            "text": record.render(),
                        }))
                        .send()?
                        .error_for_status()?;
                }
                Ok(())
            }
            #[cfg(test)]
            LogOutput::Capture { records, .. } => {
                records.lock().push(record.clone());
                Ok(())
            }
        }
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

fn rotate_numbered(path: &Path, backup_count: u32) -> Result<()> {
    if backup_count == 0 {
        File::create(path)?;
        return Ok(());
    }
    for i in (1..backup_count).rev() {
        let from = numbered(path, i);
        if from.exists() {
            std::fs::rename(&from, numbered(path, i + 1))?;
        }
    }
    if path.exists() {
        std::fs::rename(path, numbered(path, 1))?;
    }
    Ok(())
}

fn numbered(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

fn rotate_timed(path: &Path, period: &str, backup_count: u32) -> Result<()> {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", period));
    if path.exists() {
        std::fs::rename(path, PathBuf::from(name))?;
    }

    // Prune the oldest suffixed backups beyond the configured count.
    if let (Some(dir), Some(stem)) = (path.parent(), path.file_name()) {
        let prefix = format!("{}.", stem.to_string_lossy());
        let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        backups.sort();
        while backups.len() > backup_count as usize {
            let oldest = backups.remove(0);
            let _ = std::fs::remove_file(oldest);
        }
    }
    Ok(())
}

/// Fan-out sink for platform events. Concurrency-safe: dispatcher
/// threads share the output set behind an `Arc`, and each holds a view
/// with its own source name (see [`with_source`](Self::with_source)).
pub struct Logbook {
    source_name: String,
    outputs: Arc<Mutex<Vec<LogOutput>>>,
}

impl Logbook {
    pub fn new(source_name: &str, outputs: Vec<LogOutput>) -> Self {
        Logbook {
            source_name: source_name.to_string(),
            outputs: Arc::new(Mutex::new(outputs)),
        }
    }

    /// A view on the same outputs that stamps a different source name.
    pub fn with_source(&self, source_name: &str) -> Logbook {
        Logbook {
            source_name: source_name.to_string(),
            outputs: Arc::clone(&self.outputs),
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn emit_record(&self, record: EventRecord) {
        let mut outputs = self.outputs.lock();
        for output in outputs.iter_mut() {
            if !output.accepts(record.level) {
                continue;
            }
            if let Err(e) = output.emit(&record) {
                log::warn!("Logbook output {} failed: {}", output.name(), e);
            }
        }
    }

    pub fn emit(&self, level: Level, message: &str) {
        self.emit_record(EventRecord::new(&self.source_name, level, message));
    }

    pub fn emit_with_context(&self, level: Level, message: &str, context: serde_json::Value) {
        self.emit_record(
            EventRecord::new(&self.source_name, level, message).with_context(context),
        );
    }

    pub fn debug(&self, message: &str) {
        self.emit(Level::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.emit(Level::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.emit(Level::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.emit(Level::Error, message);
    }

    /// Logbook with a single capturing output, for assertions on
    /// emitted events.
    #[cfg(test)]
    pub fn capture(source_name: &str) -> (Self, Arc<Mutex<Vec<EventRecord>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let logbook = Logbook::new(
            source_name,
            vec![LogOutput::Capture {
                min_level: Level::Debug,
                max_level: None,
                records: Arc::clone(&records),
            }],
        );
        (logbook, records)
    }
}
