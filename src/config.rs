//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [station]
//! name = "lab-station"
//!
//! [bus]
//! command_address = "0.0.0.0:5600"
//! event_address = "0.0.0.0:5601"
//!
//! [store]
//! path = "samples.jsonl"
//!
//! [[reader]]
//! name = "nucleo-a"
//! board_kind = "nucleo"
//! port = "/dev/ttyUSB0"
//! baud_rate = 350000
//! receive_timeout_ms = 500
//! topic = "commands/nucleo-a"
//!
//! [[logbook.output]]
//! kind = "stream"
//! min_level = "DEBUG"
//!
//! [[logbook.output]]
//! kind = "rotating_file"
//! path = "events.log"
//! max_bytes = 1048576
//! backup_count = 5
//!
//! [[logbook.output]]
//! kind = "chat"
//! endpoint = "https://api.telegram.org/botTOKEN/sendMessage"
//! token = "TOKEN"
//! chat_ids = ["42"]
//! min_level = "ERROR"
//! ```
//!
//! One dispatcher thread runs per `[[reader]]` entry; each subscribes
//! its own command topic on the shared bus socket. A malformed file is
//! fatal at startup.

use crate::error::{Error, Result};
use crate::logbook::{Level, RotationWhen};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub station: StationConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
    #[serde(rename = "reader", default)]
    pub readers: Vec<ReaderConfig>,
    #[serde(default)]
    pub logbook: LogbookConfig,
}

#[derive(Debug, Deserialize)]
pub struct StationConfig {
    /// Name used as the source prefix of every emitted event.
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct BusConfig {
    /// Socket the command subscription listens on.
    pub command_address: String,
    /// Socket event records are broadcast from.
    pub event_address: String,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// Append-only sample file.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    /// Unique name; becomes part of the event source and default topic.
    pub name: String,
    /// Board family on this chain.
    pub board_kind: String,
    /// Serial port path.
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Command topic this reader's dispatcher subscribes to.
    pub topic: String,
}

fn default_baud_rate() -> u32 {
    350_000
}

fn default_receive_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Default, Deserialize)]
pub struct LogbookConfig {
    #[serde(rename = "output", default)]
    pub outputs: Vec<OutputConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputConfig {
    Bus {
        #[serde(default)]
        min_level: Level,
        max_level: Option<Level>,
    },
    Stream {
        #[serde(default)]
        min_level: Level,
        max_level: Option<Level>,
    },
    RotatingFile {
        path: PathBuf,
        max_bytes: u64,
        backup_count: u32,
        #[serde(default)]
        min_level: Level,
        max_level: Option<Level>,
    },
    TimedRotatingFile {
        path: PathBuf,
        when: RotationWhen,
        backup_count: u32,
        #[serde(default)]
        min_level: Level,
        max_level: Option<Level>,
    },
    Mail {
        endpoint: String,
        token: String,
        recipients: Vec<String>,
        subject: String,
        #[serde(default)]
        min_level: Level,
        max_level: Option<Level>,
    },
    Chat {
        endpoint: String,
        token: String,
        chat_ids: Vec<String>,
        #[serde(default)]
        min_level: Level,
        max_level: Option<Level>,
    },
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.station.name.is_empty() {
            return Err(Error::Config("station.name must not be empty".to_string()));
        }
        if self.readers.is_empty() {
            return Err(Error::Config(
                "at least one [[reader]] must be configured".to_string(),
            ));
        }
        for reader in &self.readers {
            if reader.baud_rate == 0 {
                return Err(Error::Config(format!(
                    "reader {} has a zero baud_rate",
                    reader.name
                )));
            }
            if reader.receive_timeout_ms == 0 {
                return Err(Error::Config(format!(
                    "reader {} has a zero receive_timeout_ms",
                    reader.name
                )));
            }
        }
        for (i, a) in self.readers.iter().enumerate() {
            for b in &self.readers[i + 1..] {
                if a.name == b.name {
                    return Err(Error::Config(format!("duplicate reader name {}", a.name)));
                }
                if a.port == b.port {
                    return Err(Error::Config(format!(
                        "readers {} and {} share port {}",
                        a.name, b.name, a.port
                    )));
                }
                if a.topic == b.topic {
                    return Err(Error::Config(format!(
                        "readers {} and {} share topic {}",
                        a.name, b.name, a.topic
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [station]
        name = "lab"

        [bus]
        command_address = "127.0.0.1:5600"
        event_address = "127.0.0.1:5601"

        [store]
        path = "samples.jsonl"

        [[reader]]
        name = "nucleo-a"
        board_kind = "nucleo"
        port = "/dev/ttyUSB0"
        topic = "commands/nucleo-a"
    "#;

    fn parse(text: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_with_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.station.name, "lab");
        assert_eq!(config.readers.len(), 1);
        assert_eq!(config.readers[0].baud_rate, 350_000);
        assert_eq!(config.readers[0].receive_timeout_ms, 500);
        assert!(config.logbook.outputs.is_empty());
    }

    #[test]
    fn test_logbook_outputs_parse() {
        let text = format!(
            "{}\n{}",
            MINIMAL,
            r#"
            [[logbook.output]]
            kind = "stream"
            min_level = "DEBUG"

            [[logbook.output]]
            kind = "rotating_file"
            path = "events.log"
            max_bytes = 1024
            backup_count = 3
            min_level = "WARNING"
            max_level = "ERROR"

            [[logbook.output]]
            kind = "timed_rotating_file"
            path = "daily.log"
            when = "daily"
            backup_count = 7
            "#
        );
        let config = parse(&text).unwrap();
        assert_eq!(config.logbook.outputs.len(), 3);
        assert!(matches!(
            config.logbook.outputs[1],
            OutputConfig::RotatingFile {
                max_bytes: 1024,
                backup_count: 3,
                min_level: Level::Warning,
                max_level: Some(Level::Error),
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_reader_port_rejected() {
        let text = format!(
            "{}\n{}",
            MINIMAL,
            r#"
            [[reader]]
            name = "nucleo-b"
            board_kind = "nucleo"
            port = "/dev/ttyUSB0"
            topic = "commands/nucleo-b"
            "#
        );
        assert!(matches!(parse(&text), Err(Error::Config(_))));
    }

    #[test]
    fn test_no_readers_rejected() {
        let text = r#"
            [station]
            name = "lab"
            [bus]
            command_address = "a"
            event_address = "b"
            [store]
            path = "s.jsonl"
        "#;
        assert!(matches!(parse(text), Err(Error::Config(_))));
    }
}
