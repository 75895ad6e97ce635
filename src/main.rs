//! sramlink station daemon and command-line client
//!
//! ```text
//! sramlink start [config.toml]
//! sramlink send <command> [key=value ...] [--config config.toml] [--reader name]
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
//! I/O.

use sramlink::bus::{publish_command, CommandRecord};
use sramlink::config::Config;
use sramlink::error::Error;
use sramlink::station::Station;
use std::env;
use std::process::ExitCode;

const DEFAULT_CONFIG: &str = "/etc/sramlink.toml";

const EXIT_CONFIG: u8 = 1;
const EXIT_IO: u8 = 2;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("start") => start(&args[1..]),
        Some("send") => send(&args[1..]),
        _ => {
            eprintln!("Usage: sramlink start [config.toml]");
            eprintln!("       sramlink send <command> [key=value ...] [--config config.toml] [--reader name]");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn start(args: &[String]) -> ExitCode {
    let config_path = args
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    log::info!("sramlink v{} starting", env!("CARGO_PKG_VERSION"));
    log::info!("Using config: {}", config_path);

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let mut station = match Station::new(config) {
        Ok(station) => station,
        Err(e @ Error::Config(_)) => {
            log::error!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            log::error!("Failed to initialize station: {}", e);
            return ExitCode::from(EXIT_IO);
        }
    };

    match station.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Station failed: {}", e);
            ExitCode::from(EXIT_IO)
        }
    }
}

fn send(args: &[String]) -> ExitCode {
    let mut config_path = DEFAULT_CONFIG.to_string();
    let mut reader_name: Option<String> = None;
    let mut command: Option<String> = None;
    let mut fields: Vec<(String, serde_json::Value)> = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => match iter.next() {
                Some(path) => config_path = path.clone(),
                None => {
                    eprintln!("--config needs a path");
                    return ExitCode::from(EXIT_CONFIG);
                }
            },
            "--reader" => match iter.next() {
                Some(name) => reader_name = Some(name.clone()),
                None => {
                    eprintln!("--reader needs a name");
                    return ExitCode::from(EXIT_CONFIG);
                }
            },
            _ if command.is_none() => command = Some(arg.clone()),
            _ => match arg.split_once('=') {
                // Values parse as JSON where possible, so offsets stay
                // numbers and data stays a list; anything else is a
                // plain string.
                Some((key, value)) => {
                    let value = serde_json::from_str(value)
                        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
                    fields.push((key.to_string(), value));
                }
                None => {
                    eprintln!("Arguments must look like key=value, got {}", arg);
                    return ExitCode::from(EXIT_CONFIG);
                }
            },
        }
    }

    let Some(command) = command else {
        eprintln!("send needs a command name");
        return ExitCode::from(EXIT_CONFIG);
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let reader = match &reader_name {
        Some(name) => match config.readers.iter().find(|r| &r.name == name) {
            Some(reader) => reader,
            None => {
                log::error!("No reader named {} in config", name);
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => &config.readers[0],
    };

    let mut record = CommandRecord::new();
    record.insert(
        "command".to_string(),
        serde_json::Value::String(command.clone()),
    );
    for (key, value) in fields {
        record.insert(key, value);
    }

    match publish_command(&config.bus.command_address, &reader.topic, &record) {
        Ok(()) => {
            log::info!("Published {} on {}", command, reader.topic);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Failed to publish command: {}", e);
            ExitCode::from(EXIT_IO)
        }
    }
}
