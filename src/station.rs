//! Station orchestration
//!
//! Wires the configured pieces together: one event publisher and one
//! command bus socket, a shared sample store, a shared logbook output
//! set, and one dispatcher thread per configured serial port. Shutdown
//! arrives via SIGINT/SIGTERM; in-flight handlers run to completion.

use crate::bus::{CommandBus, CommandSubscription, EventPublisher};
use crate::config::{Config, OutputConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::logbook::{Logbook, LogOutput};
use crate::reader::Stm32Reader;
use crate::store::{JsonlStore, SampleStore};
use crate::transport::SerialLink;
use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub struct Station {
    publisher: Arc<EventPublisher>,
    bus: CommandBus,
    dispatchers: Vec<(String, Dispatcher, CommandSubscription)>,
    shutdown: Arc<AtomicBool>,
}

impl Station {
    /// Initialize every component from the configuration. Serial ports
    /// are opened here so a miswired deployment fails before the first
    /// command arrives.
    pub fn new(config: Config) -> Result<Self> {
        log::info!("Initializing station {}", config.station.name);

        let shutdown = Arc::new(AtomicBool::new(false));

        let publisher = Arc::new(EventPublisher::bind(&config.bus.event_address)?);
        let bus = CommandBus::bind(&config.bus.command_address, Arc::clone(&shutdown))?;

        let store: Arc<Mutex<Box<dyn SampleStore>>> = Arc::new(Mutex::new(Box::new(
            JsonlStore::open(&config.store.path)?,
        )));

        let outputs = build_outputs(&config.logbook.outputs, &publisher)?;
        let logbook = Logbook::new(&config.station.name, outputs);

        let mut dispatchers = Vec::new();
        for reader_config in &config.readers {
            let link = SerialLink::open(&reader_config.port, reader_config.baud_rate)?;
            let reader = Stm32Reader::new(
                &reader_config.board_kind,
                link,
                Duration::from_millis(reader_config.receive_timeout_ms),
            );

            let source = format!("{}/{}", config.station.name, reader_config.name);
            let mut dispatcher = Dispatcher::new(
                &reader_config.name,
                Box::new(reader),
                Arc::new(logbook.with_source(&source)),
                Arc::clone(&store),
            );
            dispatcher.register_default_commands();

            let subscription = bus.subscribe(&reader_config.topic);
            dispatchers.push((reader_config.name.clone(), dispatcher, subscription));
        }

        log::info!("Station initialized with {} readers", dispatchers.len());

        Ok(Station {
            publisher,
            bus,
            dispatchers,
            shutdown,
        })
    }

    /// Run until a termination signal arrives.
    pub fn run(&mut self) -> Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let signal_shutdown = Arc::clone(&self.shutdown);
        thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    log::info!("Received signal {}, shutting down", signal);
                    signal_shutdown.store(true, Ordering::SeqCst);
                }
            })?;

        let shutdown = Arc::clone(&self.shutdown);
        let mut handles = Vec::new();
        for (name, mut dispatcher, subscription) in self.dispatchers.drain(..) {
            let thread_shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("dispatcher-{}", name))
                .spawn(move || dispatcher.run(&subscription, &thread_shutdown))?;
            handles.push(handle);
        }

        for handle in handles {
            if handle.join().is_err() {
                log::error!("A dispatcher thread panicked");
            }
        }

        self.publisher.stop();
        log::info!("Station stopped");
        Ok(())
    }

    pub fn command_address(&self) -> std::net::SocketAddr {
        self.bus.local_addr()
    }
}

/// Materialize the configured logbook outputs.
fn build_outputs(
    configs: &[OutputConfig],
    publisher: &Arc<EventPublisher>,
) -> Result<Vec<LogOutput>> {
    let http_client = || {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(Error::Http)
    };

    configs
        .iter()
        .map(|config| {
            Ok(match config {
                OutputConfig::Bus {
                    min_level,
                    max_level,
                } => LogOutput::Bus {
                    min_level: *min_level,
                    max_level: *max_level,
                    publisher: Arc::clone(publisher),
                },
                OutputConfig::Stream {
                    min_level,
                    max_level,
                } => LogOutput::Stream {
                    min_level: *min_level,
                    max_level: *max_level,
                },
                OutputConfig::RotatingFile {
                    path,
                    max_bytes,
                    backup_count,
                    min_level,
                    max_level,
                } => LogOutput::RotatingFile {
                    min_level: *min_level,
                    max_level: *max_level,
                    path: path.clone(),
                    max_bytes: *max_bytes,
                    backup_count: *backup_count,
                },
                OutputConfig::TimedRotatingFile {
                    path,
                    when,
                    backup_count,
                    min_level,
                    max_level,
                } => LogOutput::TimedRotatingFile {
                    min_level: *min_level,
                    max_level: *max_level,
                    path: path.clone(),
                    when: *when,
                    backup_count: *backup_count,
                    current_period: None,
                },
                OutputConfig::Mail {
                    endpoint,
                    token,
                    recipients,
                    subject,
                    min_level,
                    max_level,
                } => LogOutput::Mail {
                    min_level: *min_level,
                    max_level: *max_level,
                    endpoint: endpoint.clone(),
                    token: token.clone(),
                    recipients: recipients.clone(),
                    subject: subject.clone(),
                    client: http_client()?,
                },
                OutputConfig::Chat {
                    endpoint,
                    token,
                    chat_ids,
                    min_level,
                    max_level,
                } => LogOutput::Chat {
                    min_level: *min_level,
                    max_level: *max_level,
                    endpoint: endpoint.clone(),
                    token: token.clone(),
                    chat_ids: chat_ids.clone(),
                    client: http_client()?,
                },
            })
        })
        .collect()
}
