//! TCP endpoints for the bus contract
//!
//! The station binds two sockets: a command listener that feeds
//! dispatcher queues, and an event publisher that broadcasts every
//! record to all connected clients. Hardware-facing threads never touch
//! a socket; they push onto a lock-free queue and a dedicated publisher
//! thread owns the listener (same architecture as the telemetry path in
//! a hardware daemon).

use crate::bus::{wire, CommandRecord, EVENT_TOPIC_PREFIX};
use crate::error::Result;
use crate::logbook::{EventRecord, Level};
use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Queue depth for outbound events.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Queue depth for inbound commands per listener.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Broker-facing event record shape.
#[derive(Serialize)]
struct BusEvent {
    status: String,
    msg: serde_json::Value,
    level: Level,
    source_name: String,
    timestamp: DateTime<Utc>,
}

impl BusEvent {
    fn from_record(record: &EventRecord) -> Self {
        // Handler outcomes carry an explicit status in their context;
        // bare events derive one from severity.
        let status = record
            .context
            .get("status")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                if record.level >= Level::Error {
                    "ERROR".to_string()
                } else {
                    "OK".to_string()
                }
            });
        let msg = if record.context.is_null() {
            serde_json::Value::String(record.message.clone())
        } else {
            record.context.clone()
        };
        BusEvent {
            status,
            msg,
            level: record.level,
            source_name: record.source_name.clone(),
            timestamp: record.emitted_at,
        }
    }
}

/// Broadcasts event frames to every connected client.
pub struct EventPublisher {
    queue: Arc<ArrayQueue<(String, Vec<u8>)>>,
    shutdown: Arc<AtomicBool>,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
    local_addr: std::net::SocketAddr,
}

impl EventPublisher {
    pub fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let queue = Arc::new(ArrayQueue::new(EVENT_QUEUE_DEPTH));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_queue = Arc::clone(&queue);
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("bus-events".to_string())
            .spawn(move || publisher_loop(listener, thread_queue, thread_shutdown))?;

        log::info!("Event publisher bound to {}", address);

        Ok(EventPublisher {
            queue,
            shutdown,
            thread: parking_lot::Mutex::new(Some(thread)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Queue one event for broadcast. Non-blocking; a full queue drops
    /// the record with a diagnostic.
    pub fn publish_event(&self, record: &EventRecord) {
        let topic = format!("{}/{}", EVENT_TOPIC_PREFIX, record.source_name);
        let payload = match wire::encode_record(&BusEvent::from_record(record)) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Failed to encode event record: {}", e);
                return;
            }
        };
        if self.queue.push((topic, payload)).is_err() {
            log::warn!("Event queue full, dropping record");
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn publisher_loop(
    listener: TcpListener,
    queue: Arc<ArrayQueue<(String, Vec<u8>)>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut clients: Vec<TcpStream> = Vec::new();

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("Event client connected: {}", addr);
                clients.push(stream);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::error!("Error accepting event client: {}", e),
        }

        let mut wrote = false;
        while let Some((topic, payload)) = queue.pop() {
            wrote = true;
            clients.retain_mut(|client| {
                let mut frame = Vec::with_capacity(4 + topic.len() + 1 + payload.len());
                match wire::write_frame(&mut frame, &topic, &payload)
                    .and_then(|_| client.write_all(&frame).map_err(Into::into))
                {
                    Ok(_) => true,
                    Err(e) => {
                        if let Ok(addr) = client.peer_addr() {
                            log::debug!("Event client {} disconnected: {}", addr, e);
                        }
                        false
                    }
                }
            });
        }

        if !wrote {
            thread::sleep(Duration::from_millis(10));
        }
    }

    log::info!("Event publisher thread exiting");
}

type SubscriptionTable = Arc<parking_lot::Mutex<Vec<(String, Arc<ArrayQueue<CommandRecord>>)>>>;

/// Accepts bus connections on one socket and routes each decoded
/// command record to the subscription matching its frame topic.
pub struct CommandBus {
    subscriptions: SubscriptionTable,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl CommandBus {
    pub fn bind(address: &str, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let subscriptions: SubscriptionTable = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let accept_subscriptions = Arc::clone(&subscriptions);
        let accept_shutdown = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("bus-commands".to_string())
            .spawn(move || accept_loop(listener, accept_subscriptions, accept_shutdown))?;

        log::info!("Command bus bound to {}", address);

        Ok(CommandBus {
            subscriptions,
            shutdown,
            thread: Some(thread),
            local_addr,
        })
    }

    /// Register one topic and get its record queue back. A topic may be
    /// subscribed once per dispatcher.
    pub fn subscribe(&self, topic: &str) -> CommandSubscription {
        let queue = Arc::new(ArrayQueue::new(COMMAND_QUEUE_DEPTH));
        self.subscriptions
            .lock()
            .push((topic.to_string(), Arc::clone(&queue)));
        log::info!("Subscribed to command topic {}", topic);
        CommandSubscription { queue }
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

impl Drop for CommandBus {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// One dispatcher's view of the command bus.
pub struct CommandSubscription {
    queue: Arc<ArrayQueue<CommandRecord>>,
}

impl CommandSubscription {
    /// Next pending command record, if any.
    pub fn poll(&self) -> Option<CommandRecord> {
        self.queue.pop()
    }
}

fn accept_loop(listener: TcpListener, subscriptions: SubscriptionTable, shutdown: Arc<AtomicBool>) {
    let mut client_id = 0u32;
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("Command client connected: {}", addr);
                client_id += 1;
                let client_subscriptions = Arc::clone(&subscriptions);
                let client_shutdown = Arc::clone(&shutdown);
                let spawned = thread::Builder::new()
                    .name(format!("bus-client-{}", client_id))
                    .spawn(move || client_loop(stream, client_subscriptions, client_shutdown));
                if let Err(e) = spawned {
                    log::error!("Failed to spawn command client thread: {}", e);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => log::error!("Error accepting command client: {}", e),
        }
    }
    log::info!("Command bus thread exiting");
}

fn client_loop(mut stream: TcpStream, subscriptions: SubscriptionTable, shutdown: Arc<AtomicBool>) {
    if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(500))) {
        log::warn!("Failed to set read timeout: {}", e);
    }

    while !shutdown.load(Ordering::Relaxed) {
        match wire::read_frame(&mut stream) {
            Ok(Some((frame_topic, payload))) => {
                let queue = {
                    let subscriptions = subscriptions.lock();
                    subscriptions
                        .iter()
                        .find(|(topic, _)| *topic == frame_topic)
                        .map(|(_, queue)| Arc::clone(queue))
                };
                let Some(queue) = queue else {
                    log::debug!("Ignoring frame on unsubscribed topic {}", frame_topic);
                    continue;
                };
                match wire::decode_command(&payload) {
                    Ok(record) => {
                        if queue.push(record).is_err() {
                            log::warn!("Command queue full, dropping record");
                        }
                    }
                    Err(e) => log::warn!("Discarding malformed command frame: {}", e),
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::debug!("Command client closed: {}", e);
                return;
            }
        }
    }
}

/// Publish one command record, used by the `send` CLI.
pub fn publish_command(address: &str, topic: &str, record: &CommandRecord) -> Result<()> {
    let mut stream = TcpStream::connect(address)?;
    let payload = wire::encode_record(record)?;
    wire::write_frame(&mut stream, topic, &payload)?;
    Ok(())
}
