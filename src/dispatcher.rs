//! Command dispatcher
//!
//! One dispatcher per chain: it owns the bus subscription for its
//! topic, a boxed Reader, and the route table mapping structured-match
//! patterns to handlers. Handlers run serially on the owning thread
//! (the serial link is not reentrant) and are shielded from panics so
//! a misbehaving exchange can never take the dispatcher down.

use crate::bus::{CommandRecord, CommandSubscription};
use crate::logbook::{EventRecord, Level, Logbook};
use crate::reader::{HandlerCtx, Outcome, Reader, Status};
use crate::store::SampleStore;
use parking_lot::Mutex;
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Structured-match pattern: a mapping of field to expected value,
/// matched by subset against an incoming command record.
#[derive(Debug, Clone)]
pub struct Pattern(CommandRecord);

impl Pattern {
    pub fn new(fields: serde_json::Value) -> Self {
        Pattern(fields.as_object().cloned().unwrap_or_default())
    }

    /// The common single-field pattern.
    pub fn command(name: &str) -> Self {
        Pattern::new(json!({ "command": name }))
    }

    pub fn matches(&self, record: &CommandRecord) -> bool {
        self.0
            .iter()
            .all(|(key, expected)| record.get(key) == Some(expected))
    }
}

/// Handler closure bound to the dispatcher's Reader.
pub type Handler =
    Box<dyn FnMut(&mut dyn Reader, &CommandRecord, &mut HandlerCtx<'_>) -> Outcome + Send>;

pub struct Dispatcher {
    name: String,
    reader: Box<dyn Reader>,
    routes: Vec<(Pattern, Handler)>,
    logbook: Arc<Logbook>,
    store: Arc<Mutex<Box<dyn SampleStore>>>,
}

impl Dispatcher {
    pub fn new(
        name: &str,
        reader: Box<dyn Reader>,
        logbook: Arc<Logbook>,
        store: Arc<Mutex<Box<dyn SampleStore>>>,
    ) -> Self {
        Dispatcher {
            name: name.to_string(),
            reader,
            routes: Vec::new(),
            logbook,
            store,
        }
    }

    /// Associate a pattern with a handler. A record may match several
    /// patterns; every matching handler runs, in registration order.
    pub fn add_command(&mut self, pattern: Pattern, handler: Handler) {
        self.routes.push((pattern, handler));
    }

    /// Wire the full capability set under its broker command names.
    pub fn register_default_commands(&mut self) {
        self.add_command(
            Pattern::command("power_on"),
            Box::new(|r, c, ctx| r.handle_power_on(c, ctx)),
        );
        self.add_command(
            Pattern::command("power_off"),
            Box::new(|r, c, ctx| r.handle_power_off(c, ctx)),
        );
        self.add_command(
            Pattern::command("status"),
            Box::new(|r, c, ctx| r.handle_status(c, ctx)),
        );
        self.add_command(
            Pattern::command("ping"),
            Box::new(|r, c, ctx| r.handle_ping(c, ctx)),
        );
        self.add_command(
            Pattern::command("read"),
            Box::new(|r, c, ctx| r.handle_read(c, ctx)),
        );
        self.add_command(
            Pattern::command("write"),
            Box::new(|r, c, ctx| r.handle_write(c, ctx)),
        );
        self.add_command(
            Pattern::command("write_invert"),
            Box::new(|r, c, ctx| r.handle_write_invert(c, ctx)),
        );
        self.add_command(
            Pattern::command("sensors"),
            Box::new(|r, c, ctx| r.handle_sensors(c, ctx)),
        );
        self.add_command(
            Pattern::command("load"),
            Box::new(|r, c, ctx| r.handle_load(c, ctx)),
        );
        self.add_command(
            Pattern::command("exec"),
            Box::new(|r, c, ctx| r.handle_exec(c, ctx)),
        );
        self.add_command(
            Pattern::command("retr"),
            Box::new(|r, c, ctx| r.handle_retrieve(c, ctx)),
        );
    }

    /// Run every handler whose pattern matches the record.
    pub fn dispatch(&mut self, record: &CommandRecord) {
        let command = record
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("<unnamed>")
            .to_string();

        let mut matched = false;
        for (pattern, handler) in self.routes.iter_mut() {
            if !pattern.matches(record) {
                continue;
            }
            matched = true;
            log::debug!("[{}] Handler {} called", self.name, command);

            // The store lock spans one handler: short transactions, and
            // the guard is gone before the outcome is published.
            let outcome = {
                let mut store = self.store.lock();
                let mut ctx = HandlerCtx {
                    logbook: &*self.logbook,
                    store: &mut **store,
                };
                catch_unwind(AssertUnwindSafe(|| {
                    handler(&mut *self.reader, record, &mut ctx)
                }))
            };

            match outcome {
                Ok(outcome) => {
                    if let Some(response) = outcome.response {
                        let level = match outcome.status {
                            Status::Ok => Level::Info,
                            Status::Error => Level::Error,
                        };
                        let status = match outcome.status {
                            Status::Ok => "OK",
                            Status::Error => "ERROR",
                        };
                        self.logbook.emit_record(
                            EventRecord::new(self.logbook.source_name(), level, &command)
                                .with_context(json!({
                                    "status": status,
                                    "command": record,
                                    "response": response,
                                })),
                        );
                    }
                    log::debug!("[{}] Handler {} executed", self.name, command);
                }
                Err(_) => {
                    self.logbook.error(&format!(
                        "Error while executing handler {}",
                        command
                    ));
                }
            }
        }

        if !matched {
            log::debug!("[{}] No handler matched record", self.name);
        }
    }

    /// Poll the subscription until shutdown; an in-flight handler always
    /// runs to completion.
    pub fn run(&mut self, subscription: &CommandSubscription, shutdown: &Arc<AtomicBool>) {
        log::info!("[{}] Dispatcher listening", self.name);
        while !shutdown.load(Ordering::Relaxed) {
            match subscription.poll() {
                Some(record) => self.dispatch(&record),
                None => thread::sleep(Duration::from_millis(20)),
            }
        }
        log::info!("[{}] Dispatcher stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbook::Logbook;
    use crate::reader::Stm32Reader;
    use crate::store::MemoryStore;
    use crate::transport::MockLink;

    fn record(fields: serde_json::Value) -> CommandRecord {
        fields.as_object().cloned().unwrap()
    }

    fn test_dispatcher() -> (Dispatcher, Arc<Logbook>) {
        let (logbook, _records) = Logbook::capture("station/test");
        let logbook = Arc::new(logbook);
        let store: Arc<Mutex<Box<dyn SampleStore>>> =
            Arc::new(Mutex::new(Box::new(MemoryStore::new())));
        let reader = Stm32Reader::new(
            "nucleo",
            MockLink::new(),
            std::time::Duration::from_millis(10),
        );
        let dispatcher = Dispatcher::new("test", Box::new(reader), Arc::clone(&logbook), store);
        (dispatcher, logbook)
    }

    #[test]
    fn test_pattern_subset_match() {
        let pattern = Pattern::new(json!({"command": "write", "offset": 2}));
        assert!(pattern.matches(&record(
            json!({"command": "write", "offset": 2, "data": [1]})
        )));
        assert!(!pattern.matches(&record(json!({"command": "write", "offset": 3}))));
        assert!(!pattern.matches(&record(json!({"command": "write"}))));
    }

    #[test]
    fn test_all_matching_handlers_run_in_order() {
        let (mut dispatcher, _logbook) = test_dispatcher();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&calls);
        dispatcher.add_command(
            Pattern::command("status"),
            Box::new(move |_, _, _| {
                first.lock().push("first");
                Outcome::ok()
            }),
        );
        let second = Arc::clone(&calls);
        dispatcher.add_command(
            Pattern::command("status"),
            Box::new(move |_, _, _| {
                second.lock().push("second");
                Outcome::ok()
            }),
        );

        dispatcher.dispatch(&record(json!({"command": "status"})));
        assert_eq!(*calls.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_non_matching_record_runs_nothing() {
        let (mut dispatcher, _logbook) = test_dispatcher();
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        dispatcher.add_command(
            Pattern::command("ping"),
            Box::new(move |_, _, _| {
                *counter.lock() += 1;
                Outcome::ok()
            }),
        );

        dispatcher.dispatch(&record(json!({"command": "nonsense"})));
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let (mut dispatcher, _logbook) = test_dispatcher();
        dispatcher.add_command(
            Pattern::command("boom"),
            Box::new(|_, _, _| panic!("handler exploded")),
        );
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        dispatcher.add_command(
            Pattern::command("boom"),
            Box::new(move |_, _, _| {
                *flag.lock() = true;
                Outcome::ok()
            }),
        );

        dispatcher.dispatch(&record(json!({"command": "boom"})));
        assert!(*ran.lock());
    }

    #[test]
    fn test_outcome_response_is_published() {
        let (logbook, records) = Logbook::capture("station/test");
        let logbook = Arc::new(logbook);
        let store: Arc<Mutex<Box<dyn SampleStore>>> =
            Arc::new(Mutex::new(Box::new(MemoryStore::new())));
        let reader = Stm32Reader::new(
            "nucleo",
            MockLink::new(),
            std::time::Duration::from_millis(10),
        );
        let mut dispatcher =
            Dispatcher::new("test", Box::new(reader), Arc::clone(&logbook), store);
        dispatcher.register_default_commands();

        dispatcher.dispatch(&record(json!({"command": "status"})));

        let records = records.lock();
        let event = records
            .iter()
            .find(|r| r.message == "status")
            .expect("status response event");
        assert_eq!(event.context.get("status").unwrap(), &json!("OK"));
        assert_eq!(
            event.context.get("command").unwrap(),
            &json!({"command": "status"})
        );
        assert!(event.context.get("response").unwrap().get("state").is_some());
    }

    #[test]
    fn test_default_commands_cover_the_capability_set() {
        let (mut dispatcher, _logbook) = test_dispatcher();
        dispatcher.register_default_commands();
        assert_eq!(dispatcher.routes.len(), 11);

        for name in [
            "power_on",
            "power_off",
            "status",
            "ping",
            "read",
            "write",
            "write_invert",
            "sensors",
            "load",
            "exec",
            "retr",
        ] {
            assert!(
                dispatcher
                    .routes
                    .iter()
                    .any(|(p, _)| p.matches(&record(json!({ "command": name })))),
                "no route for {}",
                name
            );
        }
    }
}
