//! Event registry and the payload handed to handlers.
//!
//! Handlers run synchronously on the task that dispatches, in registration
//! order. For a connection that task is its receive loop, so a handler sees
//! the connection's events strictly in wire order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::ServerConnection;
use crate::error::{ReactorError, Result};
use crate::message::{Message, Tags};

/// Handlers registered under this name see every event.
pub const ALL_EVENTS: &str = "*";

pub type Handler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// One decoded line, as seen by handlers.
#[derive(Clone)]
pub struct Event {
    /// The connection the line arrived on.
    pub server: Arc<ServerConnection>,
    /// Normalized (upper-case) command, also the event name.
    pub name: String,
    pub message: Message,
}

impl Event {
    pub fn new(server: Arc<ServerConnection>, message: Message) -> Self {
        Self {
            server,
            name: normalize(&message.command),
            message,
        }
    }

    pub fn params(&self) -> &[String] {
        &self.message.params
    }

    /// Parameter `index`, or a contract error naming the event if the line
    /// is too short.
    pub fn param(&self, index: usize) -> Result<&str> {
        self.message
            .params
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| ReactorError::MissingParam {
                command: self.name.clone(),
                index,
            })
    }

    pub fn tags(&self) -> Option<&Tags> {
        (!self.message.tags.is_empty()).then_some(&self.message.tags)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.message.prefix.as_deref()
    }

    /// Nickname part of a `nick!user@host` prefix.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix().and_then(|p| p.split(['!', '@']).next())
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("server", &self.server.name())
            .field("name", &self.name)
            .field("message", &self.message)
            .finish()
    }
}

/// Maps event names to ordered handler lists.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher with the built-in negotiation and registration handlers.
    pub fn with_defaults() -> Self {
        let dispatcher = Self::new();
        crate::handlers::register_defaults(&dispatcher);
        dispatcher
    }

    /// Append `handler` to the list for `name`. Duplicates are kept and all run.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(normalize(name))
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers
            .read()
            .get(&normalize(name))
            .map_or(0, Vec::len)
    }

    /// Run every handler for `name`, then every [`ALL_EVENTS`] handler.
    ///
    /// A failing handler does not stop the rest; failures are logged and the
    /// first one is returned once all handlers have run.
    pub fn dispatch(&self, name: &str, event: &Event) -> Result<()> {
        let name = normalize(name);
        // Snapshot so handlers may register more handlers without deadlocking.
        let handlers: Vec<Handler> = {
            let map = self.handlers.read();
            let specific = map.get(&name).into_iter().flatten();
            let wildcard = if name == ALL_EVENTS {
                None
            } else {
                map.get(ALL_EVENTS)
            };
            specific.chain(wildcard.into_iter().flatten()).cloned().collect()
        };

        let mut first_error = None;
        for handler in handlers {
            if let Err(e) = handler(event) {
                tracing::warn!(
                    server = %event.server.name(),
                    event = %name,
                    error = %e,
                    "event handler failed"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn event(dispatcher: &Arc<Dispatcher>, line: &str) -> Event {
        let server = ServerConnection::new("test", Arc::clone(dispatcher));
        Event::new(server, Message::parse(line).unwrap())
    }

    #[test]
    fn handlers_run_in_registration_order_then_wildcard() {
        let dispatcher = Arc::new(Dispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["all", "first", "second", "first"] {
            let seen = Arc::clone(&seen);
            let name = if tag == "all" { ALL_EVENTS } else { "privmsg" };
            dispatcher.register(name, move |_| {
                seen.lock().push(tag);
                Ok(())
            });
        }
        assert_eq!(dispatcher.handler_count("PRIVMSG"), 3);

        let ev = event(&dispatcher, ":a!b@c PRIVMSG #chan :hi");
        dispatcher.dispatch(&ev.name, &ev).unwrap();
        assert_eq!(*seen.lock(), vec!["first", "second", "first", "all"]);

        seen.lock().clear();
        let ev = event(&dispatcher, "PING x");
        dispatcher.dispatch(&ev.name, &ev).unwrap();
        assert_eq!(*seen.lock(), vec!["all"]);
    }

    #[test]
    fn missing_param_fails_fast_but_others_still_run() {
        let dispatcher = Arc::new(Dispatcher::new());
        let ran = Arc::new(Mutex::new(false));
        dispatcher.register("001", |ev| ev.param(0).map(|_| ()));
        let flag = Arc::clone(&ran);
        dispatcher.register("001", move |_| {
            *flag.lock() = true;
            Ok(())
        });

        let ev = event(&dispatcher, ":srv 001");
        let err = dispatcher.dispatch("001", &ev).unwrap_err();
        assert!(matches!(err, ReactorError::MissingParam { ref command, index: 0 } if command == "001"));
        assert!(err.is_contract_violation());
        assert!(*ran.lock());
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = Arc::clone(&dispatcher);
        dispatcher.register("NOTICE", move |_| {
            inner.register("NOTICE", |_| Ok(()));
            Ok(())
        });
        let ev = event(&dispatcher, "NOTICE * :hello");
        dispatcher.dispatch("notice", &ev).unwrap();
        assert_eq!(dispatcher.handler_count("NOTICE"), 2);
    }

    #[test]
    fn payload_accessors() {
        let dispatcher = Arc::new(Dispatcher::new());
        let ev = event(&dispatcher, "@msgid=1 :nick!user@host privmsg #chan :hi there");
        assert_eq!(ev.name, "PRIVMSG");
        assert_eq!(ev.source_nick(), Some("nick"));
        assert_eq!(ev.param(1).unwrap(), "hi there");
        assert_eq!(ev.tags().unwrap().get("msgid").unwrap(), "1");
        assert_eq!(ev.server.name(), "test");

        let ev = event(&dispatcher, "PING x");
        assert!(ev.tags().is_none());
        assert!(ev.source_nick().is_none());
    }
}
