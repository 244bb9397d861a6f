//! Owner of all server connections.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinSet;

use crate::connection::{Lifecycle, ServerConnection};
use crate::dispatch::{Dispatcher, Event};
use crate::error::{ReactorError, Result};

/// Creates named server connections that share one [`Dispatcher`], and
/// tears them all down together.
pub struct Reactor {
    dispatcher: Arc<Dispatcher>,
    servers: DashMap<String, Arc<ServerConnection>>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// A reactor with its own dispatcher, preloaded with the built-in
    /// negotiation and registration handlers.
    pub fn new() -> Self {
        Self::with_dispatcher(Arc::new(Dispatcher::with_defaults()))
    }

    /// A reactor using `dispatcher` as-is. Register
    /// [`handlers::register_defaults`](crate::handlers::register_defaults)
    /// on it exactly once if connections should negotiate and register.
    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            servers: DashMap::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Shorthand for [`Dispatcher::register`] on this reactor's dispatcher.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.register(name, handler);
    }

    /// Create an unconnected connection under `name`.
    pub fn create_server(&self, name: &str) -> Result<Arc<ServerConnection>> {
        match self.servers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ReactorError::DuplicateServer(name.to_string())),
            Entry::Vacant(slot) => {
                let server = ServerConnection::new(name, Arc::clone(&self.dispatcher));
                slot.insert(Arc::clone(&server));
                tracing::debug!(server = name, "created server connection");
                Ok(server)
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<ServerConnection>> {
        self.servers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ReactorError::UnknownServer(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Send `QUIT :<comment>` on every live connection, close them all and
    /// empty the reactor. Connections that already terminated are dropped
    /// without sending anything.
    pub async fn shutdown(&self, comment: &str) {
        let servers: Vec<Arc<ServerConnection>> = self
            .names()
            .iter()
            .filter_map(|name| self.servers.remove(name))
            .map(|(_, server)| server)
            .collect();
        tracing::info!(count = servers.len(), "shutting down");

        let mut quits = JoinSet::new();
        for server in servers {
            match server.lifecycle() {
                Lifecycle::Terminated => {
                    tracing::debug!(server = %server.name(), "already terminated");
                }
                Lifecycle::Unconnected => server.close(),
                Lifecycle::Connected | Lifecycle::Registered => {
                    let comment = comment.to_string();
                    quits.spawn(async move {
                        if let Err(e) = server.quit(&comment).await {
                            tracing::warn!(server = %server.name(), error = %e, "QUIT failed, closing");
                            server.close();
                        }
                    });
                }
            }
        }
        while let Some(joined) = quits.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "shutdown task failed");
            }
        }
    }
}
