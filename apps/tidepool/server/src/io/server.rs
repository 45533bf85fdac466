use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tidepool_core::DEFAULT_NAMESPACE;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Client, Namespace};
use crate::session::Session;

#[derive(Clone)]
pub struct Server {
    namespaces: Arc<DashMap<String, Arc<Namespace>>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        let server = Self {
            namespaces: Arc::new(DashMap::new()),
        };
        server.of(DEFAULT_NAMESPACE);
        server
    }

    /// Looks up a namespace, creating it on first use.
    pub fn of(&self, name: &str) -> Arc<Namespace> {
        let name = normalize(name);
        Arc::clone(
            self.namespaces
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Namespace::new(name)))
                .value(),
        )
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Emits to every socket of the default namespace.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> usize {
        self.of(DEFAULT_NAMESPACE).emit(event, args)
    }

    /// Wraps one session in a client. `None` if the session's events were
    /// already taken.
    pub fn attach(&self, session: Arc<Session>) -> Option<Arc<Client>> {
        Client::spawn(self.clone(), session)
    }

    /// Attaches every session the engine reports.
    pub fn bind(&self, mut connections: mpsc::UnboundedReceiver<Arc<Session>>) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(session) = connections.recv().await {
                if server.attach(Arc::clone(&session)).is_none() {
                    debug!(session_id = %session.id(), "session already has a consumer");
                }
            }
        })
    }
}

fn normalize(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}
