//! Call handlers and the method registry.

use crate::error::ServerError;
use dashmap::DashMap;
use fastrpc_protocol::RpcEncoder;
use serde_json::Value;
use std::sync::Arc;

/// Handles calls to one method.
///
/// `call` runs on the connection's task and must not block; long-running work
/// should be spawned and report through the encoder. The call stays in flight
/// until the encoder sends `END` or `ERROR`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, args: Vec<Value>, rpc: RpcEncoder);
}

impl<F> Handler for F
where
    F: Fn(Vec<Value>, RpcEncoder) + Send + Sync + 'static,
{
    fn call(&self, args: Vec<Value>, rpc: RpcEncoder) {
        self(args, rpc)
    }
}

/// Method name to handler table, shared by every connection.
///
/// Registration is allowed while the server is running.
#[derive(Default)]
pub struct Registry {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `name`. Each name may be registered once.
    pub fn register(&self, name: impl Into<String>, handler: impl Handler) -> Result<(), ServerError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ServerError::InvalidMethodName);
        }

        match self.handlers.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(ServerError::DuplicateHandler(entry.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                tracing::debug!("Registered handler for {}", entry.key());
                entry.insert(Arc::new(handler));
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).map(|h| h.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
