//! Shared application state

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use strand_engine::Engine;
use tokio_util::sync::CancellationToken;

/// Lock-guarded set of connected WebSocket clients, for graceful shutdown
#[derive(Default)]
pub struct ClientSet {
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, CancellationToken>>,
}

impl ClientSet {
    /// Register a client; the returned token cancels its socket loop
    pub fn register(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, token.clone());
        (id, token)
    }

    /// Drop a client on disconnect
    pub fn remove(&self, id: u64) {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
    }

    /// Number of connected clients
    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no clients are connected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every connected client
    pub fn shutdown(&self) {
        let clients = self
            .clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for token in clients.values() {
            token.cancel();
        }
    }
}

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub clients: Arc<ClientSet>,
}

impl AppState {
    /// Bundle an engine with a fresh client set
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            clients: Arc::new(ClientSet::default()),
        }
    }
}
