//! Registry of live client connections.
//!
//! The registry is the single source of truth for which connections exist
//! and whether each one has logged in. Workers operate on snapshots; all
//! mutation goes through the registry's own lock. Every entry is removed
//! exactly once, by the worker that owns the connection, which is what
//! makes socket close and drain accounting race-free.

use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify, RwLock};

/// Shared handle to a connection's write half.
///
/// Replies go out on the owning worker's task and broadcasts on the
/// sending worker's task, so the half needs its own lock; the registry's
/// read lock alone is enough to reach it.
pub type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// A live client connection as the registry tracks it.
pub struct Client {
    pub id: u32,
    pub addr: SocketAddr,
    pub logged_in: bool,
    writer: SharedWriter,
}

/// Read-only copy of a client's registry state, safe to hold without
/// any lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: u32,
    pub addr: SocketAddr,
    pub logged_in: bool,
}

/// Synchronized roster of connected clients.
///
/// Readers (snapshots, broadcasts) share the lock; registration, login
/// flips and removal take it exclusively. Removal signals the drain
/// notifier so a shutdown coordinator can wait for the registry to empty
/// without polling.
pub struct ClientRegistry {
    clients: RwLock<HashMap<u32, Client>>,
    next_id: AtomicU32,
    drained: Notify,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            drained: Notify::new(),
        }
    }

    /// Adds a new connection and returns its identity. Ids are unique for
    /// the process lifetime, so a recycled entry can never be confused
    /// with its predecessor.
    pub async fn register(&self, addr: SocketAddr, writer: SharedWriter) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Client {
            id,
            addr,
            logged_in: false,
            writer,
        };

        info!("Client {} connected from {}", id, addr);
        self.clients.write().await.insert(id, client);
        id
    }

    /// Returns a snapshot of the client's current state, or `None` if it
    /// is no longer registered.
    pub async fn snapshot(&self, id: u32) -> Option<ClientInfo> {
        self.clients.read().await.get(&id).map(|client| ClientInfo {
            id: client.id,
            addr: client.addr,
            logged_in: client.logged_in,
        })
    }

    /// Records a login outcome. Returns whether the client was still
    /// registered.
    pub async fn set_logged_in(&self, id: u32, logged_in: bool) -> bool {
        match self.clients.write().await.get_mut(&id) {
            Some(client) => {
                client.logged_in = logged_in;
                true
            }
            None => false,
        }
    }

    /// Removes a client, shutting its socket down in the process.
    ///
    /// Only the worker owning `id` may call this, and only once; that is
    /// what keeps close-and-remove exactly-once per connection.
    pub async fn remove(&self, id: u32) {
        let removed = self.clients.write().await.remove(&id);

        if let Some(client) = removed {
            let mut writer = client.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Closing socket for client {} failed: {}", id, e);
            }
            info!("Client {} disconnected", id);
        }

        self.drained.notify_waiters();
    }

    /// Sends `bytes` to every registered client except `exclude`.
    ///
    /// Sends are best-effort: a failed send is only logged, because the
    /// failed peer's own worker will hit the same fault on its next read
    /// and remove itself.
    pub async fn broadcast(&self, exclude: u32, bytes: &[u8]) {
        let clients = self.clients.read().await;

        for (id, client) in clients.iter() {
            if *id == exclude {
                continue;
            }

            let mut writer = client.writer.lock().await;
            if let Err(e) = writer.write_all(bytes).await {
                debug!("Broadcast to client {} failed: {}", id, e);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Waits until the registry is empty. Completion-signalled on every
    /// removal, so no polling loop is involved.
    pub async fn drain_wait(&self) {
        loop {
            // Register interest before checking, so a removal between the
            // check and the wait cannot be missed.
            let notified = self.drained.notified();
            if self.clients.read().await.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
