//! TCP listener, per-connection workers and graceful shutdown.
//!
//! Each accepted connection is registered and then served by its own
//! tokio task: read one frame, dispatch it, reply or broadcast, repeat.
//! A worker leaves the registry exactly once, on its own termination
//! path. Shutdown flips a watch flag that every worker selects against
//! its blocking read; the coordinator then waits for the registry to
//! drain before returning.

use crate::registry::{ClientInfo, ClientRegistry, SharedWriter};
use crate::roster::DutyRoster;
use log::{debug, info, warn};
use shared::{ClientMessage, Frame, ServerMessage, SHARED_CREDENTIAL};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

/// The listening server plus the shared state handed to every worker.
pub struct Server {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    roster: Arc<DutyRoster>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Binds the listening socket. A bind failure is fatal to the caller.
    pub async fn new(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (shutdown, _) = watch::channel(false);

        Ok(Server {
            listener,
            registry: Arc::new(ClientRegistry::new()),
            roster: Arc::new(DutyRoster::new()),
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for requesting shutdown from outside the accept loop
    /// (typically a signal watcher task).
    pub fn shutdown_sender(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown)
    }

    /// Registry handle, exposed so callers and tests can observe the
    /// connection count.
    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until shutdown is requested, then drains.
    ///
    /// An accept failure outside of shutdown is fatal. After the flag
    /// flips, every worker's pending read is cancelled, each worker
    /// removes itself, and `run` returns once the registry is empty.
    pub async fn run(self) -> io::Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept_connection(stream, addr).await,
                        Err(e) => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                            return Err(e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            "Shutdown requested, draining {} connection(s)",
            self.registry.len().await
        );
        self.registry.drain_wait().await;
        info!("All connections closed, exiting");

        Ok(())
    }

    /// Registers the connection and spawns its worker task.
    async fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(write_half));

        let id = self.registry.register(addr, Arc::clone(&writer)).await;

        let registry = Arc::clone(&self.registry);
        let roster = Arc::clone(&self.roster);
        let shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            connection_worker(id, read_half, writer, registry, roster, shutdown_rx).await;
        });
    }
}

/// Per-connection loop: read one frame, dispatch, repeat.
///
/// Termination paths all converge on removing the worker's own registry
/// entry, which also closes the socket. No other actor removes it.
async fn connection_worker(
    id: u32,
    mut reader: OwnedReadHalf,
    writer: SharedWriter,
    registry: Arc<ClientRegistry>,
    roster: Arc<DutyRoster>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Shutdown may have been requested between registration and the
    // first iteration; the subscription predates that, but check anyway.
    if *shutdown_rx.borrow() {
        registry.remove(id).await;
        return;
    }

    loop {
        // Re-read our own state each iteration so a login on the previous
        // frame is visible to the next dispatch.
        let me = match registry.snapshot(id).await {
            Some(info) => info,
            None => return, // already removed, nothing left to clean up
        };

        let read = tokio::select! {
            result = Frame::read_from(&mut reader) => result,
            _ = shutdown_rx.changed() => {
                debug!("Client {} read cancelled by shutdown", id);
                break;
            }
        };

        match read {
            Ok(Some(frame)) => dispatch(&me, &frame, &writer, &registry, &roster).await,
            Ok(None) => {
                info!("Client {} at {} closed the connection", id, me.addr);
                break;
            }
            Err(e) => {
                warn!("Client {} at {}: error on recv: {}", id, me.addr, e);
                break;
            }
        }
    }

    registry.remove(id).await;
}

/// Handles one decoded request. Malformed and unauthorized requests are
/// logged and dropped without a reply; the connection stays open.
async fn dispatch(
    me: &ClientInfo,
    frame: &Frame,
    writer: &SharedWriter,
    registry: &ClientRegistry,
    roster: &DutyRoster,
) {
    match ClientMessage::decode(frame) {
        Ok(ClientMessage::Login { credential }) => {
            let accepted = credential.as_slice() == SHARED_CREDENTIAL;
            info!(
                "Login request from {}: {}",
                me.addr,
                if accepted { "success" } else { "failure" }
            );

            if registry.set_logged_in(me.id, accepted).await {
                let reply = ServerMessage::LoginResponse { accepted }.encode();
                send_best_effort(me.id, writer, &reply.to_bytes()).await;
            }
        }
        Ok(ClientMessage::GetAssignment { key }) => {
            let name = roster.get(&key).await;
            let reply = ServerMessage::AssignmentUpdate { key, name }.encode();
            send_best_effort(me.id, writer, &reply.to_bytes()).await;
        }
        Ok(ClientMessage::SetAssignment { key, name }) => {
            if !me.logged_in {
                warn!(
                    "Rejected set-assignment for {} from {}: not logged in",
                    key, me.addr
                );
                return;
            }

            // Roster lock is released before the registry's read lock is
            // taken for the broadcast; the two are never held together.
            roster.set(key, name.clone()).await;
            info!("Slot {} assigned to \"{}\" by client {}", key, name, me.id);

            let update = ServerMessage::AssignmentUpdate { key, name }.encode();
            registry.broadcast(me.id, &update.to_bytes()).await;
        }
        Err(e) => {
            warn!("Invalid message from {}: {}", me.addr, e);
        }
    }
}

/// Direct reply on the worker's own connection. Failures surface on the
/// worker's next read, so they are only logged here.
async fn send_best_effort(id: u32, writer: &SharedWriter, bytes: &[u8]) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_all(bytes).await {
        debug!("Send to client {} failed: {}", id, e);
    }
}
