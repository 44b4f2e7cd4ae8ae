//! # Stallboard Server Library
//!
//! Server for a shared stable/pasture duty schedule. Connected clients
//! query and update duty-slot assignments over a small binary TCP
//! protocol; every successful update is pushed to all other connected
//! clients immediately.
//!
//! ## Architecture
//!
//! One tokio task per connection runs the read-dispatch-respond loop, so
//! concurrency is naturally bounded by the number of live connections.
//! Two independently guarded shared structures back the handlers:
//!
//! - the client registry (who is connected, who is logged in), a
//!   reader/writer-locked map that also carries the drain signal used
//!   during shutdown;
//! - the duty roster (slot → assignee), a single-lock map.
//!
//! Handlers never hold both locks at once: a set-assignment releases the
//! roster lock before taking the registry's shared lock to broadcast.
//!
//! ## Lifecycle
//!
//! The listener registers each accepted connection and spawns its worker.
//! A worker removes its own registry entry exactly once, on disconnect,
//! transport error or shutdown, and nothing else ever removes it. On a
//! termination signal the accept loop stops, every worker's pending read
//! is cancelled, and the process exits successfully once the registry
//! has drained.
//!
//! ## Module Organization
//!
//! - [`registry`] — live connection roster, login state, broadcast and
//!   drain-wait.
//! - [`roster`] — the duty-slot assignment table.
//! - [`network`] — listener, per-connection workers, request dispatch
//!   and the shutdown coordinator.

pub mod network;
pub mod registry;
pub mod roster;
