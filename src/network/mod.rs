//! Network Module Implementation
//!
//! Connection handling between the listening sockets and the application
//! handler.
//!
//! # Components
//!
//! - `Listener`: binds one endpoint and runs its accept loop
//! - `SocketServer`: owns the listeners, the receive buffer slab and the
//!   sending queue pool
//! - `Session`: one connection, its state word and its send pipeline
//! - `Receiver`: the per-session read, frame and dispatch loop
//!
//! # Concurrency
//!
//! Receives of one session are serialized by its receive loop and sends by
//! its single active sending queue. Sessions share nothing but the pools.

pub use listener::Listener;
pub use session::Session;
pub use socket_server::SocketServer;
pub use state::SessionState;

pub(crate) use listener::AcceptHandler;
pub(crate) use receiver::Receiver;
pub(crate) use session::ClosedCallback;

mod listener;
mod receiver;
mod session;
mod socket_server;
mod state;
