//! Pooling layer shared by every session of one server.
//!
//! - `BufferManager` carves per-session receive buffers out of one slab.
//! - `SmartPool` is a growable object pool, used for sending queues.
//! - `SendingQueue` is the epoch-tagged outbound buffer of one session.

pub use buffer_manager::{BufferLease, BufferManager, ReceiveBuffer};
pub use sending_queue::{sending_queue_pool, SendingQueue, SendingQueuePool};
pub use smart_pool::{PoolInfo, PoolSourceCreator, SmartPool};

mod buffer_manager;
mod sending_queue;
mod smart_pool;
