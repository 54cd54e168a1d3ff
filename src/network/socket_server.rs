use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use super::listener::{AcceptHandler, Listener};
use crate::pool::{sending_queue_pool, BufferLease, BufferManager, SendingQueuePool};
use crate::service::{ListenerInfo, ServerConfig, Shutdown};
use crate::AppResult;

/// The transport side of a server: its listeners, the receive buffer slab and
/// the sending queue pool every session draws from.
#[derive(Debug)]
pub struct SocketServer {
    config: Arc<ServerConfig>,
    listener_infos: Vec<ListenerInfo>,
    buffer_manager: Arc<Mutex<BufferManager>>,
    queue_pool: SendingQueuePool,
    local_addrs: Mutex<Vec<SocketAddr>>,
}

impl SocketServer {
    /// Validates the listener entries and allocates the pools. The receive
    /// slab holds one buffer per allowed connection.
    pub fn new(config: Arc<ServerConfig>) -> AppResult<SocketServer> {
        let listener_infos = config.listener_infos()?;

        let buffer_size = config.effective_rec_buffer_size();
        let mut buffer_manager =
            BufferManager::new(buffer_size * config.max_connection_number, buffer_size);
        buffer_manager.init_buffer();

        let (min_pool_size, max_pool_size) = config.sending_queue_pool_bounds();
        let queue_pool = sending_queue_pool(min_pool_size, max_pool_size, config.sending_queue_size);

        Ok(SocketServer {
            config,
            listener_infos,
            buffer_manager: Arc::new(Mutex::new(buffer_manager)),
            queue_pool,
            local_addrs: Mutex::new(Vec::new()),
        })
    }

    /// Binds every listener and spawns its accept loop. Either all listeners
    /// start or none does.
    pub(crate) fn start(
        &self,
        acceptor: Arc<dyn AcceptHandler>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: &mpsc::Sender<()>,
    ) -> AppResult<()> {
        let mut listeners = Vec::with_capacity(self.listener_infos.len());
        for info in &self.listener_infos {
            match Listener::bind(*info) {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    error!("failed to start listener on {}: {}", info.endpoint, e);
                    // dropping the bound sockets closes them again
                    drop(listeners);
                    return Err(e);
                }
            }
        }

        let mut local_addrs = Vec::with_capacity(listeners.len());
        for listener in &listeners {
            local_addrs.push(listener.local_addr()?);
        }
        *self.local_addrs.lock() = local_addrs;

        for listener in listeners {
            let shutdown = Shutdown::new(notify_shutdown.subscribe());
            tokio::spawn(listener.run(
                acceptor.clone(),
                shutdown,
                shutdown_complete_tx.clone(),
            ));
        }
        Ok(())
    }

    /// Forgets the listener addresses; the accept loops themselves leave on
    /// the shutdown broadcast.
    pub(crate) fn forget_listeners(&self) {
        let stopped = std::mem::take(&mut *self.local_addrs.lock());
        info!("stopping listeners on {:?}", stopped);
    }

    /// Addresses the running listeners are bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn queue_pool(&self) -> &SendingQueuePool {
        &self.queue_pool
    }

    /// Connections that can still be accepted.
    pub fn available_connections(&self) -> usize {
        self.buffer_manager.lock().available()
    }

    pub(crate) fn lease_buffer(&self) -> Option<BufferLease> {
        BufferLease::acquire(&self.buffer_manager)
    }

    pub(crate) fn apply_socket_options(&self, stream: &TcpStream) -> io::Result<()> {
        let config = &self.config;
        let socket = SockRef::from(stream);
        socket.set_nodelay(true)?;
        socket.set_linger(None)?;
        if config.keep_alive_time > 0 {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(config.keep_alive_time))
                .with_interval(Duration::from_secs(config.keep_alive_interval.max(1)));
            socket.set_tcp_keepalive(&keepalive)?;
        }
        if config.rec_buffer_size > 0 {
            socket.set_recv_buffer_size(config.rec_buffer_size)?;
        }
        if config.send_buffer_size > 0 {
            socket.set_send_buffer_size(config.send_buffer_size)?;
        }
        Ok(())
    }
}
