// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use chrono::Local;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{AcceptHandler, ClosedCallback, Receiver, Session, SocketServer};
use crate::pool::SendingQueuePool;
use crate::protocol::{ReceiveFilter, ReceiveFilterFactory};
use crate::{AppError, AppResult};

use super::{CloseReason, ServerConfig, Shutdown};

/// Application code plugged into an [`AppServer`].
///
/// `handle` runs once per framed message, in arrival order for one session.
/// An `Err` or a panic closes the session with
/// [`CloseReason::ApplicationError`]; the server keeps running.
pub trait AppHandler: Send + Sync + 'static {
    type Message: Send + 'static;

    fn handle(
        &self,
        session: &Arc<Session>,
        message: Self::Message,
    ) -> impl Future<Output = AppResult<()>> + Send;

    fn on_new_session_connected(&self, _session: &Arc<Session>) {}

    fn on_session_closed(&self, _session: &Arc<Session>, _reason: CloseReason) {}

    fn on_started(&self) {}

    fn on_stopped(&self) {}
}

/// Decides whether a remote endpoint may connect, before any session
/// resources are allocated for it.
pub trait ConnectionFilter: Send + Sync + 'static {
    fn name(&self) -> &str {
        "connection filter"
    }

    fn allow_connect(&self, remote: &SocketAddr) -> bool;
}

impl<F> ConnectionFilter for F
where
    F: Fn(&SocketAddr) -> bool + Send + Sync + 'static,
{
    fn allow_connect(&self, remote: &SocketAddr) -> bool {
        self(remote)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotInitialized = 0,
    Initializing = 1,
    NotStarted = 2,
    Starting = 3,
    Running = 4,
    Stopping = 5,
}

impl ServerState {
    fn from_u8(value: u8) -> ServerState {
        match value {
            1 => ServerState::Initializing,
            2 => ServerState::NotStarted,
            3 => ServerState::Starting,
            4 => ServerState::Running,
            5 => ServerState::Stopping,
            _ => ServerState::NotInitialized,
        }
    }
}

/// Channels of one start/stop cycle.
struct Running {
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

/// A TCP application server: accepts connections, frames their bytes with
/// the filters made by `F` and hands every message to `H`.
///
/// Lifecycle: `setup` once, then `start` and `stop` any number of times.
pub struct AppServer<F, H> {
    inner: Arc<ServerInner<F, H>>,
}

struct ServerInner<F, H> {
    state: AtomicU8,
    config: OnceCell<Arc<ServerConfig>>,
    socket_server: OnceCell<Arc<SocketServer>>,
    filter_factory: F,
    handler: Arc<H>,
    connection_filters: RwLock<Vec<Arc<dyn ConnectionFilter>>>,
    sessions: DashMap<u64, Arc<Session>>,
    running: Mutex<Option<Running>>,
}

impl<F, H> AppServer<F, H>
where
    F: ReceiveFilterFactory,
    H: AppHandler<Message = <F::Filter as ReceiveFilter>::Message>,
{
    pub fn new(filter_factory: F, handler: H) -> Self {
        AppServer {
            inner: Arc::new(ServerInner {
                state: AtomicU8::new(ServerState::NotInitialized as u8),
                config: OnceCell::new(),
                socket_server: OnceCell::new(),
                filter_factory,
                handler: Arc::new(handler),
                connection_filters: RwLock::new(Vec::new()),
                sessions: DashMap::new(),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    pub fn config(&self) -> Option<&Arc<ServerConfig>> {
        self.inner.config.get()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.inner.handler
    }

    /// Connection filters are consulted in the order they were added.
    pub fn add_connection_filter<C: ConnectionFilter>(&self, filter: C) {
        self.inner.connection_filters.write().push(Arc::new(filter));
    }

    /// Validates `config` and builds the socket server. Fails on an empty or
    /// malformed listener list, leaving the server uninitialized.
    pub fn setup(&self, config: ServerConfig) -> AppResult<()> {
        self.inner
            .transition(ServerState::NotInitialized, ServerState::Initializing)?;

        let config = Arc::new(config);
        let socket_server = match SocketServer::new(config.clone()) {
            Ok(socket_server) => socket_server,
            Err(e) => {
                error!("failed to set up server: {}", e);
                self.inner.set_state(ServerState::NotInitialized);
                return Err(e);
            }
        };
        // only the winner of the transition above gets here
        let _ = self.inner.config.set(config);
        let _ = self.inner.socket_server.set(Arc::new(socket_server));

        self.inner.set_state(ServerState::NotStarted);
        debug!("server set up");
        Ok(())
    }

    /// Starts every listener and the idle sweeper. When a listener fails to
    /// start the ones already started are released and the server stays
    /// stopped.
    pub async fn start(&self) -> AppResult<()> {
        self.inner
            .transition(ServerState::NotStarted, ServerState::Starting)?;

        let (config, socket_server) = match (self.inner.config.get(), self.inner.socket_server.get()) {
            (Some(config), Some(socket_server)) => (config.clone(), socket_server.clone()),
            _ => {
                self.inner.set_state(ServerState::NotStarted);
                return Err(AppError::IllegalStateError("server is not set up".to_string()));
            }
        };

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let acceptor: Arc<dyn AcceptHandler> = Arc::new(Acceptor {
            inner: Arc::downgrade(&self.inner),
        });
        if let Err(e) = socket_server.start(acceptor, &notify_shutdown, &shutdown_complete_tx) {
            self.inner.set_state(ServerState::NotStarted);
            return Err(e);
        }

        if config.idle_session_timeout > 0 {
            tokio::spawn(run_idle_sweeper(
                Arc::downgrade(&self.inner),
                config.clear_idle_session_interval(),
                Shutdown::new(notify_shutdown.subscribe()),
                shutdown_complete_tx.clone(),
            ));
        }

        *self.inner.running.lock() = Some(Running {
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        });
        self.inner.set_state(ServerState::Running);
        self.inner.handler.on_started();
        info!("server started on {:?}", socket_server.local_addrs());
        Ok(())
    }

    /// Stops accepting, stops the idle sweeper and closes every session with
    /// [`CloseReason::ServerShutdown`], waiting up to the configured shutdown
    /// timeout for all of them to reach closed.
    pub async fn stop(&self) -> AppResult<()> {
        self.inner
            .transition(ServerState::Running, ServerState::Stopping)?;

        let running = self.inner.running.lock().take();
        if let Some(socket_server) = self.inner.socket_server.get() {
            socket_server.forget_listeners();
        }
        // listeners and the sweeper leave their loops before any session closes
        let drain = running.map(|running| {
            let _ = running.notify_shutdown.send(());
            (running.shutdown_complete_tx, running.shutdown_complete_rx)
        });

        let mut closing = JoinSet::new();
        for session in self.all_sessions() {
            closing.spawn(async move {
                session.close(CloseReason::ServerShutdown);
                session.wait_closed().await;
            });
        }

        let shutdown_timeout = self.inner.config.get().and_then(|c| c.shutdown_timeout());
        let wait_all = async move {
            while closing.join_next().await.is_some() {}
            if let Some((shutdown_complete_tx, mut shutdown_complete_rx)) = drain {
                drop(shutdown_complete_tx);
                // every receive loop has exited once all senders are gone
                let _ = shutdown_complete_rx.recv().await;
            }
        };

        match shutdown_timeout {
            Some(timeout) => {
                if time::timeout(timeout, wait_all).await.is_err() {
                    warn!(
                        "{} sessions were still open after {:?}, giving up on them",
                        self.inner.sessions.len(),
                        timeout
                    );
                }
            }
            None => wait_all.await,
        }

        self.inner.set_state(ServerState::NotStarted);
        self.inner.handler.on_stopped();
        info!("server stopped");
        Ok(())
    }

    pub fn session_by_id(&self, id: u64) -> Option<Arc<Session>> {
        self.inner.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn sessions<P>(&self, predicate: P) -> Vec<Arc<Session>>
    where
        P: Fn(&Session) -> bool,
    {
        self.inner
            .sessions
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions(|_| true)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Closes a session with [`CloseReason::ServerClosing`]. Returns `false`
    /// when no session has that id.
    pub fn close_session(&self, id: u64) -> bool {
        match self.session_by_id(id) {
            Some(session) => {
                session.close(CloseReason::ServerClosing);
                true
            }
            None => false,
        }
    }

    /// Addresses of the running listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .socket_server
            .get()
            .map(|socket_server| socket_server.local_addrs())
            .unwrap_or_default()
    }

    pub fn sending_queue_pool(&self) -> Option<SendingQueuePool> {
        self.inner
            .socket_server
            .get()
            .map(|socket_server| socket_server.queue_pool().clone())
    }

    /// Connections that can still be accepted before the limit is reached.
    pub fn available_connections(&self) -> usize {
        self.inner
            .socket_server
            .get()
            .map_or(0, |socket_server| socket_server.available_connections())
    }
}

impl<F, H> ServerInner<F, H>
where
    F: ReceiveFilterFactory,
    H: AppHandler<Message = <F::Filter as ReceiveFilter>::Message>,
{
    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ServerState, to: ServerState) -> AppResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| {
                AppError::IllegalStateError(format!(
                    "cannot move from {:?} to {:?}, server is {:?}",
                    from,
                    to,
                    ServerState::from_u8(current)
                ))
            })
    }

    fn accept_session(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        shutdown_complete_tx: &mpsc::Sender<()>,
    ) {
        if self.state() != ServerState::Running {
            debug!("server is not running, dropping connection from {}", remote);
            return;
        }
        let (Some(config), Some(socket_server)) = (self.config.get(), self.socket_server.get())
        else {
            return;
        };

        if let Some(filter) = self
            .connection_filters
            .read()
            .iter()
            .find(|filter| !filter.allow_connect(&remote))
        {
            info!("connection from {} refused by {}", remote, filter.name());
            return;
        }

        let Some(buffer) = socket_server.lease_buffer() else {
            error!(
                "max connection number {} reached, refusing {}",
                config.max_connection_number, remote
            );
            return;
        };

        if let Err(e) = socket_server.apply_socket_options(&stream) {
            warn!("failed to set socket options for {}: {}", remote, e);
        }

        let server = Arc::downgrade(self);
        let on_closed: ClosedCallback = Box::new(move |session, reason| {
            if let Some(server) = server.upgrade() {
                server.on_session_closed(session, reason);
            }
        });
        let (session, reader) = match Session::new(
            stream,
            config.send_timeout,
            socket_server.queue_pool().clone(),
            on_closed,
        ) {
            Ok(created) => created,
            Err(e) => {
                error!("failed to create session for {}: {}", remote, e);
                return;
            }
        };

        let filter = self.filter_factory.create_filter(config, &session, remote);
        if !self.register_session(&session) {
            return;
        }
        self.handler.on_new_session_connected(&session);
        info!(
            session_id = session.id(),
            remote = %remote,
            "new session connected, {} sessions total",
            self.sessions.len()
        );

        let receiver = Receiver::new(
            session.clone(),
            reader,
            buffer,
            filter,
            self.handler.clone(),
            config.max_request_length,
            shutdown_complete_tx.clone(),
        );
        tokio::spawn(receiver.run());

        // stop may have taken its snapshot of the registry meanwhile
        if self.state() != ServerState::Running {
            session.close(CloseReason::ServerShutdown);
        }
    }

    fn register_session(&self, session: &Arc<Session>) -> bool {
        let registered = match self.sessions.entry(session.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
                true
            }
        };
        if !registered {
            error!(session_id = session.id(), "session id is already registered");
            session.close(CloseReason::InternalError);
        }
        registered
    }

    fn on_session_closed(&self, session: &Arc<Session>, reason: CloseReason) {
        let removed = self
            .sessions
            .remove_if(&session.id(), |_, registered| Arc::ptr_eq(registered, session))
            .is_some();
        if !removed {
            return;
        }
        info!(
            session_id = session.id(),
            remote = %session.remote_addr(),
            "session closed: {}, {} sessions total",
            reason,
            self.sessions.len()
        );
        self.handler.on_session_closed(session, reason);
    }

    /// Closes every session idle for longer than the idle timeout and returns
    /// how many were closed.
    fn clear_idle_sessions(&self) -> usize {
        let Some(config) = self.config.get() else {
            return 0;
        };
        let idle_timeout = match chrono::Duration::from_std(config.idle_session_timeout()) {
            Ok(idle_timeout) => idle_timeout,
            Err(e) => {
                warn!("idle session timeout out of range: {}", e);
                return 0;
            }
        };
        let cutoff = Local::now() - idle_timeout;

        let idle = self
            .sessions
            .iter()
            .filter(|entry| entry.value().last_active() <= cutoff)
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        for session in &idle {
            session.close(CloseReason::Timeout);
        }
        if !idle.is_empty() {
            info!(
                "{} idle sessions closed, {} sessions total",
                idle.len(),
                self.sessions.len()
            );
        }
        idle.len()
    }
}

struct Acceptor<F, H> {
    inner: Weak<ServerInner<F, H>>,
}

impl<F, H> AcceptHandler for Acceptor<F, H>
where
    F: ReceiveFilterFactory,
    H: AppHandler<Message = <F::Filter as ReceiveFilter>::Message>,
{
    fn on_accepted(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        shutdown_complete_tx: &mpsc::Sender<()>,
    ) {
        if let Some(inner) = self.inner.upgrade() {
            inner.accept_session(stream, remote, shutdown_complete_tx);
        }
    }
}

async fn run_idle_sweeper<F, H>(
    inner: Weak<ServerInner<F, H>>,
    interval: Duration,
    mut shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
) where
    F: ReceiveFilterFactory,
    H: AppHandler<Message = <F::Filter as ReceiveFilter>::Message>,
{
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }
        let Some(server) = inner.upgrade() else {
            break;
        };
        server.clear_idle_sessions();
    }
    debug!("idle session sweeper exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Packet, PacketFilterFactory};
    use crate::service::ListenerConfig;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        connected: AtomicUsize,
        closed: Mutex<Vec<(u64, CloseReason)>>,
    }

    impl AppHandler for Recorder {
        type Message = Packet;

        fn handle(
            &self,
            session: &Arc<Session>,
            message: Packet,
        ) -> impl Future<Output = AppResult<()>> + Send {
            let session = session.clone();
            async move { session.send(message.reply().encode()).await }
        }

        fn on_new_session_connected(&self, _session: &Arc<Session>) {
            self.connected.fetch_add(1, Ordering::Relaxed);
        }

        fn on_session_closed(&self, session: &Arc<Session>, reason: CloseReason) {
            self.closed.lock().push((session.id(), reason));
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            listeners: vec![ListenerConfig {
                ip: "127.0.0.1".to_string(),
                port: 0,
                backlog: 5,
            }],
            ..Default::default()
        }
    }

    async fn wait_for<P: Fn() -> bool>(predicate: P) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_state_machine() -> AppResult<()> {
        let server = AppServer::new(PacketFilterFactory, Recorder::default());
        assert_eq!(server.state(), ServerState::NotInitialized);
        assert!(server.start().await.is_err());

        // a failed setup can be retried
        assert!(server.setup(ServerConfig::default()).is_err());
        assert_eq!(server.state(), ServerState::NotInitialized);

        server.setup(local_config())?;
        assert_eq!(server.state(), ServerState::NotStarted);
        assert!(server.setup(local_config()).is_err());
        assert!(server.stop().await.is_err());

        server.start().await?;
        assert_eq!(server.state(), ServerState::Running);
        assert!(server.start().await.is_err());

        server.stop().await?;
        assert_eq!(server.state(), ServerState::NotStarted);
        assert!(server.local_addrs().is_empty());

        // restartable
        server.start().await?;
        server.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_sweep_closes_only_idle_sessions() -> AppResult<()> {
        let server = AppServer::new(PacketFilterFactory, Recorder::default());
        server.setup(local_config())?;
        server.start().await?;
        let addr = server.local_addrs()[0];

        let _idle_client = TcpStream::connect(addr).await?;
        let _busy_client = TcpStream::connect(addr).await?;
        wait_for(|| server.session_count() == 2).await;

        let sessions = server.all_sessions();
        let (idle, busy) = (&sessions[0], &sessions[1]);
        idle.set_last_active(Local::now() - chrono::Duration::seconds(60));

        assert_eq!(server.inner.clear_idle_sessions(), 1);
        idle.wait_closed().await;
        assert_eq!(idle.state().close_reason(), Some(CloseReason::Timeout));
        assert!(busy.is_connected());

        wait_for(|| server.session_count() == 1).await;
        assert_eq!(
            *server.handler().closed.lock(),
            vec![(idle.id(), CloseReason::Timeout)]
        );

        server.stop().await?;
        assert_eq!(busy.state().close_reason(), Some(CloseReason::ServerShutdown));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_sweeper_closes_silent_session() -> AppResult<()> {
        let server = AppServer::new(PacketFilterFactory, Recorder::default());
        server.setup(ServerConfig {
            idle_session_timeout: 1,
            clear_idle_session_interval: 1,
            ..local_config()
        })?;
        server.start().await?;

        let _client = TcpStream::connect(server.local_addrs()[0]).await?;
        wait_for(|| server.session_count() == 1).await;
        let session = server.all_sessions().remove(0);

        // at most two ticks of the sweeper
        time::timeout(Duration::from_secs(5), session.wait_closed())
            .await
            .expect("idle sweeper never closed the session");
        assert_eq!(session.state().close_reason(), Some(CloseReason::Timeout));
        wait_for(|| server.session_count() == 0).await;
        assert_eq!(
            *server.handler().closed.lock(),
            vec![(session.id(), CloseReason::Timeout)]
        );

        server.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_signals_background_tasks_first() -> AppResult<()> {
        let server = AppServer::new(PacketFilterFactory, Recorder::default());
        server.setup(ServerConfig {
            clear_idle_session_interval: 1,
            shutdown_timeout: 0,
            ..local_config()
        })?;
        server.start().await?;
        let addr = server.local_addrs()[0];
        let _client = TcpStream::connect(addr).await?;
        wait_for(|| server.session_count() == 1).await;

        // with no timeout, stop only returns once the listener and the
        // sweeper have dropped their completion senders
        time::timeout(Duration::from_secs(3), server.stop())
            .await
            .expect("stop hung waiting for background tasks")?;
        assert!(server.local_addrs().is_empty());
        assert_eq!(
            server.handler().closed.lock().last().map(|(_, reason)| *reason),
            Some(CloseReason::ServerShutdown)
        );
        assert!(TcpStream::connect(addr).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_session_by_id() -> AppResult<()> {
        let server = AppServer::new(PacketFilterFactory, Recorder::default());
        server.setup(local_config())?;
        server.start().await?;

        let _client = TcpStream::connect(server.local_addrs()[0]).await?;
        wait_for(|| server.session_count() == 1).await;
        let session = server.all_sessions().remove(0);
        assert!(server.session_by_id(session.id()).is_some());
        assert_eq!(server.handler().connected.load(Ordering::Relaxed), 1);

        assert!(server.close_session(session.id()));
        session.wait_closed().await;
        assert_eq!(session.state().close_reason(), Some(CloseReason::ServerClosing));
        wait_for(|| server.session_count() == 0).await;
        assert!(!server.close_session(session.id()));

        server.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_max_connection_number() -> AppResult<()> {
        let server = AppServer::new(PacketFilterFactory, Recorder::default());
        server.setup(ServerConfig {
            max_connection_number: 1,
            ..local_config()
        })?;
        server.start().await?;
        let addr = server.local_addrs()[0];

        let _first = TcpStream::connect(addr).await?;
        wait_for(|| server.session_count() == 1).await;
        assert_eq!(server.available_connections(), 0);

        let mut second = TcpStream::connect(addr).await?;
        let mut buf = [0u8; 1];
        // refused connections are dropped right away
        let read = tokio::io::AsyncReadExt::read(&mut second, &mut buf).await;
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(server.session_count(), 1);

        server.stop().await?;
        Ok(())
    }
}
