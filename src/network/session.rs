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

use std::fmt;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::state::{AtomicSessionState, SessionState};
use crate::pool::{SendingQueue, SendingQueuePool};
use crate::service::{is_ignorable_io_error, CloseReason};
use crate::{AppError, AppResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const MAX_SEND_BACKOFF: Duration = Duration::from_millis(64);

/// Runs once, when the session reaches closed.
pub(crate) type ClosedCallback = Box<dyn FnOnce(&Arc<Session>, CloseReason) + Send>;

/// One accepted connection: its state word, its active sending queue and the
/// write half of the socket. The read half belongs to the receive loop.
///
/// Sending never blocks the caller. [`Session::try_send`] appends to the
/// active queue; the first sender to find the session idle swaps in a fresh
/// queue and spawns a flush task for the old one, so at most one write is in
/// flight per session.
pub struct Session {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    start_time: DateTime<Local>,
    // millis since the epoch
    last_active: AtomicI64,
    state: AtomicSessionState,
    sending_queue: ArcSwapOption<SendingQueue>,
    queue_pool: SendingQueuePool,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    send_timeout: i64,
    runtime: Handle,
    socket_closed: AtomicBool,
    shutdown: CancellationToken,
    closed: CancellationToken,
    on_closed: Mutex<Option<ClosedCallback>>,
}

impl Session {
    /// Splits `stream` and takes an active sending queue from `queue_pool`.
    /// Returns the session and the read half for its receive loop.
    pub(crate) fn new(
        stream: TcpStream,
        send_timeout: i64,
        queue_pool: SendingQueuePool,
        on_closed: ClosedCallback,
    ) -> AppResult<(Arc<Session>, OwnedReadHalf)> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let runtime = Handle::try_current().map_err(|e| {
            AppError::IllegalStateError(format!("session created outside a runtime: {}", e))
        })?;
        let queue = queue_pool
            .try_get()
            .ok_or_else(|| AppError::Capacity("no sending queue available".to_string()))?;
        queue.start_enqueue();

        let (reader, writer) = stream.into_split();
        let start_time = Local::now();
        let session = Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            local_addr,
            remote_addr,
            start_time,
            last_active: AtomicI64::new(start_time.timestamp_millis()),
            state: AtomicSessionState::new(),
            sending_queue: ArcSwapOption::from(Some(queue)),
            queue_pool,
            writer: tokio::sync::Mutex::new(Some(writer)),
            send_timeout,
            runtime,
            socket_closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            on_closed: Mutex::new(Some(on_closed)),
        };
        Ok((Arc::new(session), reader))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn start_time(&self) -> DateTime<Local> {
        self.start_time
    }

    pub fn last_active(&self) -> DateTime<Local> {
        let millis = self.last_active.load(Ordering::Acquire);
        Local
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or(self.start_time)
    }

    pub(crate) fn touch(&self) {
        self.last_active
            .store(Local::now().timestamp_millis(), Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn set_last_active(&self, time: DateTime<Local>) {
        self.last_active
            .store(time.timestamp_millis(), Ordering::Release);
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Neither closing nor closed.
    pub fn is_connected(&self) -> bool {
        let state = self.state.load();
        !state.is_closing() && !state.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.state.load().is_closed()
    }

    /// Queues `data` without waiting. `false` means the session is closing,
    /// the queue is full, or it was swapped out underneath the caller.
    pub fn try_send(self: &Arc<Self>, data: Bytes) -> bool {
        self.enqueue_with(|queue, epoch| queue.enqueue(data, epoch))
    }

    /// Queues all of `items` into the same queue generation, or none of them.
    pub fn try_send_many(self: &Arc<Self>, items: &[Bytes]) -> bool {
        self.enqueue_with(|queue, epoch| queue.enqueue_many(items, epoch))
    }

    /// Like [`Session::try_send`], retrying with backoff while the send
    /// timeout allows.
    pub async fn send(self: &Arc<Self>, data: Bytes) -> AppResult<()> {
        self.send_with(|| self.try_send(data.clone())).await
    }

    pub async fn send_many(self: &Arc<Self>, items: &[Bytes]) -> AppResult<()> {
        self.send_with(|| self.try_send_many(items)).await
    }

    async fn send_with<F>(&self, mut attempt: F) -> AppResult<()>
    where
        F: FnMut() -> bool,
    {
        if !self.is_connected() {
            return Err(AppError::SessionClosed(self.id));
        }
        if attempt() {
            return Ok(());
        }
        match self.send_timeout {
            timeout if timeout < 0 => return Err(AppError::SendTimeout),
            0 => return Err(AppError::SendRejected),
            _ => {}
        }

        let deadline = Instant::now() + Duration::from_millis(self.send_timeout as u64);
        let mut delay = Duration::from_millis(1);
        while self.is_connected() {
            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::SendTimeout);
            }
            time::sleep(delay.min(deadline - now)).await;
            if attempt() {
                return Ok(());
            }
            delay = (delay * 2).min(MAX_SEND_BACKOFF);
        }
        Err(AppError::SessionClosed(self.id))
    }

    fn enqueue_with<F>(self: &Arc<Self>, enqueue: F) -> bool
    where
        F: FnOnce(&SendingQueue, u16) -> bool,
    {
        if !self.is_connected() {
            return false;
        }
        let Some(queue) = self.sending_queue.load_full() else {
            return false;
        };
        let epoch = queue.epoch();
        if !enqueue(&queue, epoch) {
            return false;
        }
        self.touch();
        self.start_send(queue, epoch);
        true
    }

    fn start_send(self: &Arc<Self>, queue: Arc<SendingQueue>, epoch: u16) {
        if !self.state.try_start_sending() {
            // the running flush picks the data up when it finishes
            return;
        }

        let current = self.sending_queue.load();
        let unchanged =
            matches!(&*current, Some(active) if Arc::ptr_eq(active, &queue)) && queue.epoch() == epoch;
        drop(current);
        if !unchanged || self.state.load().is_closing() {
            self.end_send_and_resume();
            return;
        }

        match self.swap_queue(&queue) {
            Ok(()) => {
                let session = self.clone();
                self.runtime.spawn(async move {
                    session.flush(queue).await;
                });
            }
            Err(reason) => self.end_send(reason),
        }
    }

    /// Makes a fresh pooled queue active in place of `queue` and freezes
    /// `queue` for writing.
    fn swap_queue(&self, queue: &Arc<SendingQueue>) -> Result<(), Option<CloseReason>> {
        let Some(new_queue) = self.queue_pool.try_get() else {
            error!(session_id = self.id, "no sending queue available");
            return Err(Some(CloseReason::InternalError));
        };

        let previous = self
            .sending_queue
            .compare_and_swap(queue, Some(new_queue.clone()));
        let swapped = matches!(&*previous, Some(previous) if Arc::ptr_eq(previous, queue));
        drop(previous);
        if !swapped {
            self.queue_pool.push(new_queue);
            if self.state.load().is_closing() {
                return Err(None);
            }
            error!(session_id = self.id, "failed to switch the sending queue");
            return Err(Some(CloseReason::InternalError));
        }

        new_queue.start_enqueue();
        queue.stop_enqueue();

        if queue.is_empty() {
            queue.clear();
            self.queue_pool.push(queue.clone());
            error!(session_id = self.id, "no data to be sent in the sending queue");
            return Err(Some(CloseReason::InternalError));
        }
        Ok(())
    }

    async fn flush(self: Arc<Self>, mut queue: Arc<SendingQueue>) {
        loop {
            let written = self.write_queue(&queue).await;
            queue.clear();
            self.queue_pool.push(queue);
            if let Err(reason) = written {
                self.end_send(reason);
                return;
            }

            let Some(next) = self.sending_queue.load_full() else {
                self.end_send(None);
                return;
            };
            if self.state.load().is_closing() {
                self.end_send(None);
                return;
            }

            if next.is_empty() {
                self.end_send_and_resume();
                return;
            }

            // keep the sending flag and go on with the next generation
            if let Err(reason) = self.swap_queue(&next) {
                self.end_send(reason);
                return;
            }
            queue = next;
        }
    }

    /// Writes every pending entry of `queue`, resuming after short writes.
    async fn write_queue(&self, queue: &SendingQueue) -> Result<(), Option<CloseReason>> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(None);
        };

        let mut pending = Vec::with_capacity(queue.len());
        loop {
            pending.clear();
            queue.collect_pending(&mut pending);
            let total: usize = pending.iter().map(Bytes::len).sum();
            if total == 0 {
                return Ok(());
            }

            let slices = pending
                .iter()
                .map(|item| IoSlice::new(item))
                .collect::<Vec<_>>();
            let written = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(None),
                written = writer.write_vectored(&slices) => written,
            };

            match written {
                Ok(0) => {
                    self.log_io_error(&io::Error::from(io::ErrorKind::WriteZero));
                    return Err(Some(CloseReason::SocketError));
                }
                Ok(n) if n < total => {
                    trace!(
                        session_id = self.id,
                        "{} of {} bytes was transferred, send the rest {} bytes now",
                        n,
                        total,
                        total - n
                    );
                    queue.trim(n);
                }
                Ok(_) => return Ok(()),
                Err(e) => {
                    self.log_io_error(&e);
                    return Err(Some(CloseReason::SocketError));
                }
            }
        }
    }

    /// Gives up the sending flag, then sends whatever a producer that lost
    /// the flag meanwhile left in the active queue.
    fn end_send_and_resume(self: &Arc<Self>) {
        self.end_send(None);
        if !self.is_connected() {
            return;
        }
        if let Some(next) = self.sending_queue.load_full() {
            if !next.is_empty() {
                let epoch = next.epoch();
                self.start_send(next, epoch);
            }
        }
    }

    fn end_send(self: &Arc<Self>, force_close: Option<CloseReason>) {
        let state = self.state.end_sending();
        match force_close {
            Some(reason) => self.close(reason),
            None if state.is_closing() => self.finalize(),
            None => {}
        }
    }

    /// Starts closing the session. Only the first call records its reason and
    /// shuts the socket down; the session reaches closed once no send or
    /// receive is in flight.
    pub fn close(self: &Arc<Self>, reason: CloseReason) {
        if self.state.start_closing(reason) {
            debug!(
                session_id = self.id,
                remote = %self.remote_addr,
                "closing session: {}",
                reason
            );
            self.shutdown_socket();
        }
        self.finalize();
    }

    fn shutdown_socket(&self) {
        if !self.socket_closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
        }
    }

    pub(crate) fn finalize(self: &Arc<Self>) {
        let Some(reason) = self.state.try_finalize() else {
            return;
        };

        // nothing is in flight, so the writer is free
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Some(queue) = self.sending_queue.swap(None) {
            queue.clear();
            self.queue_pool.push(queue);
        }

        let on_closed = self.on_closed.lock().take();
        if let Some(on_closed) = on_closed {
            on_closed(self, reason);
        }
        // waiters observe the session already unregistered
        self.closed.cancel();
    }

    /// Resolves once the session is closed.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn begin_receive(&self) -> bool {
        self.state.try_start_receiving()
    }

    pub(crate) fn end_receive(self: &Arc<Self>) {
        if self.state.end_receiving().is_closing() {
            self.finalize();
        }
    }

    /// Cancelled when the socket is shut down.
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn log_io_error(&self, err: &io::Error) {
        if !is_ignorable_io_error(err) {
            error!(
                session_id = self.id,
                remote = %self.remote_addr,
                "socket error: {}",
                err
            );
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("start_time", &self.start_time)
            .field("state", &self.state.load())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        trace!(session_id = self.id, "session dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{sending_queue_pool, PoolInfo};
    use std::thread;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    struct Fixture {
        session: Arc<Session>,
        _reader: OwnedReadHalf,
        client: TcpStream,
        pool: SendingQueuePool,
        closed: Arc<Mutex<Vec<CloseReason>>>,
    }

    async fn fixture(queue_size: usize, send_timeout: i64) -> Fixture {
        let (stream, client) = connected_pair().await;
        let pool = sending_queue_pool(4, 16, queue_size);
        let closed = Arc::new(Mutex::new(Vec::new()));
        let closed_clone = closed.clone();
        let (session, reader) = Session::new(
            stream,
            send_timeout,
            pool.clone(),
            Box::new(move |_, reason| closed_clone.lock().push(reason)),
        )
        .unwrap();
        Fixture {
            session,
            _reader: reader,
            client,
            pool,
            closed,
        }
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let mut fx = fixture(8, 1000).await;
        assert!(fx.session.try_send(Bytes::from_static(b"hello ")));
        assert!(fx
            .session
            .try_send_many(&[Bytes::from_static(b"wor"), Bytes::from_static(b"ld")]));

        let mut received = vec![0u8; 11];
        fx.client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"hello world");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ordered_delivery_under_backpressure() {
        let mut fx = fixture(4, 5000).await;
        let session = fx.session.clone();
        let sender = tokio::spawn(async move {
            for i in 0..500u32 {
                session.send(Bytes::from(format!("{:05};", i))).await.unwrap();
            }
        });

        let mut received = vec![0u8; 500 * 6];
        fx.client.read_exact(&mut received).await.unwrap();
        sender.await.unwrap();

        let expected = (0..500u32).map(|i| format!("{:05};", i)).collect::<String>();
        assert_eq!(String::from_utf8(received).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_try_send_rejects_when_queue_full() {
        let fx = fixture(2, 0).await;
        // pretend a flush is running so nothing drains the queue
        assert!(fx.session.state.try_start_sending());

        assert!(fx.session.try_send(Bytes::from_static(b"a")));
        assert!(fx.session.try_send(Bytes::from_static(b"b")));
        assert!(!fx.session.try_send(Bytes::from_static(b"c")));
        assert!(matches!(
            fx.session.send(Bytes::from_static(b"c")).await,
            Err(AppError::SendRejected)
        ));
    }

    #[tokio::test]
    async fn test_negative_send_timeout_fails_at_once() {
        let fx = fixture(1, -1).await;
        assert!(fx.session.state.try_start_sending());
        assert!(fx.session.try_send(Bytes::from_static(b"a")));
        assert!(matches!(
            fx.session.send(Bytes::from_static(b"b")).await,
            Err(AppError::SendTimeout)
        ));
    }

    #[tokio::test]
    async fn test_positive_send_timeout_waits() {
        let fx = fixture(1, 50).await;
        assert!(fx.session.state.try_start_sending());
        assert!(fx.session.try_send(Bytes::from_static(b"a")));

        let started = Instant::now();
        let result = fx.session.send(Bytes::from_static(b"b")).await;
        assert!(matches!(result, Err(AppError::SendTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let fx = fixture(4, 1000).await;
        fx.session.close(CloseReason::ServerClosing);
        assert!(!fx.session.try_send(Bytes::from_static(b"a")));
        assert!(matches!(
            fx.session.send(Bytes::from_static(b"a")).await,
            Err(AppError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_close_fires_once() {
        let fx = fixture(4, 1000).await;

        thread::scope(|s| {
            for reason in [
                CloseReason::ServerClosing,
                CloseReason::Timeout,
                CloseReason::ApplicationError,
                CloseReason::SocketError,
            ] {
                let session = fx.session.clone();
                s.spawn(move || session.close(reason));
            }
        });
        assert!(fx.session.shutdown_token().is_cancelled());

        fx.session.wait_closed().await;
        let closed = fx.closed.lock().clone();
        assert_eq!(closed.len(), 1);
        assert_eq!(fx.session.state().close_reason(), Some(closed[0]));

        // closing again changes nothing
        fx.session.close(CloseReason::Unknown);
        assert_eq!(fx.closed.lock().len(), 1);
        // the active queue went back to the pool
        assert_eq!(fx.pool.available_items_count(), fx.pool.total_items_count());
    }

    #[tokio::test]
    async fn test_close_waits_for_pending_receive() {
        let fx = fixture(4, 1000).await;
        assert!(fx.session.begin_receive());

        fx.session.close(CloseReason::ClientClosing);
        assert!(fx.session.state().is_closing());
        assert!(!fx.session.is_closed());
        assert!(fx.closed.lock().is_empty());
        assert!(fx.session.shutdown_token().is_cancelled());

        fx.session.end_receive();
        assert!(fx.session.is_closed());
        assert_eq!(*fx.closed.lock(), vec![CloseReason::ClientClosing]);
    }

    #[tokio::test]
    async fn test_peer_sees_eof_after_close() {
        let mut fx = fixture(4, 1000).await;
        fx.session.close(CloseReason::ServerClosing);
        let mut buf = [0u8; 8];
        let read = fx.client.read(&mut buf).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let a = fixture(1, 0).await;
        let b = fixture(1, 0).await;
        assert_ne!(a.session.id(), b.session.id());
        assert_eq!(
            a.session.last_active().timestamp_millis(),
            a.session.start_time().timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_stale_send_resumes_active_queue() {
        let mut fx = fixture(4, 1000).await;
        // a producer that lost the sending flag left data behind
        let active = fx.session.sending_queue.load_full().unwrap();
        assert!(active.enqueue(Bytes::from_static(b"y"), active.epoch()));

        // another producer wins the flag holding a queue that is no longer active
        let stale = Arc::new(SendingQueue::new(4));
        fx.session.start_send(stale, 1);

        let mut received = [0u8; 1];
        time::timeout(Duration::from_secs(2), fx.client.read_exact(&mut received))
            .await
            .expect("queued data was never flushed")
            .unwrap();
        assert_eq!(&received, b"y");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_deliver_everything() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 200;
        const ITEM_LEN: usize = 7;

        let mut fx = fixture(4, 5000).await;
        let producers = (0..PRODUCERS)
            .map(|p| {
                let session = fx.session.clone();
                tokio::spawn(async move {
                    for i in 0..PER_PRODUCER {
                        let item = Bytes::from(format!("{:02}{:04};", p, i));
                        if !session.try_send(item.clone()) {
                            session.send(item).await.unwrap();
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut received = vec![0u8; PRODUCERS * PER_PRODUCER * ITEM_LEN];
        time::timeout(Duration::from_secs(10), fx.client.read_exact(&mut received))
            .await
            .expect("not every accepted item reached the peer")
            .unwrap();
        for producer in producers {
            producer.await.unwrap();
        }

        // items never interleave and each producer's order is kept
        let mut next = [0usize; PRODUCERS];
        for item in received.chunks(ITEM_LEN) {
            let item = std::str::from_utf8(item).unwrap();
            assert!(item.ends_with(';'), "torn item {:?}", item);
            let producer: usize = item[..2].parse().unwrap();
            let seq: usize = item[2..6].parse().unwrap();
            assert_eq!(seq, next[producer]);
            next[producer] += 1;
        }
        assert!(next.iter().all(|&n| n == PER_PRODUCER));
    }
}
