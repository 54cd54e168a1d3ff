use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tracing::{error, trace};

use super::Session;
use crate::pool::BufferLease;
use crate::protocol::{drain, Drained, ReceiveFilter};
use crate::service::{AppHandler, CloseReason};
use crate::{AppError, AppResult};

/// The receive side of one session. Reads into the session's leased buffer,
/// frames the bytes with the session's filter and hands every message to the
/// application handler before issuing the next read.
pub(crate) struct Receiver<F, H> {
    session: Arc<Session>,
    reader: OwnedReadHalf,
    buffer: BufferLease,
    filter: F,
    handler: Arc<H>,
    max_request_length: usize,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl<F, H> Receiver<F, H>
where
    F: ReceiveFilter,
    H: AppHandler<Message = F::Message>,
{
    pub(crate) fn new(
        session: Arc<Session>,
        reader: OwnedReadHalf,
        buffer: BufferLease,
        filter: F,
        handler: Arc<H>,
        max_request_length: usize,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        Receiver {
            session,
            reader,
            buffer,
            filter,
            handler,
            max_request_length,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Some(reason) = self.receive_loop().await {
            self.session.close(reason);
        }
        trace!(session_id = self.session.id(), "receive loop exited");
    }

    /// Returns the reason to close with, or `None` when the session is
    /// already closing.
    async fn receive_loop(&mut self) -> Option<CloseReason> {
        let mut offset_delta = 0;
        loop {
            if !self.session.begin_receive() {
                return None;
            }
            let read = tokio::select! {
                _ = self.session.shutdown_token().cancelled() => None,
                read = self.reader.read(&mut self.buffer[offset_delta..]) => Some(read),
            };
            self.session.end_receive();

            let length = match read {
                None => return None,
                Some(Ok(0)) => return Some(CloseReason::ClientClosing),
                Some(Ok(length)) => length,
                Some(Err(e)) => {
                    self.session.log_io_error(&e);
                    return Some(CloseReason::SocketError);
                }
            };

            let Drained { messages, error } = drain(
                &mut self.filter,
                &mut self.buffer,
                offset_delta,
                length,
                self.max_request_length,
            );

            for message in messages {
                if !self.session.is_connected() {
                    return None;
                }
                if let Err(e) = dispatch(&self.handler, &self.session, message).await {
                    error!(
                        session_id = self.session.id(),
                        remote = %self.session.remote_addr(),
                        "failed to handle request: {}",
                        e
                    );
                    return Some(CloseReason::ApplicationError);
                }
                self.session.touch();
            }

            if let Some(e) = error {
                error!(
                    session_id = self.session.id(),
                    remote = %self.session.remote_addr(),
                    "protocol error: {}",
                    e
                );
                return Some(CloseReason::ProtocolError);
            }

            offset_delta = self.filter.offset_delta();
            if offset_delta >= self.buffer.len() {
                error!(
                    session_id = self.session.id(),
                    "illegal offset delta {} for a receive buffer of {}",
                    offset_delta,
                    self.buffer.len()
                );
                return Some(CloseReason::ProtocolError);
            }
        }
    }
}

/// Runs the handler on its own task so a panic surfaces as an error instead
/// of unwinding through the receive loop.
async fn dispatch<H: AppHandler>(
    handler: &Arc<H>,
    session: &Arc<Session>,
    message: H::Message,
) -> AppResult<()> {
    let handler = handler.clone();
    let session = session.clone();
    let handled = tokio::spawn(async move { handler.handle(&session, message).await }).await;
    match handled {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
                message.to_string()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                "panic with a non-string payload".to_string()
            };
            Err(AppError::Application(format!("handler panicked: {}", message)))
        }
        Err(join_error) => Err(AppError::Application(join_error.to_string())),
    }
}
