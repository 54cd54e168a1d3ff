use std::net::SocketAddr;
use std::sync::Arc;

use crate::network::Session;
use crate::service::ServerConfig;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Normal,
    /// The stream is corrupt; the session has to be closed.
    Error,
}

/// Outcome of one filter pass.
#[derive(Debug)]
pub struct Filtered<M> {
    pub message: Option<M>,
    /// Bytes at the end of the input that were not consumed by this pass.
    pub rest: usize,
}

impl<M> Filtered<M> {
    pub fn pending() -> Self {
        Filtered {
            message: None,
            rest: 0,
        }
    }
}

/// Stateful framing of one inbound byte stream.
///
/// The receive loop reads into the session's receive buffer at
/// [`ReceiveFilter::offset_delta`] and calls `filter` with the freshly read
/// range `buffer[offset..offset + length]`. A filter may move the bytes it
/// keeps to the head of the buffer; the next read then lands behind them.
pub trait ReceiveFilter: Send {
    type Message: Send + 'static;

    fn filter(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Filtered<Self::Message>;

    /// Length of the message accumulated so far.
    fn left_buffer_size(&self) -> usize;

    /// Bytes kept at the head of the receive buffer.
    fn offset_delta(&self) -> usize;

    fn state(&self) -> FilterState;

    fn reset(&mut self);
}

/// Creates one filter per accepted session.
pub trait ReceiveFilterFactory: Send + Sync + 'static {
    type Filter: ReceiveFilter;

    fn create_filter(
        &self,
        config: &ServerConfig,
        session: &Arc<Session>,
        remote: SocketAddr,
    ) -> Self::Filter;
}

/// Messages framed from one read, plus the error that stopped the framing.
#[derive(Debug)]
pub struct Drained<M> {
    pub messages: Vec<M>,
    pub error: Option<AppError>,
}

/// Runs `filter` over one received range until it is fully consumed.
///
/// Messages framed before a protocol violation are still returned; the
/// violation itself ends the pass.
pub fn drain<F: ReceiveFilter>(
    filter: &mut F,
    buffer: &mut [u8],
    mut offset: usize,
    mut length: usize,
    max_request_length: usize,
) -> Drained<F::Message> {
    let mut messages = Vec::new();
    loop {
        let Filtered { message, rest } = filter.filter(buffer, offset, length);

        if filter.state() == FilterState::Error {
            return Drained {
                messages,
                error: Some(AppError::MalformedProtocol(
                    "receive filter entered error state".to_string(),
                )),
            };
        }

        let left = filter.left_buffer_size();
        if max_request_length > 0 && left > max_request_length {
            return Drained {
                messages,
                error: Some(AppError::MessageTooLarge(format!(
                    "{} bytes buffered, limit is {}",
                    left, max_request_length
                ))),
            };
        }

        if let Some(message) = message {
            messages.push(message);
        }

        if rest == 0 {
            return Drained {
                messages,
                error: None,
            };
        }
        offset = offset + length - rest;
        length = rest;
    }
}

pub(crate) fn ensure_range(buffer: &[u8], offset: usize, length: usize) -> AppResult<()> {
    if offset + length > buffer.len() {
        return Err(AppError::IllegalStateError(format!(
            "filter range {}..{} outside a buffer of {}",
            offset,
            offset + length,
            buffer.len()
        )));
    }
    Ok(())
}
