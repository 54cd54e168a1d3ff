use bytes::{Bytes, BytesMut};
use tracing::warn;

use super::filter::{ensure_range, FilterState, Filtered, ReceiveFilter};
use super::fixed_size::{FixedSizeFormat, FixedSizeReceiveFilter};
use crate::AppResult;

/// A wire format made of a fixed-size header that declares the length of the
/// body following it.
pub trait HeaderFormat: Send {
    type Message: Send + 'static;

    fn header_size(&self) -> usize;

    fn body_length(&self, header: &[u8]) -> AppResult<usize>;

    fn resolve_message(&self, header: &[u8], body: &[u8]) -> AppResult<Self::Message>;
}

/// Copies the header out of the receive buffer.
#[derive(Debug)]
struct RawHeader {
    size: usize,
}

impl FixedSizeFormat for RawHeader {
    type Message = Bytes;

    fn size(&self) -> usize {
        self.size
    }

    fn resolve(&mut self, data: &[u8]) -> AppResult<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Two-stage framing: a fixed-size header, then a body whose length the
/// header declares.
///
/// A body that arrives within the same read as its header is resolved straight
/// from the receive buffer. One spread over several reads is collected in a
/// growable accumulator until complete.
pub struct FixedHeaderReceiveFilter<H> {
    format: H,
    header_filter: FixedSizeReceiveFilter<RawHeader>,
    header: Option<Bytes>,
    body_length: usize,
    body: BytesMut,
    max_request_length: usize,
    state: FilterState,
}

impl<H: HeaderFormat> FixedHeaderReceiveFilter<H> {
    /// `max_request_length` bounds header plus body; 0 disables the check.
    pub fn new(format: H, max_request_length: usize) -> Self {
        let header_filter = FixedSizeReceiveFilter::new(RawHeader {
            size: format.header_size(),
        });
        FixedHeaderReceiveFilter {
            format,
            header_filter,
            header: None,
            body_length: 0,
            body: BytesMut::new(),
            max_request_length,
            state: FilterState::Normal,
        }
    }

    pub fn format(&self) -> &H {
        &self.format
    }

    fn fail(&mut self) -> Filtered<H::Message> {
        self.state = FilterState::Error;
        Filtered::pending()
    }

    fn emit(&mut self, header: &[u8], body: &[u8], rest: usize) -> Filtered<H::Message> {
        match self.format.resolve_message(header, body) {
            Ok(message) => Filtered {
                message: Some(message),
                rest,
            },
            Err(e) => {
                warn!("failed to resolve message: {}", e);
                self.fail()
            }
        }
    }

    fn filter_header(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Filtered<H::Message> {
        let Filtered { message, rest } = self.header_filter.filter(buffer, offset, length);
        if self.header_filter.state() == FilterState::Error {
            return self.fail();
        }
        let Some(header) = message else {
            return Filtered::pending();
        };

        let body_length = match self.format.body_length(&header) {
            Ok(body_length) => body_length,
            Err(e) => {
                warn!("failed to read body length: {}", e);
                return self.fail();
            }
        };
        let request_length = header.len() + body_length;
        if self.max_request_length > 0 && request_length > self.max_request_length {
            warn!(
                "request of {} bytes exceeds the limit of {}",
                request_length, self.max_request_length
            );
            return self.fail();
        }

        let body_offset = offset + length - rest;
        if rest >= body_length {
            let body = &buffer[body_offset..body_offset + body_length];
            return self.emit(&header, body, rest - body_length);
        }

        // body continues in later reads
        self.body.clear();
        self.body.reserve(body_length);
        self.body
            .extend_from_slice(&buffer[body_offset..body_offset + rest]);
        self.body_length = body_length;
        self.header = Some(header);
        Filtered::pending()
    }

    fn filter_body(
        &mut self,
        buffer: &[u8],
        offset: usize,
        length: usize,
        header: Bytes,
    ) -> Filtered<H::Message> {
        let needed = self.body_length - self.body.len();
        if length < needed {
            self.body.extend_from_slice(&buffer[offset..offset + length]);
            self.header = Some(header);
            return Filtered::pending();
        }

        self.body.extend_from_slice(&buffer[offset..offset + needed]);
        let body = self.body.split().freeze();
        self.body_length = 0;
        self.emit(&header, &body, length - needed)
    }
}

impl<H: HeaderFormat> ReceiveFilter for FixedHeaderReceiveFilter<H> {
    type Message = H::Message;

    fn filter(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Filtered<Self::Message> {
        if let Err(e) = ensure_range(buffer, offset, length) {
            warn!("{}", e);
            return self.fail();
        }
        match self.header.take() {
            None => self.filter_header(buffer, offset, length),
            Some(header) => self.filter_body(buffer, offset, length, header),
        }
    }

    fn left_buffer_size(&self) -> usize {
        match &self.header {
            Some(header) => header.len() + self.body.len(),
            None => self.header_filter.left_buffer_size(),
        }
    }

    fn offset_delta(&self) -> usize {
        // a pending body lives in the accumulator, not in the receive buffer
        match self.header {
            Some(_) => 0,
            None => self.header_filter.offset_delta(),
        }
    }

    fn state(&self) -> FilterState {
        self.state
    }

    fn reset(&mut self) {
        self.header_filter.reset();
        self.header = None;
        self.body_length = 0;
        self.body.clear();
        self.state = FilterState::Normal;
    }
}
