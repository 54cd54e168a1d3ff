use tracing::warn;

use super::filter::{ensure_range, FilterState, Filtered, ReceiveFilter};
use crate::AppResult;

/// A message that always occupies the same number of bytes.
pub trait FixedSizeFormat: Send {
    type Message: Send + 'static;

    fn size(&self) -> usize;

    /// `data` is exactly `size()` bytes long.
    fn resolve(&mut self, data: &[u8]) -> AppResult<Self::Message>;
}

/// Frames fixed-size messages, accumulating short reads at the head of the
/// receive buffer until `size` bytes are available.
#[derive(Debug)]
pub struct FixedSizeReceiveFilter<F> {
    format: F,
    size: usize,
    parsed_length: usize,
    offset_delta: usize,
    state: FilterState,
}

impl<F: FixedSizeFormat> FixedSizeReceiveFilter<F> {
    pub fn new(format: F) -> Self {
        let size = format.size();
        FixedSizeReceiveFilter {
            format,
            size,
            parsed_length: 0,
            offset_delta: 0,
            state: FilterState::Normal,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn fail(&mut self) -> Filtered<F::Message> {
        self.state = FilterState::Error;
        Filtered::pending()
    }
}

impl<F: FixedSizeFormat> ReceiveFilter for FixedSizeReceiveFilter<F> {
    type Message = F::Message;

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
        // bytes kept from earlier reads sit right in front of `offset`
        let Some(start) = offset.checked_sub(self.parsed_length) else {
            warn!(
                "{} parsed bytes cannot precede offset {}",
                self.parsed_length, offset
            );
            return self.fail();
        };

        let available = self.parsed_length + length;
        if available >= self.size {
            let rest = available - self.size;
            let resolved = self.format.resolve(&buffer[start..start + self.size]);
            self.parsed_length = 0;
            self.offset_delta = 0;
            return match resolved {
                Ok(message) => Filtered {
                    message: Some(message),
                    rest,
                },
                Err(e) => {
                    warn!("failed to resolve fixed size message: {}", e);
                    self.fail()
                }
            };
        }

        // not enough yet: keep everything at the head so the next read
        // appends behind it
        if start != 0 {
            buffer.copy_within(start..offset + length, 0);
        }
        self.parsed_length = available;
        self.offset_delta = available;
        Filtered::pending()
    }

    fn left_buffer_size(&self) -> usize {
        self.parsed_length
    }

    fn offset_delta(&self) -> usize {
        self.offset_delta
    }

    fn state(&self) -> FilterState {
        self.state
    }

    fn reset(&mut self) {
        self.parsed_length = 0;
        self.offset_delta = 0;
        self.state = FilterState::Normal;
    }
}
