use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// One fixed-size cell carved out of a [`BufferManager`] slab.
///
/// The cell keeps its offset so it can be returned to the free list it came
/// from.
#[derive(Debug)]
pub struct ReceiveBuffer {
    offset: usize,
    data: BytesMut,
}

impl ReceiveBuffer {
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Deref for ReceiveBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for ReceiveBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Creates a single large buffer which is divided into equal cells, so that
/// per-connection receive buffers neither fragment the heap nor get allocated
/// per connection.
///
/// Not thread safe; the socket server keeps it behind a mutex.
#[derive(Debug)]
pub struct BufferManager {
    total_bytes: usize,
    buffer_size: usize,
    current_offset: usize,
    // not yet carved part of the slab
    remaining: BytesMut,
    free_buffers: Vec<ReceiveBuffer>,
}

impl BufferManager {
    pub fn new(total_bytes: usize, buffer_size: usize) -> Self {
        BufferManager {
            total_bytes,
            buffer_size,
            current_offset: 0,
            remaining: BytesMut::new(),
            free_buffers: Vec::new(),
        }
    }

    /// Allocates the backing slab.
    pub fn init_buffer(&mut self) {
        self.remaining = BytesMut::zeroed(self.total_bytes);
        self.current_offset = 0;
        self.free_buffers.clear();
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Cells that can still be handed out.
    pub fn available(&self) -> usize {
        self.free_buffers.len() + self.remaining.len() / self.buffer_size.max(1)
    }

    /// Hands out a cell, preferring recycled ones. Returns `None` once the slab
    /// is exhausted and nothing has been freed.
    pub fn set_buffer(&mut self) -> Option<ReceiveBuffer> {
        if let Some(buffer) = self.free_buffers.pop() {
            return Some(buffer);
        }
        if self.buffer_size == 0 || self.remaining.len() < self.buffer_size {
            return None;
        }
        let data = self.remaining.split_to(self.buffer_size);
        let offset = self.current_offset;
        self.current_offset += self.buffer_size;
        Some(ReceiveBuffer { offset, data })
    }

    pub fn free_buffer(&mut self, buffer: ReceiveBuffer) {
        debug_assert_eq!(buffer.data.len(), self.buffer_size);
        self.free_buffers.push(buffer);
    }
}

/// A cell checked out of a shared [`BufferManager`]; it goes back to the free
/// list when the lease is dropped.
#[derive(Debug)]
pub struct BufferLease {
    buffer: Option<ReceiveBuffer>,
    manager: Arc<Mutex<BufferManager>>,
}

impl BufferLease {
    pub fn acquire(manager: &Arc<Mutex<BufferManager>>) -> Option<BufferLease> {
        let buffer = manager.lock().set_buffer()?;
        Some(BufferLease {
            buffer: Some(buffer),
            manager: manager.clone(),
        })
    }
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.manager.lock().free_buffer(buffer);
        }
    }
}
