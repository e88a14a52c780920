//! Pool of reusable fixed-capacity buffers. The free buffers live in a
//!  min-heap ordered by capacity so that a request is always satisfied by
//!  the smallest buffer that fits; lent-out buffers return to the heap
//!  automatically when their handle is dropped.
//!
//! The pool grows when asked for more capacity than any free buffer has -
//!  by allocating an additional buffer of exactly the requested size, never
//!  by resizing an existing one. All access happens on the engine's single
//!  event-processing task, so shared ownership is `Rc`-based.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use tracing::{debug, trace};

use crate::buffers::byte_buffer::ByteBuffer;

struct PoolInner {
    free: BinaryHeap<Reverse<ByteBuffer>>,
    lent: usize,
}

impl PoolInner {
    fn release(&mut self, buffer: ByteBuffer) {
        trace!("returning buffer of capacity {} to pool", buffer.capacity());
        self.lent -= 1;
        self.free.push(Reverse(buffer));
    }
}

pub struct BufferPool {
    inner: Rc<RefCell<PoolInner>>,
}

impl BufferPool {
    pub fn new(pool_size: usize, buffer_capacity: usize) -> BufferPool {
        let mut free = BinaryHeap::with_capacity(pool_size);
        for _ in 0..pool_size {
            free.push(Reverse(ByteBuffer::new(buffer_capacity)));
        }

        BufferPool {
            inner: Rc::new(RefCell::new(PoolInner { free, lent: 0 })),
        }
    }

    /// Lend out the smallest free buffer with at least `min_size` capacity,
    ///  first growing the pool by one buffer of exactly `min_size` if no
    ///  free buffer is big enough.
    pub fn acquire(&self, min_size: usize) -> PooledBuffer {
        let mut inner = self.inner.borrow_mut();

        let smallest_too_small = inner.free.peek()
            .map(|Reverse(buf)| buf.capacity() < min_size)
            .unwrap_or(true);
        if smallest_too_small {
            debug!("smallest free buffer is below {} bytes - growing the pool", min_size);
            inner.free.push(Reverse(ByteBuffer::new(min_size)));
        }

        let mut set_aside = Vec::new();
        let buffer = loop {
            let Reverse(buf) = inner.free.pop()
                .expect("this is a bug: an eligible buffer was just inserted");
            if buf.capacity() >= min_size {
                break buf;
            }
            set_aside.push(Reverse(buf));
        };
        for buf in set_aside {
            inner.free.push(buf);
        }

        inner.lent += 1;
        trace!("lending buffer of capacity {} ({} lent)", buffer.capacity(), inner.lent);

        PooledBuffer {
            buffer: Some(buffer),
            pool: self.inner.clone(),
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.borrow().free.len()
    }

    pub fn lent_count(&self) -> usize {
        self.inner.borrow().lent
    }

    #[cfg(test)]
    fn free_capacities(&self) -> Vec<usize> {
        let mut capacities = self.inner.borrow().free.iter()
            .map(|Reverse(buf)| buf.capacity())
            .collect::<Vec<_>>();
        capacities.sort();
        capacities
    }
}

/// Exclusive handle to one pooled buffer; dropping it puts the buffer back
///  into the pool's free heap.
pub struct PooledBuffer {
    buffer: Option<ByteBuffer>,
    pool: Rc<RefCell<PoolInner>>,
}

impl Deref for PooledBuffer {
    type Target = ByteBuffer;

    fn deref(&self) -> &ByteBuffer {
        self.buffer.as_ref().expect("this is a bug: buffer is only taken on drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut ByteBuffer {
        self.buffer.as_mut().expect("this is a bug: buffer is only taken on drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.borrow_mut().release(buffer);
        }
    }
}
