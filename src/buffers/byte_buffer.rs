//! Fixed-capacity raw storage for one in-flight message. Buffers are owned
//!  by the pool and never resized; a message tracks its own valid-data
//!  cursors on top of the raw bytes.

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};

pub struct ByteBuffer {
    data: Box<[u8]>,
}

impl ByteBuffer {
    /// A new zero-filled buffer. In this use case there is no real benefit
    ///  in lazily initializing the storage since buffers are reused
    ///  aggressively, and we trade the one-off initialization for simplicity
    pub fn new(capacity: usize) -> ByteBuffer {
        ByteBuffer {
            data: vec![0; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

impl Debug for ByteBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteBuffer[capacity={}]", self.capacity())
    }
}

// The pool's free heap is ordered by capacity alone; buffer contents are
//  scratch and never compared.
impl PartialEq for ByteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.capacity() == other.capacity()
    }
}
impl Eq for ByteBuffer {}
impl PartialOrd for ByteBuffer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ByteBuffer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.capacity().cmp(&other.capacity())
    }
}
