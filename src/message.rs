//! A [`Message`] is a transient, cursor-based view over one pooled buffer.
//!  It provides typed little/big-endian push/pop primitives, the
//!  variable-length and string field encodings, the priority-derived
//!  message-id framing, and the header / appended-ack footer layout.
//!
//! Cursor discipline: `begin <= pos <= end <= capacity` holds at all times
//!  and is re-checked after every mutation. Pushes extend `end` and treat a
//!  capacity overrun as a programming error (the caller sizes messages via
//!  the pool); pops never read past `end` and fail with an error instead,
//!  since `end` is set from untrusted datagram lengths on the receive path.

use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, ensure};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::buffers::buffer_pool::{BufferPool, PooledBuffer};
use crate::config::StreamConfig;
use crate::message_id::{self, Priority};
use crate::safe_converter::SafeCast;
use crate::types::{Quaternion, Vector3, Vector3d, Vector4};
use crate::zerocode;

/// Flags byte at the start of every packet.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// body is run-length compressed (zero runs)
        const ZERO_CODE = 0x80;
        /// sender expects an acknowledgement
        const RELIABLE = 0x40;
        /// this packet is a retransmission
        const RESEND = 0x20;
        /// acknowledgements are appended to the packet tail
        const ACK = 0x10;
    }
}

/// flags byte + sequence number + extra-header length byte
pub const MESSAGE_HEADER_SIZE: usize = 6;
/// offset of the extra-header length byte within the header
pub const MESSAGE_EXTRA_HEADER_OFFSET: usize = 5;

/// Origin for [`Message::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// start of the buffer
    Begin,
    /// first byte after the header
    Body,
    /// current cursor position
    Current,
    /// start of the appended-ack footer
    Append,
    /// backwards from the end of valid data
    End,
}

pub struct Message {
    data: PooledBuffer,

    id: u32,
    priority: Priority,
    flags: MessageFlags,
    sequence: u32,
    age: Duration,

    begin: usize,
    pos: usize,
    end: usize,
}

impl Message {
    pub fn new(data: PooledBuffer, id: u32, flags: MessageFlags, sequence: u32) -> Message {
        Message {
            data,
            id,
            priority: Priority::of(id),
            flags,
            sequence,
            age: Duration::ZERO,
            begin: 0,
            pos: 0,
            end: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn age(&self) -> Duration {
        self.age
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
        self.priority = Priority::of(id);
    }

    pub fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    pub fn set_flags(&mut self, flags: MessageFlags) {
        self.flags = flags;
    }

    pub fn enable_flags(&mut self, flags: MessageFlags) {
        self.flags |= flags;
    }

    pub fn disable_flags(&mut self, flags: MessageFlags) {
        self.flags -= flags;
    }

    pub fn set_age(&mut self, age: Duration) {
        self.age = age;
    }

    pub fn grow_age(&mut self, elapsed: Duration) {
        self.age += elapsed;
    }

    /// Copy the flags field into the already-written header so that flag
    ///  mutations after framing (RESEND marking, ZERO_CODE fallback) reach
    ///  the wire.
    pub fn store_flags(&mut self) {
        if self.end > self.begin {
            self.data.as_mut_slice()[self.begin] = self.flags.bits();
        }
    }

    /// current cursor offset relative to `begin`
    pub fn position(&self) -> usize {
        self.pos - self.begin
    }

    /// number of valid bytes
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    /// capacity of the underlying pooled buffer
    pub fn buffer_size(&self) -> usize {
        self.data.capacity()
    }

    /// header length including the extra header bytes announced in it
    pub fn header_size(&self) -> usize {
        assert!(self.size() >= MESSAGE_HEADER_SIZE, "message has no complete header");
        MESSAGE_HEADER_SIZE + self.data.as_slice()[self.begin + MESSAGE_EXTRA_HEADER_OFFSET].safe_cast()
    }

    /// number of acknowledgements appended to the packet tail
    pub fn append_ack_count(&self) -> usize {
        if self.flags.contains(MessageFlags::ACK) && self.size() > 0 {
            self.data.as_slice()[self.end - 1].safe_cast()
        }
        else {
            0
        }
    }

    /// byte length of the appended-ack footer (4 bytes per ack + count byte)
    pub fn append_ack_len(&self) -> usize {
        match self.append_ack_count() {
            0 => 0,
            n => 4 * n + 1,
        }
    }

    /// body length: everything between header and appended-ack footer
    pub fn body_size(&self) -> usize {
        self.size() - self.header_size() - self.append_ack_len()
    }

    /// Declare the first `size` bytes of the buffer valid, e.g. after a
    ///  datagram was read into it.
    pub fn set_size(&mut self, size: usize) {
        assert!(self.begin + size <= self.data.capacity(), "size {} exceeds buffer capacity", size);
        self.end = self.begin + size;
        self.pos = self.pos.min(self.end);
        self.check_cursors();
    }

    /// Move the cursor. Returns the previous offset relative to `begin`.
    ///  Fails instead of panicking because seek targets are computed from
    ///  wire data on the receive path.
    pub fn seek(&mut self, offset: usize, whence: Whence) -> anyhow::Result<usize> {
        let prev = self.position();

        let target = match whence {
            Whence::Begin => self.begin.checked_add(offset),
            Whence::Body => self.begin.checked_add(self.header_size()).and_then(|p| p.checked_add(offset)),
            Whence::Current => self.pos.checked_add(offset),
            Whence::Append => self.end.checked_sub(self.append_ack_len()).and_then(|p| p.checked_add(offset)),
            Whence::End => self.end.checked_sub(offset),
        };

        match target {
            Some(pos) if pos <= self.data.capacity() => {
                self.pos = pos;
                self.end = self.end.max(self.pos);
                self.check_cursors();
                Ok(prev)
            }
            _ => bail!("seek target out of range (offset {} from {:?})", offset, whence),
        }
    }

    /// raw valid bytes, for handing to the transport
    pub fn read_buffer(&self) -> &[u8] {
        &self.data.as_slice()[self.begin..self.end]
    }

    /// the whole writable buffer, for reading a datagram into
    pub fn write_buffer(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = self.begin;
        self.end = self.begin;
    }

    fn check_cursors(&self) {
        assert!(self.begin <= self.pos, "cursor invariant violated: begin > pos");
        assert!(self.pos <= self.end, "cursor invariant violated: pos > end");
        assert!(self.end <= self.data.capacity(), "cursor invariant violated: end > capacity");
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
        self.end = self.end.max(self.pos);
        self.check_cursors();
    }

    /// Reserve `n` bytes at the cursor for writing and advance over them.
    ///  Overrunning the buffer is a caller bug: sizes are pre-validated via
    ///  `body_size()` / `buffer_size()`.
    fn push_chunk(&mut self, n: usize) -> &mut [u8] {
        assert!(self.pos + n <= self.data.capacity(),
                "message buffer overrun: {} bytes at offset {} exceed capacity {}",
                n, self.pos, self.data.capacity());
        let at = self.pos;
        self.advance(n);
        &mut self.data.as_mut_slice()[at..at + n]
    }

    /// Borrow `n` valid bytes at the cursor and advance over them.
    fn pop_chunk(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        ensure!(self.pos + n <= self.end,
                "message underrun: {} bytes requested at offset {}, {} available",
                n, self.position(), self.end - self.pos);
        let at = self.pos;
        self.advance(n);
        Ok(&self.data.as_slice()[at..at + n])
    }

    pub fn push_u8(&mut self, value: u8) {
        self.push_chunk(1).put_u8(value);
    }

    pub fn pop_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.pop_chunk(1)?.get_u8())
    }

    pub fn push_i8(&mut self, value: i8) {
        self.push_chunk(1).put_i8(value);
    }

    pub fn pop_i8(&mut self) -> anyhow::Result<i8> {
        Ok(self.pop_chunk(1)?.get_i8())
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push_u8(value.into());
    }

    pub fn pop_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.pop_u8()? != 0)
    }
}

/// Multi-byte scalar fields. The plain accessors use little-endian byte
///  order (the body payload default); the `_be` accessors are for the wire
///  framing, which is big-endian.
macro_rules! scalar_fields {
    ($ty:ty, $push:ident, $pop:ident, $put_le:ident, $get_le:ident, $push_be:ident, $pop_be:ident, $put_be:ident, $get_be:ident) => {
        impl Message {
            pub fn $push(&mut self, value: $ty) {
                self.push_chunk(std::mem::size_of::<$ty>()).$put_le(value);
            }

            pub fn $pop(&mut self) -> anyhow::Result<$ty> {
                Ok(self.pop_chunk(std::mem::size_of::<$ty>())?.$get_le())
            }

            pub fn $push_be(&mut self, value: $ty) {
                self.push_chunk(std::mem::size_of::<$ty>()).$put_be(value);
            }

            pub fn $pop_be(&mut self) -> anyhow::Result<$ty> {
                Ok(self.pop_chunk(std::mem::size_of::<$ty>())?.$get_be())
            }
        }
    };
}

scalar_fields!(u16, push_u16, pop_u16, put_u16_le, get_u16_le, push_u16_be, pop_u16_be, put_u16, get_u16);
scalar_fields!(u32, push_u32, pop_u32, put_u32_le, get_u32_le, push_u32_be, pop_u32_be, put_u32, get_u32);
scalar_fields!(u64, push_u64, pop_u64, put_u64_le, get_u64_le, push_u64_be, pop_u64_be, put_u64, get_u64);
scalar_fields!(i16, push_i16, pop_i16, put_i16_le, get_i16_le, push_i16_be, pop_i16_be, put_i16, get_i16);
scalar_fields!(i32, push_i32, pop_i32, put_i32_le, get_i32_le, push_i32_be, pop_i32_be, put_i32, get_i32);
scalar_fields!(i64, push_i64, pop_i64, put_i64_le, get_i64_le, push_i64_be, pop_i64_be, put_i64, get_i64);
scalar_fields!(f32, push_f32, pop_f32, put_f32_le, get_f32_le, push_f32_be, pop_f32_be, put_f32, get_f32);
scalar_fields!(f64, push_f64, pop_f64, put_f64_le, get_f64_le, push_f64_be, pop_f64_be, put_f64, get_f64);

impl Message {
    pub fn push_uuid(&mut self, value: &Uuid) {
        self.push_chunk(16).put_slice(value.as_bytes());
    }

    pub fn pop_uuid(&mut self) -> anyhow::Result<Uuid> {
        let bytes: [u8; 16] = self.pop_chunk(16)?.try_into().expect("chunk length checked");
        Ok(Uuid::from_bytes(bytes))
    }

    pub fn push_vector3(&mut self, value: Vector3) {
        self.push_f32(value.x);
        self.push_f32(value.y);
        self.push_f32(value.z);
    }

    pub fn pop_vector3(&mut self) -> anyhow::Result<Vector3> {
        Ok(Vector3::new(self.pop_f32()?, self.pop_f32()?, self.pop_f32()?))
    }

    pub fn push_vector3d(&mut self, value: Vector3d) {
        self.push_f64(value.x);
        self.push_f64(value.y);
        self.push_f64(value.z);
    }

    pub fn pop_vector3d(&mut self) -> anyhow::Result<Vector3d> {
        Ok(Vector3d::new(self.pop_f64()?, self.pop_f64()?, self.pop_f64()?))
    }

    pub fn push_vector4(&mut self, value: Vector4) {
        self.push_f32(value.x);
        self.push_f32(value.y);
        self.push_f32(value.z);
        self.push_f32(value.w);
    }

    pub fn pop_vector4(&mut self) -> anyhow::Result<Vector4> {
        Ok(Vector4::new(self.pop_f32()?, self.pop_f32()?, self.pop_f32()?, self.pop_f32()?))
    }

    /// Send the normalized vector part; the scalar component is implied by
    ///  unit length and reconstructed by the receiver.
    pub fn push_quaternion(&mut self, value: Quaternion) {
        let normalized = value.normalized();
        self.push_f32(normalized.x);
        self.push_f32(normalized.y);
        self.push_f32(normalized.z);
    }

    /// Reconstruct `w = sqrt(max(0, 1 - x^2 - y^2 - z^2))`. When the vector
    ///  part's square sum reaches 1 the subtraction is numerically unstable
    ///  as w approaches 0, so the result is renormalized instead. Non-finite
    ///  components decode as the identity rotation.
    pub fn pop_quaternion(&mut self) -> anyhow::Result<Quaternion> {
        let x = self.pop_f32()?;
        let y = self.pop_f32()?;
        let z = self.pop_f32()?;

        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return Ok(Quaternion::IDENTITY);
        }

        let square_sum = x * x + y * y + z * z;
        if square_sum < 1.0 {
            Ok(Quaternion::new(x, y, z, (1.0 - square_sum).sqrt()))
        }
        else {
            Ok(Quaternion::new(x, y, z, 0.0).normalized())
        }
    }

    pub fn push_ip_addr(&mut self, value: Ipv4Addr) {
        self.push_chunk(4).put_slice(&value.octets());
    }

    pub fn pop_ip_addr(&mut self) -> anyhow::Result<Ipv4Addr> {
        let octets: [u8; 4] = self.pop_chunk(4)?.try_into().expect("chunk length checked");
        Ok(Ipv4Addr::from(octets))
    }

    /// ports travel in network byte order
    pub fn push_ip_port(&mut self, value: u16) {
        self.push_u16_be(value);
    }

    pub fn pop_ip_port(&mut self) -> anyhow::Result<u16> {
        self.pop_u16_be()
    }

    /// Size prefix for a variable-length field, in the narrowest of 1, 2 or
    ///  4 bytes that fits the value.
    pub fn push_variable_size(&mut self, size: usize) {
        if size < 256 {
            self.push_u8(size as u8);
        }
        else if size < 65536 {
            self.push_u16_be(size as u16);
        }
        else {
            self.push_u32_be(size as u32);
        }
    }

    pub fn push_variable(&mut self, data: &[u8]) {
        self.push_variable_size(data.len());
        self.push_chunk(data.len()).put_slice(data);
    }

    /// variable-length field with a fixed one-byte size prefix
    pub fn pop_variable1(&mut self) -> anyhow::Result<Vec<u8>> {
        let size: usize = self.pop_u8()?.safe_cast();
        Ok(self.pop_chunk(size)?.to_vec())
    }

    /// variable-length field with a fixed two-byte size prefix
    pub fn pop_variable2(&mut self) -> anyhow::Result<Vec<u8>> {
        let size: usize = self.pop_u16_be()?.safe_cast();
        Ok(self.pop_chunk(size)?.to_vec())
    }

    /// `[size prefix][bytes][0x00]`, the prefix covering the terminator
    pub fn push_str(&mut self, value: &str) {
        self.push_variable_size(value.len() + 1);
        self.push_chunk(value.len()).put_slice(value.as_bytes());
        self.push_u8(0);
    }

    /// The string wire format does not say whether its size prefix is 1 or 2
    ///  bytes wide, so the decoder probes: for each candidate width it
    ///  checks whether the byte just past the implied payload is the NUL
    ///  terminator, narrowest first. If neither candidate matches, the
    ///  cursor stays where it was and an error is returned.
    pub fn pop_str(&mut self) -> anyhow::Result<String> {
        let data = self.data.as_slice();

        // 1-byte prefix: terminator at pos + size
        if let Some(&size1) = data.get(self.pos) {
            let size: usize = size1.safe_cast();
            if size >= 1 && self.pos + size < self.end && data[self.pos + size] == 0 {
                let text = String::from_utf8_lossy(&data[self.pos + 1..self.pos + size]).into_owned();
                self.advance(1 + size);
                return Ok(text);
            }
        }

        // 2-byte prefix: terminator at pos + 1 + size
        if self.pos + 1 < self.end {
            let size: usize = u16::from_be_bytes([data[self.pos], data[self.pos + 1]]).safe_cast();
            if size >= 1 && self.pos + 1 + size < self.end && data[self.pos + 1 + size] == 0 {
                let text = String::from_utf8_lossy(&data[self.pos + 2..self.pos + 1 + size]).into_owned();
                self.advance(2 + size);
                return Ok(text);
            }
        }

        bail!("string field has no terminator for either prefix width")
    }

    /// header framing: flags, sequence number, extra header length
    pub fn push_header(&mut self) {
        self.push_u8(self.flags.bits());
        self.push_u32_be(self.sequence);
        self.push_u8(0);
    }

    pub fn pop_header(&mut self) -> anyhow::Result<()> {
        let flags = self.pop_u8()?;
        let sequence = self.pop_u32_be()?;
        let extra = self.pop_u8()?;

        self.flags = MessageFlags::from_bits_retain(flags);
        self.sequence = sequence;
        self.advance_checked(extra.safe_cast())?;
        Ok(())
    }

    fn advance_checked(&mut self, n: usize) -> anyhow::Result<()> {
        ensure!(self.pos + n <= self.end, "cursor advance of {} runs past the valid data", n);
        self.advance(n);
        Ok(())
    }

    /// message id in its priority-derived variable-width encoding
    pub fn push_msg_id(&mut self) -> anyhow::Result<()> {
        let (bytes, len) = message_id::encode(self.id)?;
        self.push_chunk(len).put_slice(&bytes[..len]);
        Ok(())
    }

    pub fn pop_msg_id(&mut self) -> anyhow::Result<()> {
        let (id, priority, consumed) = message_id::decode(&self.data.as_slice()[self.pos..self.end])?;
        self.id = id;
        self.priority = priority;
        self.advance(consumed);
        Ok(())
    }

    /// repetition counter preceding a MULTIPLE or VARIABLE block
    pub fn push_block(&mut self, repetitions: u8) {
        self.push_u8(repetitions);
    }

    pub fn pop_block(&mut self) -> anyhow::Result<u8> {
        self.pop_u8()
    }

    /// Compress the body in place. When encoding would not shrink the body,
    ///  the ZERO_CODE flag is cleared instead and the body stays as it is.
    pub fn zero_encode(&mut self) {
        if !self.flags.contains(MessageFlags::ZERO_CODE) {
            return;
        }

        let header_size = self.header_size();
        let body_end = self.end - self.append_ack_len();
        let body = &self.data.as_slice()[self.begin + header_size..body_end];

        if body.is_empty() || zerocode::encoded_len(body, 0) >= body.len() {
            self.disable_flags(MessageFlags::ZERO_CODE);
            return;
        }

        let encoded = zerocode::encode(body, 0);
        let new_end = self.begin + header_size + encoded.len();
        self.data.as_mut_slice()[self.begin + header_size..new_end].copy_from_slice(&encoded);
        self.pos = self.pos.min(new_end);
        self.end = new_end;
        self.check_cursors();
    }

    /// Decompress the body in place and park the cursor at the body start,
    ///  ready for the deferred message-id parse. The ZERO_CODE flag is left
    ///  set; it describes the wire state of the packet.
    pub fn zero_decode(&mut self) -> anyhow::Result<()> {
        if !self.flags.contains(MessageFlags::ZERO_CODE) {
            return Ok(());
        }

        let header_size = self.header_size();
        let body_start = self.begin + header_size;
        ensure!(self.end >= body_start + 2, "zero-coded body is too short to decode");
        let decoded = zerocode::decode(&self.data.as_slice()[body_start..self.end], 0)?;

        let new_end = body_start + decoded.len();
        ensure!(new_end <= self.data.capacity(),
                "zero-decoded body of {} bytes exceeds the buffer capacity {}",
                decoded.len(), self.data.capacity());

        self.data.as_mut_slice()[body_start..new_end].copy_from_slice(&decoded);
        self.pos = body_start;
        self.end = new_end;
        self.check_cursors();
        Ok(())
    }

    /// Drop the appended-ack footer after it has been consumed, so that body
    ///  processing sees a clean extent.
    pub fn strip_append_acks(&mut self) {
        let footer = self.append_ack_len();
        if footer > 0 {
            self.end -= footer;
            self.pos = self.pos.min(self.end);
            self.disable_flags(MessageFlags::ACK);
            self.check_cursors();
        }
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message[id={:#x}, seq={}, flags={:?}, bytes=", self.id, self.sequence, self.flags)?;
        for byte in self.read_buffer() {
            write!(f, " {:02x}", byte)?;
        }
        write!(f, "]")
    }
}


/// Mints [`Message`]s over buffers acquired from an owned pool. Passed by
///  reference to whoever builds messages - there is no ambient global pool.
pub struct MessageFactory {
    pool: BufferPool,
    max_message_size: usize,
}

impl MessageFactory {
    pub fn new(config: &StreamConfig) -> MessageFactory {
        MessageFactory {
            pool: BufferPool::new(config.pool_size, config.max_message_size),
            max_message_size: config.max_message_size,
        }
    }

    /// a message over a default-capacity pooled buffer
    pub fn create(&self, id: u32, flags: MessageFlags) -> Message {
        self.create_sized(id, flags, self.max_message_size)
    }

    /// a message over a pooled buffer of at least `size` bytes
    pub fn create_sized(&self, id: u32, flags: MessageFlags, size: usize) -> Message {
        Message::new(self.pool.acquire(size), id, flags, 0)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}
