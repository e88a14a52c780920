//! A reliable-messaging protocol engine for a UDP-based virtual-world session
//!  ("circuit"). The engine encodes and decodes a compact, priority-tagged,
//!  optionally run-length-compressed binary packet format, manages a pool of
//!  reusable byte buffers, and implements reliability on top of unreliable UDP:
//!  acknowledgement tracking, retransmission, duplicate suppression and
//!  sequence windowing.
//!
//! ## Design goals
//!
//! * The engine owns the protocol, not the application: it consumes a
//!   "send bytes" / "receive bytes" transport abstraction plus a periodic
//!   timer tick, and exposes a subscribe-by-message-id callback interface and
//!   a set of outbound message builders.
//! * Message shapes are data, not code: a text template catalog describes
//!   every packet type (numeric id, priority class, blocks, typed variables)
//!   and is parsed once at startup. A missing or unparsable catalog degrades
//!   lookups instead of crashing the stream.
//! * Reliability is best-effort and transparent: reliable messages are
//!   retransmitted until acknowledged, inbound duplicates are suppressed
//!   within a bounded sequence window, and individual datagram loss is never
//!   surfaced to callers - only total connection failure is.
//! * All engine state lives on one event-processing task. `pump()` (datagram
//!   ready) and `tick()` (timer) both take `&mut self`, so there is no
//!   internal locking.
//!
//! ## Wire format
//!
//! Per packet, multi-byte integers big-endian unless noted (body payload
//! fields are little-endian):
//!
//! ```ascii
//! 0: flags (8 bits):
//!     * 0x80 ZERO_CODE - body is run-length compressed (zero runs)
//!     * 0x40 RELIABLE  - sender expects an acknowledgement
//!     * 0x20 RESEND    - this packet is a retransmission
//!     * 0x10 ACK       - acknowledgements are appended to the packet tail
//! 1: sequence number (u32 BE)
//! 5: extra header length (u8, always 0 in current use)
//! 6: message id - variable width, a prefix code over the priority class:
//!     * High:   1 byte,  0x00..=0xFE
//!     * Medium: 2 bytes, 0xFF00..=0xFFFE
//!     * Low:    4 bytes, 0xFFFF0000..=0xFFFFFEFF
//!     * Fixed:  4 bytes, 0xFFFFFF00..=0xFFFFFFFF
//! *: body - sequence of blocks per the packet template; MULTIPLE and
//!     VARIABLE blocks are preceded by a one-byte repetition count
//! *: if the ACK flag is set: N appended acks (u32 BE each) + 1 count byte
//! ```
//!
//! The dedicated acknowledgement packet uses the reserved Fixed id
//! `PacketAck`; its body is a one-byte count followed by that many u32
//! sequence numbers.
//!
//! When the ZERO_CODE flag is set, everything after the header is compressed
//! by replacing each run of zero bytes with the pair `(0, run_length)`; runs
//! longer than 255 are split. A body that would not shrink is sent
//! uncompressed with the flag cleared.

pub mod buffers;
pub mod config;
pub mod listener;
pub mod message;
pub mod message_id;
pub mod params;
pub mod safe_converter;
pub mod stream;
pub mod template;
pub mod transport;
pub mod types;
pub mod zerocode;
