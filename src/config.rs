use std::time::Duration;
use anyhow::bail;

use crate::message::MESSAGE_HEADER_SIZE;

pub struct StreamConfig {
    /// Capacity of the buffers that the pool is pre-seeded with, and the
    ///  implied maximum size of a regular message. Oversized outbound
    ///  messages cause the pool to grow by dedicated larger buffers, but
    ///  inbound datagrams are read into regular buffers, so this must be at
    ///  least the peer's datagram size.
    pub max_message_size: usize,

    /// Number of buffers the pool is pre-seeded with. The pool grows beyond
    ///  this when more messages are in flight simultaneously.
    pub pool_size: usize,

    /// A reliable message that stays unacknowledged for longer than this is
    ///  retransmitted, once per interval, until acknowledged or the stream
    ///  is torn down.
    pub resend_age: Duration,

    /// Pending acknowledgements are batched and flushed as a dedicated ack
    ///  packet once their accumulated age exceeds this threshold. This
    ///  trades acknowledgement latency (and therefore spurious resends by
    ///  the peer) against packet overhead.
    pub ack_flush_age: Duration,

    /// Upper bound for acknowledgements in a single dedicated ack packet.
    ///  The wire format's count is a single byte, so this can never exceed
    ///  255; remaining acks wait for the next flush.
    pub max_acks_per_packet: usize,

    /// Size of the inbound duplicate-suppression window. The seen-sequence
    ///  set is capped at twice this value; when it overflows, the oldest
    ///  window's worth of entries is evicted.
    pub sequence_window: usize,

    /// The interval at which the owner is expected to call
    ///  [`tick`](crate::stream::CircuitStream::tick). Resend and ack aging
    ///  use the elapsed time passed into `tick`, so this is advisory.
    pub tick_interval: Duration,

    /// Upper bound for the blocking wait in `connect()`.
    pub connect_timeout: Duration,

    /// Total throttle budget in bits per second, distributed over the
    ///  traffic categories by the throttle builder.
    pub max_bps: f32,
}

impl StreamConfig {
    /// Defaults for a viewer-side circuit on an interactive connection.
    pub fn default_circuit() -> StreamConfig {
        StreamConfig {
            max_message_size: 2048,
            pool_size: 16,
            resend_age: Duration::from_secs(5),
            ack_flush_age: Duration::from_millis(500),
            max_acks_per_packet: 255,
            sequence_window: 256,
            tick_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(1),
            max_bps: 1_000_000.0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size <= MESSAGE_HEADER_SIZE {
            bail!("max message size {} does not leave room for a message body", self.max_message_size);
        }
        if self.pool_size == 0 {
            bail!("buffer pool must be seeded with at least one buffer");
        }
        if self.max_acks_per_packet == 0 || self.max_acks_per_packet > 255 {
            bail!("acks per packet must be in 1..=255, was {}", self.max_acks_per_packet);
        }
        if self.sequence_window == 0 {
            bail!("sequence window must not be empty");
        }
        Ok(())
    }
}
