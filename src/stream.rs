//! The reliable session stream ("circuit") over one UDP transport. This is
//!  where the protocol parts come together: outbound messages get sequence
//!  numbers, framing and optional zero-coding; reliable messages are
//!  retransmitted until acknowledged; inbound datagrams are deduplicated,
//!  acknowledged, decoded and dispatched to per-message-id subscribers.
//!
//! All state is owned by the stream and driven from one task: the owner
//!  calls [`pump`](CircuitStream::pump) when datagrams are ready and
//!  [`tick`](CircuitStream::tick) periodically (about every 100ms). Within
//!  one tick, resend processing runs before ack flushing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::listener::{MessageListener, SubscriberTable};
use crate::message::{Message, MessageFactory, MessageFlags, Whence, MESSAGE_HEADER_SIZE};
use crate::message_id::PACKET_ACK;
use crate::params::{SessionParameters, StreamParameters};
use crate::safe_converter::PrecheckedCast;
use crate::template::TemplateCatalog;
use crate::transport::Transport;

/// fractions of the throttle budget per traffic category: resend, land,
///  wind, cloud, task, texture, asset
const THROTTLE_FRACTIONS: [f32; 7] = [0.1, 0.1, 0.02, 0.02, 0.25, 0.26, 0.25];

pub struct CircuitStream<T: Transport> {
    config: Arc<StreamConfig>,
    transport: T,
    factory: MessageFactory,
    catalog: Option<TemplateCatalog>,
    subscribers: SubscriberTable,

    stream_params: StreamParameters,
    session_params: SessionParameters,

    connected: bool,
    send_sequence: u32,

    /// reliable messages awaiting an ack, keyed by sequence number
    resend_queue: BTreeMap<u32, Message>,
    /// inbound sequence numbers we still owe the peer an ack for
    pending_acks: BTreeSet<u32>,
    /// recently seen inbound sequence numbers, for duplicate suppression
    seen_sequences: BTreeSet<u32>,
    /// time since the last ack flush
    ack_age: Duration,
}

impl<T: Transport> CircuitStream<T> {
    pub fn new(transport: T, config: StreamConfig, catalog: Option<TemplateCatalog>) -> anyhow::Result<CircuitStream<T>> {
        config.validate()?;

        let factory = MessageFactory::new(&config);
        Ok(CircuitStream {
            config: Arc::new(config),
            transport,
            factory,
            catalog,
            subscribers: SubscriberTable::new(),
            stream_params: StreamParameters::default(),
            session_params: SessionParameters::default(),
            connected: false,
            send_sequence: 0,
            resend_queue: BTreeMap::new(),
            pending_acks: BTreeSet::new(),
            seen_sequences: BTreeSet::new(),
            ack_age: Duration::ZERO,
        })
    }

    pub fn set_stream_parameters(&mut self, params: StreamParameters) {
        self.stream_params = params;
    }

    pub fn set_session_parameters(&mut self, params: SessionParameters) {
        self.session_params = params;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Register a listener for one message id. Listeners are invoked
    ///  synchronously, in registration order, with the cursor at the start
    ///  of the message body.
    pub fn listen(&mut self, message_id: u32, listener: Box<dyn MessageListener>) {
        self.subscribers.listen(message_id, listener);
    }

    pub async fn connect(&mut self) -> anyhow::Result<()> {
        let host = self.session_params.sim_ip.clone();
        let port = self.session_params.sim_port;

        self.transport.connect(&host, port).await?;
        self.connected = true;
        info!("circuit to {}:{} is up", host, port);
        Ok(())
    }

    /// Tear the circuit down. Outstanding resend entries, pending acks and
    ///  the duplicate window are discarded.
    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.connected = false;
        self.resend_queue.clear();
        self.pending_acks.clear();
        self.seen_sequences.clear();
        self.ack_age = Duration::ZERO;

        self.transport.disconnect().await?;
        info!("circuit is down");
        Ok(())
    }

    /// Periodic timer entry point. `elapsed` is the time since the previous
    ///  tick; resend processing runs first, then ack flushing.
    pub async fn tick(&mut self, elapsed: Duration) -> anyhow::Result<()> {
        self.process_resend(elapsed).await?;
        self.process_acks(elapsed).await?;
        Ok(())
    }

    /// Datagram-ready entry point: drain and process everything the
    ///  transport has pending. Malformed datagrams are dropped, not errors.
    pub async fn pump(&mut self) -> anyhow::Result<()> {
        while self.transport.has_pending_datagrams() {
            let mut message = self.factory.create(0, MessageFlags::empty());
            let size = self.transport.read_datagram(message.write_buffer()).await?;

            if size <= MESSAGE_HEADER_SIZE {
                debug!("datagram of {} bytes is too short for a message - dropping", size);
                continue;
            }
            message.set_size(size);

            if let Err(e) = self.process_datagram(message).await {
                debug!("dropping malformed datagram: {:#}", e);
            }
        }
        Ok(())
    }

    async fn process_datagram(&mut self, mut message: Message) -> anyhow::Result<()> {
        message.pop_header()?;

        // the message id of a zero-coded packet is inside the compressed
        //  body; its parse is deferred until after decoding
        if !message.flags().contains(MessageFlags::ZERO_CODE) {
            message.pop_msg_id()?;
        }

        if !self.note_sequence(&message) {
            return Ok(());
        }

        // the dedicated ack packet is reliability bookkeeping, not payload;
        //  it is consumed here and never dispatched. It is never zero-coded.
        if message.id() == PACKET_ACK {
            let count = message.pop_block()?;
            trace!("dedicated ack packet with {} acks", count);
            for _ in 0..count {
                let sequence = message.pop_u32()?;
                self.acknowledge(sequence);
            }
            return Ok(());
        }

        if message.flags().contains(MessageFlags::RELIABLE) {
            self.pending_acks.insert(message.sequence());
        }

        if message.flags().contains(MessageFlags::ACK) {
            let count = message.append_ack_count();
            let prev = message.seek(0, Whence::Append)?;
            trace!("{} acks appended to packet tail", count);
            for _ in 0..count {
                let sequence = message.pop_u32_be()?;
                self.acknowledge(sequence);
            }
            message.seek(prev, Whence::Begin)?;
            message.strip_append_acks();
        }

        message.zero_decode()?;
        if message.flags().contains(MessageFlags::ZERO_CODE) {
            message.pop_msg_id()?;
        }

        let payload_offset = message.position();
        let listeners = self.subscribers.dispatch(&mut message, payload_offset);
        trace!("dispatched message {:#x} seq {} to {} listeners", message.id(), message.sequence(), listeners);
        Ok(())
    }

    /// Duplicate suppression: false means the sequence number was already
    ///  seen and the datagram must be dropped. A dropped resend is re-acked,
    ///  since our previous ack may have been lost.
    fn note_sequence(&mut self, message: &Message) -> bool {
        let sequence = message.sequence();

        if self.seen_sequences.contains(&sequence) {
            debug!("duplicate sequence {} - dropping", sequence);
            if message.flags().contains(MessageFlags::RESEND) {
                self.pending_acks.insert(sequence);
            }
            return false;
        }

        if self.seen_sequences.len() > 2 * self.config.sequence_window {
            // evict the oldest window's worth of entries
            if let Some(&pivot) = self.seen_sequences.iter().nth(self.config.sequence_window) {
                self.seen_sequences = self.seen_sequences.split_off(&pivot);
                trace!("sequence window evicted down to {} entries", self.seen_sequences.len());
            }
        }

        self.seen_sequences.insert(sequence);
        true
    }

    fn acknowledge(&mut self, sequence: u32) {
        if self.resend_queue.remove(&sequence).is_some() {
            trace!("sequence {} acknowledged", sequence);
        }
        else {
            debug!("ack for sequence {} which is not awaiting one", sequence);
        }
    }

    async fn process_resend(&mut self, elapsed: Duration) -> anyhow::Result<()> {
        let resend_age = self.config.resend_age;

        // destructure so the transport can write while the queue is borrowed
        let Self { transport, resend_queue, .. } = self;

        for message in resend_queue.values_mut() {
            if message.age() > resend_age {
                debug!("no ack for sequence {} within {:?} - resending", message.sequence(), resend_age);
                message.enable_flags(MessageFlags::RESEND);
                message.store_flags();
                transport.write(message.read_buffer()).await?;
                message.set_age(Duration::ZERO);
            }
            else {
                message.grow_age(elapsed);
            }
        }
        Ok(())
    }

    async fn process_acks(&mut self, elapsed: Duration) -> anyhow::Result<()> {
        self.ack_age += elapsed;

        if !self.pending_acks.is_empty() && self.ack_age > self.config.ack_flush_age {
            self.send_ack_packet().await?;
            self.ack_age = Duration::ZERO;
        }
        Ok(())
    }

    /// Flush up to `max_acks_per_packet` pending acks as a dedicated ack
    ///  packet; the rest wait for the next flush.
    async fn send_ack_packet(&mut self) -> anyhow::Result<()> {
        let count = self.pending_acks.len().min(self.config.max_acks_per_packet);

        let mut message = self.factory.create(PACKET_ACK, MessageFlags::empty());
        self.prepare_message(&mut message)?;

        message.push_block(count.prechecked_cast());
        for _ in 0..count {
            let sequence = self.pending_acks.pop_first()
                .expect("this is a bug: count is bounded by the set size");
            message.push_u32(sequence);
        }

        debug!("flushing {} acks ({} still pending)", count, self.pending_acks.len());
        self.send_message(message).await
    }

    /// Stamp the next sequence number and write the wire framing.
    fn prepare_message(&mut self, message: &mut Message) -> anyhow::Result<()> {
        self.send_sequence += 1;
        message.set_sequence(self.send_sequence);
        message.push_header();
        message.push_msg_id()
    }

    /// Common send path: zero-encode when requested (falling back to
    ///  uncompressed when that would not shrink the body), hand the bytes to
    ///  the transport, and keep reliable messages for resending.
    async fn send_message(&mut self, mut message: Message) -> anyhow::Result<()> {
        message.zero_encode();
        message.store_flags();

        let written = self.transport.write(message.read_buffer()).await?;
        trace!("sent message {:#x} seq {} ({} bytes)", message.id(), message.sequence(), written);

        if message.flags().contains(MessageFlags::RELIABLE) && !message.flags().contains(MessageFlags::RESEND) {
            message.set_age(Duration::ZERO);
            self.resend_queue.insert(message.sequence(), message);
        }
        Ok(())
    }

    /// Resolve a message id through the catalog and frame a fresh message.
    fn create_named(&mut self, name: &str, flags: MessageFlags) -> anyhow::Result<Message> {
        let id = match &self.catalog {
            Some(catalog) => catalog.by_name(name)
                .map(|info| info.id)
                .with_context(|| format!("no template entry for message {:?}", name))?,
            None => bail!("cannot resolve message {:?}: template catalog is unavailable", name),
        };

        let mut message = self.factory.create(id, flags);
        self.prepare_message(&mut message)?;
        Ok(message)
    }

    /// First message on a fresh circuit: claims it with the circuit code
    ///  issued at login.
    pub async fn send_use_circuit_code(&mut self) -> anyhow::Result<()> {
        let mut message = self.create_named("UseCircuitCode", MessageFlags::RELIABLE)?;

        message.push_u32(self.stream_params.circuit_code);
        message.push_uuid(&self.stream_params.session_id);
        message.push_uuid(&self.stream_params.agent_id);

        self.send_message(message).await
    }

    /// Tells the simulator the agent is ready to enter the region.
    pub async fn send_complete_agent_movement(&mut self) -> anyhow::Result<()> {
        let mut message = self.create_named("CompleteAgentMovement", MessageFlags::RELIABLE)?;

        message.push_uuid(&self.stream_params.agent_id);
        message.push_uuid(&self.stream_params.session_id);
        message.push_u32(self.stream_params.circuit_code);

        self.send_message(message).await
    }

    /// Distributes the configured bandwidth budget over the traffic
    ///  categories.
    pub async fn send_agent_throttle(&mut self) -> anyhow::Result<()> {
        let mut message = self.create_named("AgentThrottle", MessageFlags::RELIABLE)?;

        message.push_uuid(&self.stream_params.agent_id);
        message.push_uuid(&self.stream_params.session_id);
        message.push_u32(self.stream_params.circuit_code);

        message.push_u32(0); // throttle generation counter

        message.push_variable_size(THROTTLE_FRACTIONS.len() * 4);
        for fraction in THROTTLE_FRACTIONS {
            message.push_f32(self.config.max_bps * fraction);
        }

        self.send_message(message).await
    }

    pub async fn send_agent_wearables_request(&mut self) -> anyhow::Result<()> {
        let mut message = self.create_named("AgentWearablesRequest", MessageFlags::RELIABLE)?;

        message.push_uuid(&self.stream_params.agent_id);
        message.push_uuid(&self.stream_params.session_id);

        self.send_message(message).await
    }

    /// Free-form named method call with string parameters.
    pub async fn send_generic_message(&mut self, method: &str, params: &[String]) -> anyhow::Result<()> {
        let mut message = self.create_named("GenericMessage", MessageFlags::RELIABLE | MessageFlags::ZERO_CODE)?;

        message.push_uuid(&self.stream_params.agent_id);
        message.push_uuid(&self.stream_params.session_id);
        message.push_uuid(&Uuid::new_v4()); // TransactionID

        message.push_str(method);
        message.push_uuid(&Uuid::new_v4()); // InvoiceID

        message.push_block(params.len().prechecked_cast());
        for param in params {
            message.push_str(param);
        }

        self.send_message(message).await
    }

    pub async fn send_logout_request(&mut self) -> anyhow::Result<()> {
        let mut message = self.create_named("LogoutRequest", MessageFlags::empty())?;

        message.push_uuid(&self.stream_params.agent_id);
        message.push_uuid(&self.stream_params.session_id);

        self.send_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use rstest::rstest;
    use tokio::runtime::{Builder, Runtime};
    use super::*;
    use crate::transport::MockTransport;

    const TEMPLATE: &str = r#"
{ TestMessage High 7 NotTrusted Unencoded
    { TestBlock Single { Value U32 } }
}
{ UseCircuitCode Low 3 NotTrusted Unencoded
    { CircuitCode Single { Code U32 } { SessionID LLUUID } { ID LLUUID } }
}
{ CompleteAgentMovement Low 249 NotTrusted Unencoded
    { AgentData Single { AgentID LLUUID } { SessionID LLUUID } { CircuitCode U32 } }
}
{ AgentThrottle Low 81 NotTrusted Unencoded
    { AgentData Single { AgentID LLUUID } { SessionID LLUUID } { CircuitCode U32 } }
    { Throttle Single { GenCounter U32 } { Throttles Variable 1 } }
}
{ AgentWearablesRequest Low 381 NotTrusted Unencoded
    { AgentData Single { AgentID LLUUID } { SessionID LLUUID } }
}
{ GenericMessage Low 261 NotTrusted Unencoded
    { AgentData Single { AgentID LLUUID } { SessionID LLUUID } { TransactionID LLUUID } }
    { MethodData Single { Method Variable 1 } { Invoice LLUUID } }
    { ParamList Variable { Parameter Variable 1 } }
}
{ LogoutRequest Low 252 NotTrusted Unencoded
    { AgentData Single { AgentID LLUUID } { SessionID LLUUID } }
}
"#;

    const TEST_MESSAGE_ID: u32 = 7;

    fn catalog() -> Option<TemplateCatalog> {
        Some(TemplateCatalog::parse_str(TEMPLATE).unwrap())
    }

    fn params() -> StreamParameters {
        StreamParameters {
            agent_id: Uuid::from_bytes([1; 16]),
            session_id: Uuid::from_bytes([2; 16]),
            region_id: Uuid::from_bytes([3; 16]),
            circuit_code: 42,
        }
    }

    fn stream(transport: MockTransport) -> CircuitStream<MockTransport> {
        stream_with_config(transport, StreamConfig::default_circuit())
    }

    fn stream_with_config(transport: MockTransport, config: StreamConfig) -> CircuitStream<MockTransport> {
        let mut stream = CircuitStream::new(transport, config, catalog()).unwrap();
        stream.set_stream_parameters(params());
        stream.set_session_parameters(SessionParameters {
            sim_ip: "10.0.0.7".to_owned(),
            sim_port: 13000,
            ..SessionParameters::default()
        });
        stream
    }

    fn rt() -> Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    /// a wire-ready inbound datagram, built with the stream's own framing
    fn raw_datagram(id: u32, flags: MessageFlags, sequence: u32, body: &[u8]) -> Vec<u8> {
        let factory = MessageFactory::new(&StreamConfig::default_circuit());
        let mut m = factory.create(id, flags);
        m.set_sequence(sequence);
        m.push_header();
        m.push_msg_id().unwrap();
        for &byte in body {
            m.push_u8(byte);
        }
        m.zero_encode();
        m.store_flags();
        m.read_buffer().to_vec()
    }

    fn feed(stream: &mut CircuitStream<MockTransport>, datagram: &[u8]) -> anyhow::Result<()> {
        let mut message = stream.factory.create(0, MessageFlags::empty());
        message.write_buffer()[..datagram.len()].copy_from_slice(datagram);
        message.set_size(datagram.len());
        rt().block_on(stream.process_datagram(message))
    }

    fn count_listener(stream: &mut CircuitStream<MockTransport>, id: u32) -> Rc<RefCell<u32>> {
        let hits = Rc::new(RefCell::new(0));
        let hits_clone = hits.clone();
        stream.listen(id, Box::new(move |_m: &mut Message| {
            *hits_clone.borrow_mut() += 1;
        }));
        hits
    }

    #[test]
    fn test_connect_and_disconnect() {
        let mut transport = MockTransport::new();
        transport.expect_connect()
            .with(eq("10.0.0.7"), eq(13000))
            .once()
            .returning(|_, _| Ok(()));
        transport.expect_disconnect()
            .once()
            .returning(|| Ok(()));

        let mut stream = stream(transport);
        assert!(!stream.is_connected());

        rt().block_on(async {
            stream.connect().await.unwrap();
            assert!(stream.is_connected());

            stream.disconnect().await.unwrap();
            assert!(!stream.is_connected());
        });
    }

    #[test]
    fn test_connect_failure_stays_disconnected() {
        let mut transport = MockTransport::new();
        transport.expect_connect()
            .returning(|_, _| anyhow::bail!("host unreachable"));

        let mut stream = stream(transport);

        rt().block_on(async {
            assert!(stream.connect().await.is_err());
            assert!(!stream.is_connected());
        });
    }

    #[test]
    fn test_use_circuit_code_wire_shape() {
        let mut expected = vec![
            0x40,            // RELIABLE
            0, 0, 0, 1,      // first sequence number
            0,               // no extra header
            0xFF, 0xFF, 0, 3, // UseCircuitCode, Low 3
            42, 0, 0, 0,     // circuit code, little-endian
        ];
        expected.extend_from_slice(&[2; 16]); // session id
        expected.extend_from_slice(&[1; 16]); // agent id

        let mut transport = MockTransport::new();
        transport.expect_write()
            .withf(move |buf| buf == expected.as_slice())
            .once()
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        rt().block_on(stream.send_use_circuit_code()).unwrap();

        assert_eq!(stream.resend_queue.len(), 1);
    }

    #[test]
    fn test_complete_agent_movement_wire_shape() {
        let mut expected = vec![
            0x40,
            0, 0, 0, 1,
            0,
            0xFF, 0xFF, 0, 249,
        ];
        expected.extend_from_slice(&[1; 16]); // agent id
        expected.extend_from_slice(&[2; 16]); // session id
        expected.extend_from_slice(&[42, 0, 0, 0]);

        let mut transport = MockTransport::new();
        transport.expect_write()
            .withf(move |buf| buf == expected.as_slice())
            .once()
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        rt().block_on(stream.send_complete_agent_movement()).unwrap();
    }

    #[test]
    fn test_agent_throttle_wire_shape() {
        let mut expected = vec![
            0x40,
            0, 0, 0, 1,
            0,
            0xFF, 0xFF, 0, 81,
        ];
        expected.extend_from_slice(&[1; 16]);
        expected.extend_from_slice(&[2; 16]);
        expected.extend_from_slice(&[42, 0, 0, 0]);
        expected.extend_from_slice(&[0, 0, 0, 0]); // generation counter
        expected.push(28); // 7 floats
        for fraction in THROTTLE_FRACTIONS {
            expected.extend_from_slice(&(1_000_000.0f32 * fraction).to_le_bytes());
        }

        let mut transport = MockTransport::new();
        transport.expect_write()
            .withf(move |buf| buf == expected.as_slice())
            .once()
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        rt().block_on(stream.send_agent_throttle()).unwrap();
    }

    #[test]
    fn test_wearables_request_and_logout_wire_shape() {
        let mut sequence = Sequence::new();
        let mut transport = MockTransport::new();

        let mut expected_wearables = vec![0x40, 0, 0, 0, 1, 0, 0xFF, 0xFF, 1, 125];
        expected_wearables.extend_from_slice(&[1; 16]);
        expected_wearables.extend_from_slice(&[2; 16]);
        transport.expect_write()
            .withf(move |buf| buf == expected_wearables.as_slice())
            .once()
            .in_sequence(&mut sequence)
            .returning(|buf| Ok(buf.len()));

        // LogoutRequest is not reliable; flags stay clear
        let mut expected_logout = vec![0x00, 0, 0, 0, 2, 0, 0xFF, 0xFF, 0, 252];
        expected_logout.extend_from_slice(&[1; 16]);
        expected_logout.extend_from_slice(&[2; 16]);
        transport.expect_write()
            .withf(move |buf| buf == expected_logout.as_slice())
            .once()
            .in_sequence(&mut sequence)
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        rt().block_on(async {
            stream.send_agent_wearables_request().await.unwrap();
            stream.send_logout_request().await.unwrap();
        });

        // only the reliable message awaits an ack
        assert_eq!(stream.resend_queue.len(), 1);
        assert!(stream.resend_queue.contains_key(&1));
    }

    #[test]
    fn test_generic_message_sends_and_tracks() {
        let mut transport = MockTransport::new();
        transport.expect_write()
            .once()
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        rt().block_on(stream.send_generic_message("RexStartup", &["ready".to_owned()])).unwrap();

        assert_eq!(stream.resend_queue.len(), 1);
    }

    #[test]
    fn test_builders_fail_without_catalog() {
        let mut stream = CircuitStream::new(MockTransport::new(), StreamConfig::default_circuit(), None).unwrap();

        let result = rt().block_on(stream.send_use_circuit_code());

        assert!(result.is_err());
        assert!(stream.resend_queue.is_empty());
    }

    #[test]
    fn test_sequence_numbers_increment() {
        let mut transport = MockTransport::new();
        transport.expect_write()
            .times(3)
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        rt().block_on(async {
            stream.send_use_circuit_code().await.unwrap();
            stream.send_complete_agent_movement().await.unwrap();
            stream.send_agent_wearables_request().await.unwrap();
        });

        assert_eq!(stream.resend_queue.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_resend_until_acked() {
        let mut transport = MockTransport::new();
        // initial send: no RESEND flag
        transport.expect_write()
            .withf(|buf| buf[0] == 0x40)
            .times(1)
            .returning(|buf| Ok(buf.len()));
        // retransmissions carry the RESEND flag on the wire
        transport.expect_write()
            .withf(|buf| buf[0] == (0x40 | 0x20))
            .times(2)
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        rt().block_on(async {
            stream.send_use_circuit_code().await.unwrap();

            // ages past the 5s threshold, then retransmits on the next tick
            stream.tick(Duration::from_secs(6)).await.unwrap();
            stream.tick(Duration::from_secs(6)).await.unwrap();

            // age was reset; a short tick does not retransmit
            stream.tick(Duration::from_secs(1)).await.unwrap();

            // ages past the threshold again
            stream.tick(Duration::from_secs(6)).await.unwrap();
            stream.tick(Duration::from_secs(1)).await.unwrap();
        });

        assert_eq!(stream.resend_queue.len(), 1);
    }

    #[test]
    fn test_resend_stops_after_dedicated_ack() {
        let mut transport = MockTransport::new();
        transport.expect_write()
            .times(1)
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        rt().block_on(stream.send_use_circuit_code()).unwrap();
        assert_eq!(stream.resend_queue.len(), 1);

        // PacketAck body: count 1, then our sequence number little-endian
        let datagram = raw_datagram(PACKET_ACK, MessageFlags::empty(), 900, &[1, 1, 0, 0, 0]);
        feed(&mut stream, &datagram).unwrap();

        assert!(stream.resend_queue.is_empty());

        // nothing left to retransmit
        rt().block_on(stream.tick(Duration::from_secs(60))).unwrap();
    }

    #[test]
    fn test_dedicated_ack_is_not_dispatched() {
        let mut stream = stream(MockTransport::new());
        let hits = count_listener(&mut stream, PACKET_ACK);

        let datagram = raw_datagram(PACKET_ACK, MessageFlags::empty(), 900, &[1, 5, 0, 0, 0]);
        feed(&mut stream, &datagram).unwrap();

        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn test_inbound_dispatch() {
        let mut stream = stream(MockTransport::new());

        let payload = Rc::new(RefCell::new(None));
        let payload_clone = payload.clone();
        stream.listen(TEST_MESSAGE_ID, Box::new(move |m: &mut Message| {
            *payload_clone.borrow_mut() = Some(m.pop_u32().unwrap());
        }));

        let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::empty(), 17, &[9, 0, 0, 0]);
        feed(&mut stream, &datagram).unwrap();

        assert_eq!(*payload.borrow(), Some(9));
    }

    #[test]
    fn test_duplicate_sequence_dispatches_once() {
        let mut stream = stream(MockTransport::new());
        let hits = count_listener(&mut stream, TEST_MESSAGE_ID);

        let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::empty(), 17, &[9, 0, 0, 0]);
        feed(&mut stream, &datagram).unwrap();
        feed(&mut stream, &datagram).unwrap();

        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_reliable_inbound_is_ack_pending() {
        let mut stream = stream(MockTransport::new());

        let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::RELIABLE, 17, &[9, 0, 0, 0]);
        feed(&mut stream, &datagram).unwrap();

        assert_eq!(stream.pending_acks.iter().copied().collect::<Vec<_>>(), vec![17]);
    }

    #[test]
    fn test_duplicate_resend_is_reacked() {
        let mut stream = stream(MockTransport::new());
        let hits = count_listener(&mut stream, TEST_MESSAGE_ID);

        let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::RELIABLE, 17, &[9, 0, 0, 0]);
        feed(&mut stream, &datagram).unwrap();
        assert_eq!(*hits.borrow(), 1);

        // the peer resends; our first ack may have been lost
        stream.pending_acks.clear();
        let resend = raw_datagram(TEST_MESSAGE_ID, MessageFlags::RELIABLE | MessageFlags::RESEND, 17, &[9, 0, 0, 0]);
        feed(&mut stream, &resend).unwrap();

        assert_eq!(*hits.borrow(), 1);
        assert!(stream.pending_acks.contains(&17));
    }

    #[test]
    fn test_ack_flush_after_age() {
        let mut transport = MockTransport::new();
        transport.expect_write()
            .withf(|buf| {
                // PacketAck framing, then count 1 and sequence 17
                buf[6..10] == [0xFF, 0xFF, 0xFF, 0xFB] && buf[10] == 1 && buf[11..15] == [17, 0, 0, 0]
            })
            .once()
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);

        let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::RELIABLE, 17, &[9, 0, 0, 0]);
        feed(&mut stream, &datagram).unwrap();

        rt().block_on(async {
            // below the flush threshold: nothing is sent
            stream.tick(Duration::from_millis(100)).await.unwrap();
            // crosses it
            stream.tick(Duration::from_millis(500)).await.unwrap();
        });

        assert!(stream.pending_acks.is_empty());
    }

    #[test]
    fn test_ack_flush_caps_at_255() {
        let mut transport = MockTransport::new();
        transport.expect_write()
            .withf(|buf| buf[10] == 255)
            .once()
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        for sequence in 1..=300u32 {
            stream.pending_acks.insert(sequence);
        }

        rt().block_on(stream.tick(Duration::from_secs(1))).unwrap();

        assert_eq!(stream.pending_acks.len(), 45);
    }

    #[test]
    fn test_no_ack_flush_without_pending_acks() {
        let mut stream = stream(MockTransport::new());

        // no write expectation - any send would panic the mock
        rt().block_on(stream.tick(Duration::from_secs(10))).unwrap();
    }

    #[test]
    fn test_appended_acks_clear_resend_queue() {
        let mut transport = MockTransport::new();
        transport.expect_write()
            .times(2)
            .returning(|buf| Ok(buf.len()));

        let mut stream = stream(transport);
        rt().block_on(async {
            stream.send_use_circuit_code().await.unwrap();       // seq 1
            stream.send_complete_agent_movement().await.unwrap(); // seq 2
        });
        assert_eq!(stream.resend_queue.len(), 2);

        let hits = count_listener(&mut stream, TEST_MESSAGE_ID);

        // body, then footer: acks for 1 and 2 (big-endian) and their count
        let mut body = vec![9, 0, 0, 0];
        body.extend_from_slice(&[0, 0, 0, 1]);
        body.extend_from_slice(&[0, 0, 0, 2]);
        body.push(2);
        let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::ACK, 17, &body);
        feed(&mut stream, &datagram).unwrap();

        assert!(stream.resend_queue.is_empty());
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_zero_coded_round_trip_through_stream() {
        let mut stream = stream(MockTransport::new());

        let payload = Rc::new(RefCell::new(None));
        let payload_clone = payload.clone();
        stream.listen(TEST_MESSAGE_ID, Box::new(move |m: &mut Message| {
            *payload_clone.borrow_mut() = Some((m.pop_u32().unwrap(), m.pop_u64().unwrap()));
        }));

        // plenty of zero bytes, so the datagram really travels compressed
        let mut body = 5u32.to_le_bytes().to_vec();
        body.extend_from_slice(&0u64.to_le_bytes());
        let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::ZERO_CODE, 17, &body);
        assert!(datagram.len() < MESSAGE_HEADER_SIZE + 1 + body.len());
        assert_eq!(datagram[0], 0x80);

        feed(&mut stream, &datagram).unwrap();

        assert_eq!(*payload.borrow(), Some((5, 0)));
    }

    #[test]
    fn test_zero_code_fallback_on_incompressible_body() {
        let mut stream = stream(MockTransport::new());
        let hits = count_listener(&mut stream, TEST_MESSAGE_ID);

        // the body has no zero runs; the builder clears the flag
        let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::ZERO_CODE, 17, &[1, 2, 3, 4]);
        assert_eq!(datagram[0], 0x00);

        feed(&mut stream, &datagram).unwrap();
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_sequence_window_eviction_bounds_memory() {
        let config = StreamConfig {
            sequence_window: 4,
            ..StreamConfig::default_circuit()
        };
        let mut stream = stream_with_config(MockTransport::new(), config);

        for sequence in 1..=100u32 {
            let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::empty(), sequence, &[0, 0, 0, 0]);
            feed(&mut stream, &datagram).unwrap();
        }

        assert!(stream.seen_sequences.len() <= 2 * 4 + 1);
    }

    #[test]
    fn test_evicted_sequence_is_accepted_again() {
        let config = StreamConfig {
            sequence_window: 4,
            ..StreamConfig::default_circuit()
        };
        let mut stream = stream_with_config(MockTransport::new(), config);
        let hits = count_listener(&mut stream, TEST_MESSAGE_ID);

        for sequence in (1..=100u32).chain([1]) {
            let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::empty(), sequence, &[0, 0, 0, 0]);
            feed(&mut stream, &datagram).unwrap();
        }

        // sequence 1 left the window long ago, so its replay is dispatched
        //  again - the window bounds memory, not exactness
        assert_eq!(*hits.borrow(), 101);
    }

    #[test]
    fn test_pump_reads_all_pending() {
        let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::empty(), 17, &[9, 0, 0, 0]);
        let datagram2 = raw_datagram(TEST_MESSAGE_ID, MessageFlags::empty(), 18, &[9, 0, 0, 0]);

        let mut sequence = Sequence::new();
        let mut transport = MockTransport::new();
        for gram in [datagram, datagram2] {
            transport.expect_has_pending_datagrams()
                .times(1)
                .in_sequence(&mut sequence)
                .return_const(true);
            transport.expect_read_datagram()
                .times(1)
                .in_sequence(&mut sequence)
                .returning(move |buf| {
                    buf[..gram.len()].copy_from_slice(&gram);
                    Ok(gram.len())
                });
        }
        transport.expect_has_pending_datagrams()
            .times(1)
            .in_sequence(&mut sequence)
            .return_const(false);

        let mut stream = stream(transport);
        let hits = count_listener(&mut stream, TEST_MESSAGE_ID);

        rt().block_on(stream.pump()).unwrap();

        assert_eq!(*hits.borrow(), 2);
    }

    #[test]
    fn test_pump_drops_short_datagram() {
        let mut sequence = Sequence::new();
        let mut transport = MockTransport::new();
        transport.expect_has_pending_datagrams()
            .times(1)
            .in_sequence(&mut sequence)
            .return_const(true);
        transport.expect_read_datagram()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|buf| {
                buf[..4].copy_from_slice(&[1, 2, 3, 4]);
                Ok(4)
            });
        transport.expect_has_pending_datagrams()
            .times(1)
            .in_sequence(&mut sequence)
            .return_const(false);

        let mut stream = stream(transport);
        rt().block_on(stream.pump()).unwrap();

        assert!(stream.seen_sequences.is_empty());
    }

    #[test]
    fn test_disconnect_discards_reliability_state() {
        let mut transport = MockTransport::new();
        transport.expect_write()
            .times(1)
            .returning(|buf| Ok(buf.len()));
        transport.expect_disconnect()
            .once()
            .returning(|| Ok(()));

        let mut stream = stream(transport);
        rt().block_on(async {
            stream.send_use_circuit_code().await.unwrap();

            let datagram = raw_datagram(TEST_MESSAGE_ID, MessageFlags::RELIABLE, 17, &[9, 0, 0, 0]);
            let mut message = stream.factory.create(0, MessageFlags::empty());
            message.write_buffer()[..datagram.len()].copy_from_slice(&datagram);
            message.set_size(datagram.len());
            stream.process_datagram(message).await.unwrap();

            stream.disconnect().await.unwrap();
        });

        assert!(stream.resend_queue.is_empty());
        assert!(stream.pending_acks.is_empty());
        assert!(stream.seen_sequences.is_empty());
    }

    #[rstest]
    #[case::garbage_id(vec![0x00, 0, 0, 0, 5, 0, 0xFF])]
    #[case::truncated_ack_footer(vec![0x10, 0, 0, 0, 5, 0, 7, 200])]
    fn test_malformed_datagram_is_dropped(#[case] datagram: Vec<u8>) {
        let mut stream = stream(MockTransport::new());

        assert!(feed(&mut stream, &datagram).is_err());
    }
}
