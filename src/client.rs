//! # MQTT Session Client
//!
//! `MqttClient` owns one transport and speaks MQTT 3.1.1 over it: it connects,
//! subscribes, publishes and reads incoming packets one at a time with
//! [`MqttClient::poll`]. [`MqttClient::deliver`] is the background delivery
//! loop: it keeps the session alive and forwards matching messages into an
//! [`EventChannel`], from which a [`MessageStream`] receives them.
//!
//! ```ignore
//! let channel = EventChannel::<4>::new();
//! let mut client = MqttClient::<_, 4, 1024>::new(transport, MqttOptions::new("pump-7"));
//! client.connect().await?;
//! let mut stream = client.subscribe("sensors/#", QoS::AtLeastOnce, &channel).await?;
//! client.publish("sensors/pump-7", b"{}", QoS::AtMostOnce).await?;
//! match select(client.deliver(&channel), stream.next()).await { ... }
//! ```

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, with_timeout};
use heapless::Vec;

use crate::error::{ConnectReasonCode, MqttError, ProtocolError};
use crate::packet::{
    self, ConnAck, Connect, Disconnect, EncodePacket, MAX_FILTERS_PER_SUBSCRIBE, MqttPacket,
    PingReq, PubAck, Publish, QoS, SubAck, Subscribe,
};
use crate::topic::{Topic, TopicRegistry, to_topic};
use crate::transport::{MqttTransport, TransportError};
use crate::util::frame_length;

/// Largest inbound payload copied out of the receive buffer.
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Channel carrying deliveries from [`MqttClient::deliver`] to a [`MessageStream`].
pub type EventChannel<const DEPTH: usize> = Channel<NoopRawMutex, MqttEvent, DEPTH>;

/// Configuration for a [`MqttClient`].
#[derive(Debug, Clone, Copy)]
pub struct MqttOptions<'a> {
    client_id: &'a str,
    keep_alive: Duration,
    clean_session: bool,
    response_timeout: Duration,
}

impl<'a> MqttOptions<'a> {
    /// Options with a 60 s keep-alive, a clean session and a 10 s response timeout.
    pub fn new(client_id: &'a str) -> Self {
        Self {
            client_id,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            response_timeout: Duration::from_secs(10),
        }
    }

    /// Keep-alive interval. Zero disables PINGREQ.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// How long to wait for CONNACK and SUBACK.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn client_id(&self) -> &'a str {
        self.client_id
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }
}

/// A PUBLISH received on a subscribed filter, copied out of the session buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: Topic,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

/// A PUBLISH on a subscribed filter whose payload does not fit
/// [`MAX_PAYLOAD_LEN`]. Only its topic and size are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OversizedMessage {
    pub topic: Topic,
    pub len: usize,
}

/// What the delivery loop pushes into an [`EventChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Message(InboundMessage),
    Oversized(OversizedMessage),
    /// The session ended. Always the last event of a delivery loop.
    Closed,
}

/// Receiving side of a subscription.
///
/// Yields messages in arrival order and `None` once the session has closed.
/// A message too large to copy is yielded as an `Err` so the receiver can
/// tell it apart from one that never arrived.
pub struct MessageStream<'c, const DEPTH: usize> {
    channel: &'c EventChannel<DEPTH>,
    finished: bool,
}

impl<'c, const DEPTH: usize> MessageStream<'c, DEPTH> {
    pub fn new(channel: &'c EventChannel<DEPTH>) -> Self {
        Self {
            channel,
            finished: false,
        }
    }

    /// Waits for the next message, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<Result<InboundMessage, OversizedMessage>> {
        if self.finished {
            return None;
        }
        match self.channel.receive().await {
            MqttEvent::Message(message) => Some(Ok(message)),
            MqttEvent::Oversized(oversized) => Some(Err(oversized)),
            MqttEvent::Closed => {
                self.finished = true;
                None
            }
        }
    }

    /// Whether the end-of-stream marker has been received.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// An incoming packet, detached from the receive buffer.
enum Incoming {
    Publish {
        event: Option<MqttEvent>,
        ack: Option<u16>,
    },
    ConnAck(ConnAck),
    SubAck(SubAck),
    PubAck(u16),
    PingResp,
    Disconnect,
    Unexpected(u8),
}

/// The main MQTT client.
///
/// `MAX_TOPICS` bounds the number of subscribed filters and `BUF_SIZE` the
/// size of any single packet in either direction.
pub struct MqttClient<'a, T, const MAX_TOPICS: usize, const BUF_SIZE: usize>
where
    T: MqttTransport,
{
    transport: T,
    options: MqttOptions<'a>,
    registry: TopicRegistry<MAX_TOPICS>,
    tx_buffer: [u8; BUF_SIZE],
    rx_buffer: [u8; BUF_SIZE],
    rx_len: usize,
    next_packet_id: u16,
    last_sent: Instant,
    connected: bool,
}

impl<'a, T, const MAX_TOPICS: usize, const BUF_SIZE: usize> MqttClient<'a, T, MAX_TOPICS, BUF_SIZE>
where
    T: MqttTransport,
{
    pub fn new(transport: T, options: MqttOptions<'a>) -> Self {
        Self {
            transport,
            options,
            registry: TopicRegistry::new(),
            tx_buffer: [0; BUF_SIZE],
            rx_buffer: [0; BUF_SIZE],
            rx_len: 0,
            next_packet_id: 1,
            last_sent: Instant::now(),
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn options(&self) -> &MqttOptions<'a> {
        &self.options
    }

    /// Filters subscribed on this session.
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.registry.iter()
    }

    /// Opens the MQTT session: CONNECT, then wait for CONNACK.
    ///
    /// An empty client identifier is rejected before anything is sent.
    pub async fn connect(&mut self) -> Result<(), MqttError<T::Error>> {
        if self.options.client_id.is_empty() {
            return Err(MqttError::ConnectionRefused(
                ConnectReasonCode::IdentifierRejected,
            ));
        }

        let keep_alive = u16::try_from(self.options.keep_alive.as_secs()).unwrap_or(u16::MAX);
        let connect = Connect::new(
            self.options.client_id,
            keep_alive,
            self.options.clean_session,
        );
        self.send_packet(&connect).await?;
        debug!("CONNECT sent as {}", self.options.client_id);

        match self.await_response().await? {
            Incoming::ConnAck(ack) if ack.return_code == ConnectReasonCode::Success => {
                self.connected = true;
                debug!("CONNACK accepted, session present: {}", ack.session_present);
                Ok(())
            }
            Incoming::ConnAck(ack) => Err(MqttError::ConnectionRefused(ack.return_code)),
            _ => Err(MqttError::Protocol(ProtocolError::InvalidResponse)),
        }
    }

    /// Subscribes to one filter and returns the stream fed by [`Self::deliver`].
    pub async fn subscribe<'c, const DEPTH: usize>(
        &mut self,
        filter: &str,
        qos: QoS,
        channel: &'c EventChannel<DEPTH>,
    ) -> Result<MessageStream<'c, DEPTH>, MqttError<T::Error>> {
        self.subscribe_many(&[filter], qos, channel).await
    }

    /// Subscribes to several filters with a single SUBSCRIBE.
    ///
    /// Fails with [`ProtocolError::SubscriptionRejected`] unless the broker
    /// grants every filter.
    pub async fn subscribe_many<'c, const DEPTH: usize>(
        &mut self,
        filters: &[&str],
        qos: QoS,
        channel: &'c EventChannel<DEPTH>,
    ) -> Result<MessageStream<'c, DEPTH>, MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        if filters.is_empty() || filters.len() > MAX_FILTERS_PER_SUBSCRIBE {
            return Err(MqttError::Protocol(ProtocolError::TooManySubscriptions));
        }

        // Registered up front so retained messages that arrive ahead of the
        // SUBACK are matched and queued.
        let mut added: Vec<&str, MAX_FILTERS_PER_SUBSCRIBE> = Vec::new();
        for filter in filters {
            if self.registry.contains(filter) {
                continue;
            }
            if !self.registry.add_topic(filter) {
                self.unregister(&added);
                return Err(MqttError::Protocol(ProtocolError::TooManySubscriptions));
            }
            // Bounded by the length check above.
            let _ = added.push(*filter);
        }

        if let Err(e) = self.await_subscription(filters, qos, channel).await {
            self.unregister(&added);
            return Err(e);
        }
        for filter in filters {
            debug!("subscribed to {}", *filter);
        }
        Ok(MessageStream::new(channel))
    }

    async fn await_subscription<const DEPTH: usize>(
        &mut self,
        filters: &[&str],
        qos: QoS,
        channel: &EventChannel<DEPTH>,
    ) -> Result<(), MqttError<T::Error>> {
        let packet_id = self.next_packet_id();
        let mut topics = Vec::new();
        for filter in filters {
            let _ = topics.push((*filter, qos));
        }
        self.send_packet(&Subscribe { packet_id, topics }).await?;

        loop {
            match self.await_response().await? {
                Incoming::SubAck(ack) if ack.packet_id == packet_id => {
                    if !ack.all_granted(filters.len()) {
                        return Err(MqttError::Protocol(ProtocolError::SubscriptionRejected));
                    }
                    return Ok(());
                }
                Incoming::Publish { event, ack } => {
                    if let Some(id) = ack {
                        self.send_packet(&PubAck { packet_id: id }).await?;
                    }
                    if let Some(event) = event
                        && channel.try_send(event).is_err()
                    {
                        warn!("event channel full, dropping message received before SUBACK");
                    }
                }
                Incoming::PubAck(_) | Incoming::PingResp => {}
                _ => return Err(MqttError::Protocol(ProtocolError::InvalidResponse)),
            }
        }
    }

    fn unregister(&mut self, filters: &[&str]) {
        for filter in filters {
            self.registry.remove_topic(filter);
        }
    }

    /// Publishes a message. QoS 1 acknowledgments are consumed by [`Self::poll`].
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Result<(), MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        let packet_id = (qos != QoS::AtMostOnce).then(|| self.next_packet_id());
        let packet = Publish::new(topic, payload, qos, packet_id);
        self.send_packet(&packet).await?;
        debug!("published {} bytes to {}", payload.len(), topic);
        Ok(())
    }

    /// Reads and handles one incoming packet.
    ///
    /// Returns [`MqttEvent::Message`] or [`MqttEvent::Oversized`] when a
    /// PUBLISH matches a subscribed filter.
    pub async fn poll(&mut self) -> Result<Option<MqttEvent>, MqttError<T::Error>> {
        match self.read_incoming().await? {
            Incoming::Publish { event, ack } => {
                if let Some(id) = ack {
                    self.send_packet(&PubAck { packet_id: id }).await?;
                }
                Ok(event)
            }
            Incoming::PubAck(id) => {
                trace!("PUBACK {}", id);
                Ok(None)
            }
            Incoming::PingResp => {
                trace!("PINGRESP");
                Ok(None)
            }
            Incoming::Disconnect => {
                self.connected = false;
                Err(MqttError::Protocol(ProtocolError::ConnectionClosed))
            }
            Incoming::ConnAck(_) | Incoming::SubAck(_) => {
                warn!("ignoring late acknowledgment from broker");
                Ok(None)
            }
            Incoming::Unexpected(packet_type) => {
                warn!("ignoring unexpected packet type {}", packet_type);
                Ok(None)
            }
        }
    }

    /// Runs the session until it ends, forwarding messages into `channel`.
    ///
    /// Sends PINGREQ whenever the keep-alive interval passes without outgoing
    /// traffic. Transport read timeouts are not fatal. When the loop exits,
    /// [`MqttEvent::Closed`] is pushed so the stream reports end of stream.
    /// A clean close by the peer returns `Ok(())`.
    pub async fn deliver<const DEPTH: usize>(
        &mut self,
        channel: &EventChannel<DEPTH>,
    ) -> Result<(), MqttError<T::Error>> {
        let result = loop {
            if self.keep_alive_due()
                && let Err(e) = self.send_packet(&PingReq).await
            {
                break Err(e);
            }

            match self.poll().await {
                Ok(Some(event)) => channel.send(event).await,
                Ok(None) => {}
                Err(MqttError::Transport(e)) if e.is_timeout() => trace!("read timeout"),
                Err(MqttError::Transport(e)) if e.is_closed() => {
                    debug!("connection closed by broker");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        self.connected = false;
        channel.send(MqttEvent::Closed).await;
        result
    }

    /// Sends DISCONNECT if the session is open, then closes the transport.
    pub async fn disconnect(&mut self) -> Result<(), MqttError<T::Error>> {
        if self.connected {
            self.connected = false;
            // The broker may already be gone; closing the transport is what matters.
            if self.send_packet(&Disconnect).await.is_err() {
                debug!("DISCONNECT could not be sent");
            }
        }
        self.transport.close().await.map_err(MqttError::Transport)
    }

    /// Gives back the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }

    fn keep_alive_due(&self) -> bool {
        self.connected
            && self.options.keep_alive.as_ticks() > 0
            && self.last_sent.elapsed() >= self.options.keep_alive
    }

    async fn send_packet<P: EncodePacket>(&mut self, packet: &P) -> Result<(), MqttError<T::Error>> {
        let len = packet
            .encode(&mut self.tx_buffer)
            .map_err(MqttError::from_codec)?;
        self.transport
            .send(&self.tx_buffer[..len])
            .await
            .map_err(MqttError::Transport)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    async fn await_response(&mut self) -> Result<Incoming, MqttError<T::Error>> {
        let timeout = self.options.response_timeout;
        with_timeout(timeout, self.read_incoming())
            .await
            .map_err(|_| MqttError::Timeout)?
    }

    /// Reads one complete packet and converts it into an owned [`Incoming`].
    async fn read_incoming(&mut self) -> Result<Incoming, MqttError<T::Error>> {
        let len = loop {
            if let Some(len) =
                frame_length(&self.rx_buffer[..self.rx_len]).map_err(MqttError::from_codec)?
            {
                break len;
            }
            if self.rx_len == BUF_SIZE {
                return Err(MqttError::BufferTooSmall);
            }
            let n = self
                .transport
                .recv(&mut self.rx_buffer[self.rx_len..])
                .await
                .map_err(MqttError::Transport)?;
            self.rx_len += n;
        };

        let incoming = match packet::decode(&self.rx_buffer[..len]) {
            Ok(Some(packet)) => Ok(self.detach(packet)),
            Ok(None) => Err(MqttError::Protocol(ProtocolError::MalformedPacket)),
            Err(e) => Err(MqttError::from_codec(e)),
        };

        self.rx_buffer.copy_within(len..self.rx_len, 0);
        self.rx_len -= len;
        incoming
    }

    fn detach(&self, packet: MqttPacket<'_>) -> Incoming {
        match packet {
            MqttPacket::Publish(publish) => {
                let ack = match publish.qos {
                    QoS::AtMostOnce => None,
                    _ => publish.packet_id,
                };
                let event = if self.registry.matches(publish.topic) {
                    copy_message(&publish)
                } else {
                    debug!("dropping message on unsubscribed topic {}", publish.topic);
                    None
                };
                Incoming::Publish { event, ack }
            }
            MqttPacket::ConnAck(ack) => Incoming::ConnAck(ack),
            MqttPacket::SubAck(ack) => Incoming::SubAck(ack),
            MqttPacket::PubAck(ack) => Incoming::PubAck(ack.packet_id),
            MqttPacket::PingResp => Incoming::PingResp,
            MqttPacket::Disconnect => Incoming::Disconnect,
            MqttPacket::Connect(_) => Incoming::Unexpected(1),
            MqttPacket::Subscribe(_) => Incoming::Unexpected(8),
            MqttPacket::PingReq => Incoming::Unexpected(12),
        }
    }
}

fn copy_message(publish: &Publish<'_>) -> Option<MqttEvent> {
    let Some(topic) = to_topic(publish.topic) else {
        warn!("dropping message, topic too long");
        return None;
    };
    let Ok(payload) = Vec::from_slice(publish.payload) else {
        warn!(
            "{} byte message on {} exceeds the payload buffer",
            publish.payload.len(),
            publish.topic
        );
        return Some(MqttEvent::Oversized(OversizedMessage {
            topic,
            len: publish.payload.len(),
        }));
    };
    Some(MqttEvent::Message(InboundMessage { topic, payload }))
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::error::ConnectionError;
    use crate::test_support::{ScriptedTransport, connack, publish, suback};
    use embassy_futures::block_on;

    type Client<'a> = MqttClient<'a, ScriptedTransport, 4, 512>;

    #[test]
    fn connect_sends_connect_and_accepts_connack() {
        let transport = ScriptedTransport::new(&[connack(0)]);
        let mut client = Client::new(transport, MqttOptions::new("pump-7"));

        block_on(client.connect()).unwrap();
        assert!(client.is_connected());

        let sent = client.into_transport().sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], 0x10);
    }

    #[test]
    fn refused_connack_is_reported() {
        let transport = ScriptedTransport::new(&[connack(5)]);
        let mut client = Client::new(transport, MqttOptions::new("pump-7"));

        let err = ConnectionError::from(block_on(client.connect()).unwrap_err());
        assert_eq!(err, ConnectionError::Refused(ConnectReasonCode::NotAuthorized));
        assert!(!client.is_connected());
    }

    #[test]
    fn empty_client_id_is_rejected_before_io() {
        let transport = ScriptedTransport::new(&[connack(0)]);
        let mut client = Client::new(transport, MqttOptions::new(""));

        assert!(matches!(
            block_on(client.connect()),
            Err(MqttError::ConnectionRefused(ConnectReasonCode::IdentifierRejected))
        ));
        assert!(client.into_transport().sent_packets().is_empty());
    }

    #[test]
    fn rejected_suback_fails_subscription() {
        let transport = ScriptedTransport::new(&[connack(0), suback(1, &[0x80])]);
        let mut client = Client::new(transport, MqttOptions::new("pump-7"));
        let channel = EventChannel::<2>::new();

        block_on(async {
            client.connect().await.unwrap();
            let result = client.subscribe("a/b", QoS::AtLeastOnce, &channel).await;
            assert!(matches!(
                result,
                Err(MqttError::Protocol(ProtocolError::SubscriptionRejected))
            ));
        });
    }

    #[test]
    fn partially_granted_suback_fails_and_unregisters() {
        let transport = ScriptedTransport::new(&[connack(0), suback(1, &[0x01])]);
        let mut client = Client::new(transport, MqttOptions::new("pump-7"));
        let channel = EventChannel::<2>::new();

        block_on(async {
            client.connect().await.unwrap();
            let result = client
                .subscribe_many(&["a/accepted", "a/rejected"], QoS::AtLeastOnce, &channel)
                .await;
            assert!(matches!(
                result,
                Err(MqttError::Protocol(ProtocolError::SubscriptionRejected))
            ));
        });
        assert_eq!(client.subscriptions().count(), 0);
    }

    #[test]
    fn retained_message_before_suback_is_queued() {
        let transport = ScriptedTransport::new(&[
            connack(0),
            publish("a/b", b"retained", Some(3)),
            suback(1, &[0x01]),
        ]);
        let mut client = Client::new(transport, MqttOptions::new("pump-7"));
        let channel = EventChannel::<2>::new();

        block_on(async {
            client.connect().await.unwrap();
            let mut stream = client.subscribe("a/b", QoS::AtLeastOnce, &channel).await.unwrap();
            let message = stream.next().await.unwrap().unwrap();
            assert_eq!(message.payload.as_slice(), b"retained");
        });
        assert_eq!(client.subscriptions().collect::<std::vec::Vec<_>>(), ["a/b"]);
    }

    #[test]
    fn oversized_payload_is_reported_not_dropped() {
        let payload = [b'x'; MAX_PAYLOAD_LEN + 76];
        let transport = ScriptedTransport::new(&[
            connack(0),
            suback(1, &[0x01]),
            publish("a/b", &payload, None),
        ]);
        let mut client = MqttClient::<_, 4, 2048>::new(transport, MqttOptions::new("pump-7"));
        let channel = EventChannel::<4>::new();

        block_on(async {
            client.connect().await.unwrap();
            let mut stream = client.subscribe("a/b", QoS::AtLeastOnce, &channel).await.unwrap();
            client.deliver(&channel).await.unwrap();

            let oversized = stream.next().await.unwrap().unwrap_err();
            assert_eq!(oversized.topic.as_str(), "a/b");
            assert_eq!(oversized.len, MAX_PAYLOAD_LEN + 76);
            assert!(stream.next().await.is_none());
        });
    }

    #[test]
    fn deliver_forwards_matching_messages_then_closes() {
        let transport = ScriptedTransport::new(&[
            connack(0),
            suback(1, &[0x01]),
            publish("other/topic", b"ignored", None),
            publish("a/b", b"hello", Some(7)),
        ]);
        let mut client = Client::new(transport, MqttOptions::new("pump-7"));
        let channel = EventChannel::<4>::new();

        block_on(async {
            client.connect().await.unwrap();
            let mut stream = client.subscribe("a/+", QoS::AtLeastOnce, &channel).await.unwrap();
            client.deliver(&channel).await.unwrap();

            let message = stream.next().await.unwrap().unwrap();
            assert_eq!(message.topic.as_str(), "a/b");
            assert_eq!(message.payload.as_slice(), b"hello");
            assert!(stream.next().await.is_none());
            assert!(stream.is_finished());
            assert!(stream.next().await.is_none());
        });

        // CONNECT, SUBSCRIBE and the PUBACK for packet 7.
        let sent = client.into_transport().sent_packets();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], [0x40, 0x02, 0x00, 0x07]);
    }

    #[test]
    fn publish_requires_connection() {
        let transport = ScriptedTransport::new(&[]);
        let mut client = Client::new(transport, MqttOptions::new("pump-7"));
        assert!(matches!(
            block_on(client.publish("a", b"x", QoS::AtMostOnce)),
            Err(MqttError::NotConnected)
        ));
    }

    #[test]
    fn disconnect_sends_disconnect_and_closes() {
        let transport = ScriptedTransport::new(&[connack(0)]);
        let mut client = Client::new(transport, MqttOptions::new("pump-7"));

        block_on(async {
            client.connect().await.unwrap();
            client.disconnect().await.unwrap();
        });
        let transport = client.into_transport();
        assert!(transport.is_closed());
        assert_eq!(transport.sent_packets().last().unwrap(), &[0xE0, 0x00]);
    }
}
