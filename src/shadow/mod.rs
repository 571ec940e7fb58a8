//! AWS IoT device shadow over MQTT.
//!
//! The shadow service has no request/response primitive: an update is a
//! fire-and-forget publish on `.../shadow/update`, and its outcome arrives
//! later on `.../update/accepted` or `.../update/rejected`. [`ShadowChannel`]
//! knows that topic layout. It subscribes to both reply topics before anything
//! is published and hands the caller a [`ShadowStream`] that classifies each
//! delivery.
//!
//! Without client tokens the only correlation available is "the next reply
//! after our publish", so at most one update may be in flight per thing.

mod document;

pub use document::{
    ClientToken, DesiredReport, MAX_TOKEN_LEN, RejectedDocument, Reported, ReportedState,
    ShadowAck, ShadowDocument, client_token, reply_token,
};

use core::fmt::Write as _;

use crate::client::{EventChannel, MessageStream, MqttClient};
use crate::error::{MqttError, ShadowError};
use crate::packet::QoS;
use crate::topic::Topic;
use crate::transport::MqttTransport;

/// The three topics of one shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowTopics {
    update: Topic,
    accepted: Topic,
    rejected: Topic,
}

impl ShadowTopics {
    /// Topics of the classic shadow of `thing_name`, or of the named shadow.
    pub fn new(thing_name: &str, shadow_name: Option<&str>) -> Result<Self, ShadowError> {
        let mut update = Topic::new();
        let written = match shadow_name {
            Some(name) => write!(update, "$aws/things/{thing_name}/shadow/name/{name}/update"),
            None => write!(update, "$aws/things/{thing_name}/shadow/update"),
        };
        written.map_err(|_| ShadowError::PayloadTooLarge)?;

        let reply = |suffix: &str| {
            let mut topic = update.clone();
            topic
                .push_str(suffix)
                .map(|()| topic)
                .map_err(|_| ShadowError::PayloadTooLarge)
        };
        let accepted = reply("/accepted")?;
        let rejected = reply("/rejected")?;

        Ok(Self {
            update,
            accepted,
            rejected,
        })
    }

    pub fn update(&self) -> &str {
        &self.update
    }

    pub fn accepted(&self) -> &str {
        &self.accepted
    }

    pub fn rejected(&self) -> &str {
        &self.rejected
    }
}

/// A reply to an update, as delivered on one of the reply topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowReply {
    Accepted(ShadowDocument),
    Rejected(RejectedDocument),
}

impl ShadowReply {
    /// The echoed client token, if the reply carries one.
    pub fn client_token(&self) -> Option<&str> {
        match self {
            Self::Accepted(doc) => doc.client_token.as_deref(),
            Self::Rejected(doc) => doc.client_token.as_deref(),
        }
    }
}

/// Facade over the session for one thing's shadow.
pub struct ShadowChannel {
    topics: ShadowTopics,
    qos: QoS,
}

impl ShadowChannel {
    pub fn new(topics: ShadowTopics) -> Self {
        Self {
            topics,
            qos: QoS::AtLeastOnce,
        }
    }

    /// QoS of the reply subscriptions and the update publish.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn topics(&self) -> &ShadowTopics {
        &self.topics
    }

    /// Subscribes to the accepted and rejected reply topics.
    pub async fn subscribe<
        's,
        'c,
        T,
        const MAX_TOPICS: usize,
        const BUF_SIZE: usize,
        const DEPTH: usize,
    >(
        &'s self,
        client: &mut MqttClient<'_, T, MAX_TOPICS, BUF_SIZE>,
        channel: &'c EventChannel<DEPTH>,
    ) -> Result<ShadowStream<'s, 'c, DEPTH>, MqttError<T::Error>>
    where
        T: MqttTransport,
    {
        let filters = [self.topics.accepted(), self.topics.rejected()];
        let messages = client.subscribe_many(&filters, self.qos, channel).await?;
        Ok(ShadowStream {
            topics: &self.topics,
            messages,
        })
    }

    /// Publishes a serialized [`DesiredReport`] to the update topic.
    ///
    /// Does not wait for the reply; that arrives on the [`ShadowStream`].
    pub async fn update<T, const MAX_TOPICS: usize, const BUF_SIZE: usize>(
        &self,
        client: &mut MqttClient<'_, T, MAX_TOPICS, BUF_SIZE>,
        payload: &[u8],
    ) -> Result<(), MqttError<T::Error>>
    where
        T: MqttTransport,
    {
        client.publish(self.topics.update(), payload, self.qos).await
    }
}

/// Replies to shadow updates, in arrival order.
pub struct ShadowStream<'s, 'c, const DEPTH: usize> {
    topics: &'s ShadowTopics,
    messages: MessageStream<'c, DEPTH>,
}

impl<const DEPTH: usize> ShadowStream<'_, '_, DEPTH> {
    /// Waits for the next reply.
    ///
    /// Fails with [`ShadowError::ChannelClosed`] once the session has ended,
    /// with [`ShadowError::Decode`] when a reply does not match its schema and
    /// with [`ShadowError::PayloadTooLarge`] when a reply did not fit the
    /// session's payload buffer.
    pub async fn next_update(&mut self) -> Result<ShadowReply, ShadowError> {
        self.next_reply(None).await
    }

    /// Waits for the next reply echoing `token`.
    ///
    /// Replies without that token are skipped before their schema is checked,
    /// so other writers' documents never fail the wait.
    pub async fn next_reply_to(&mut self, token: &str) -> Result<ShadowReply, ShadowError> {
        self.next_reply(Some(token)).await
    }

    async fn next_reply(&mut self, token: Option<&str>) -> Result<ShadowReply, ShadowError> {
        loop {
            let message = match self.messages.next().await {
                None => return Err(ShadowError::ChannelClosed),
                Some(Ok(message)) => message,
                Some(Err(oversized)) if self.is_reply_topic(&oversized.topic) => {
                    return Err(ShadowError::PayloadTooLarge);
                }
                Some(Err(oversized)) => {
                    debug!("skipping oversized message on {}", oversized.topic.as_str());
                    continue;
                }
            };

            let topic = message.topic.as_str();
            if !self.is_reply_topic(topic) {
                debug!("skipping message on {}", topic);
                continue;
            }
            if let Some(expected) = token
                && reply_token(&message.payload)?.as_deref() != Some(expected)
            {
                debug!("skipping reply to another update");
                continue;
            }

            return if topic == self.topics.accepted() {
                ShadowDocument::decode(&message.payload).map(ShadowReply::Accepted)
            } else {
                RejectedDocument::decode(&message.payload).map(ShadowReply::Rejected)
            };
        }
    }

    fn is_reply_topic(&self, topic: &str) -> bool {
        topic == self.topics.accepted() || topic == self.topics.rejected()
    }
}
