//! # Shadow Synchronization Driver
//!
//! One run reads the sensor once, reports the value to the device shadow and
//! waits for the cloud to acknowledge it:
//!
//! ```text
//! Idle -> Connected -> Subscribed -> Published -> AwaitingAck -> Decoded -> Done
//!   \________\___________\______________\____________\___________> Failed
//! ```
//!
//! Nothing is retried. Every failure ends the run with a [`SyncError`], the
//! session is disconnected and the sink flushed on every exit path.
//!
//! The wait for the acknowledgment is the only suspension point that depends
//! on the cloud. It is bounded by [`SyncOptions::ack_timeout`] and can be
//! aborted through a [`CancelToken`]; `ack_timeout: None` waits forever.

use core::fmt;
use core::pin::pin;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, with_timeout};

use crate::client::{EventChannel, MqttClient, MqttOptions};
use crate::config::{AgentConfig, ConfigSource, USAGE};
use crate::error::{ConnectionError, ShadowError, SyncError};
use crate::packet::QoS;
use crate::sensor::TemperatureSensor;
use crate::shadow::{
    DesiredReport, ShadowAck, ShadowChannel, ShadowReply, ShadowStream, ShadowTopics,
    client_token,
};
use crate::sink::ReportSink;
use crate::transport::{Connector, MqttTransport};

/// Depth of the channel between the delivery loop and the shadow stream.
const EVENT_DEPTH: usize = 4;

/// The accepted and rejected reply topics.
const SHADOW_FILTERS: usize = 2;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncState {
    Idle,
    Connected,
    Subscribed,
    Published,
    AwaitingAck,
    Decoded,
    Done,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::Subscribed => "subscribed",
            Self::Published => "published",
            Self::AwaitingAck => "awaiting-ack",
            Self::Decoded => "decoded",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the acknowledgment is matched to the update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Correlation {
    /// The first reply after the publish is ours.
    ///
    /// Requires that no other update to the same shadow is in flight.
    #[default]
    NextMessage,
    /// The update carries a `clientToken`; replies echoing a different token
    /// are skipped.
    ClientToken,
}

/// Tuning for a [`ShadowSync`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Upper bound on the wait for the acknowledgment. `None` waits forever.
    pub ack_timeout: Option<Duration>,
    pub correlation: Correlation,
    /// QoS of the update publish and the reply subscriptions.
    pub qos: QoS,
    pub keep_alive: Duration,
    /// Bound on CONNACK and SUBACK.
    pub response_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Some(Duration::from_secs(30)),
            correlation: Correlation::default(),
            qos: QoS::AtLeastOnce,
            keep_alive: Duration::from_secs(60),
            response_timeout: Duration::from_secs(10),
        }
    }
}

/// Aborts a run waiting for its acknowledgment.
///
/// Shareable between tasks; cancelling before the wait starts makes the wait
/// end immediately.
pub struct CancelToken {
    signal: Signal<CriticalSectionRawMutex, ()>,
}

impl CancelToken {
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
        }
    }

    pub fn cancel(&self) {
        self.signal.signal(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.signaled()
    }

    async fn cancelled(&self) {
        self.signal.wait().await;
        // Keep the token cancelled for any later observer.
        self.signal.signal(());
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one shadow synchronization.
pub struct ShadowSync<'a, C, S, K, const BUF_SIZE: usize = 2048>
where
    C: Connector,
    S: TemperatureSensor,
    K: ReportSink,
{
    config: AgentConfig<'a>,
    connector: C,
    sensor: S,
    sink: K,
    options: SyncOptions,
    state: SyncState,
}

impl<'a, C, S, K, const BUF_SIZE: usize> ShadowSync<'a, C, S, K, BUF_SIZE>
where
    C: Connector,
    S: TemperatureSensor,
    K: ReportSink,
{
    pub fn new(config: AgentConfig<'a>, connector: C, sensor: S, sink: K) -> Self {
        Self {
            config,
            connector,
            sensor,
            sink,
            options: SyncOptions::default(),
            state: SyncState::Idle,
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_parts(self) -> (C, S, K) {
        (self.connector, self.sensor, self.sink)
    }

    /// Performs the run and records its outcome in the sink.
    pub async fn run(&mut self, cancel: &CancelToken) -> Result<ShadowAck, SyncError> {
        self.state = SyncState::Idle;
        let result = self.synchronize(cancel).await;
        match &result {
            Ok(ack) => {
                self.transition(SyncState::Done);
                self.sink.updated(ack);
            }
            Err(e) => {
                self.transition(SyncState::Failed);
                self.sink.failed(e);
            }
        }
        self.sink.flush();
        result
    }

    fn transition(&mut self, next: SyncState) {
        debug!("sync state {} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
    }

    async fn synchronize(&mut self, cancel: &CancelToken) -> Result<ShadowAck, SyncError> {
        if self.config.thing_name.is_empty() {
            return Err(ConnectionError::EmptyIdentity.into());
        }

        let transport = self
            .connector
            .connect(&self.config.endpoint, &self.config.credentials)
            .await?;
        let options = MqttOptions::new(self.config.thing_name)
            .with_keep_alive(self.options.keep_alive)
            .with_response_timeout(self.options.response_timeout);
        let mut client = MqttClient::<_, SHADOW_FILTERS, BUF_SIZE>::new(transport, options);

        let result = self.exchange(&mut client, cancel).await;

        if client.disconnect().await.is_err() {
            debug!("transport close failed");
        }
        result
    }

    async fn exchange<T: MqttTransport>(
        &mut self,
        client: &mut MqttClient<'a, T, SHADOW_FILTERS, BUF_SIZE>,
        cancel: &CancelToken,
    ) -> Result<ShadowAck, SyncError> {
        client.connect().await.map_err(ConnectionError::from)?;
        info!(
            "connected to {}:{} as {}",
            self.config.endpoint.host, self.config.endpoint.port, self.config.thing_name
        );
        self.transition(SyncState::Connected);

        let topics = ShadowTopics::new(self.config.thing_name, self.config.shadow_name)?;
        let shadow = ShadowChannel::new(topics).with_qos(self.options.qos);
        let channel = EventChannel::<EVENT_DEPTH>::new();
        let mut stream = shadow
            .subscribe(client, &channel)
            .await
            .map_err(ConnectionError::from)?;
        self.transition(SyncState::Subscribed);

        let temperature = self.sensor.read_temperature().await?;
        let token = match self.options.correlation {
            Correlation::NextMessage => None,
            Correlation::ClientToken => Some(client_token(
                self.config.thing_name,
                Instant::now().as_ticks(),
            )),
        };
        let mut report = DesiredReport::new(temperature);
        if let Some(token) = &token {
            report = report.with_client_token(token.clone());
        }
        let payload = report.to_payload()?;
        shadow
            .update(client, &payload)
            .await
            .map_err(ConnectionError::from)?;
        debug!("reported temperature {} to {}", temperature, shadow.topics().update());
        self.transition(SyncState::Published);

        self.transition(SyncState::AwaitingAck);
        let ack = await_ack(
            client,
            &channel,
            &mut stream,
            token.as_deref(),
            self.options.ack_timeout,
            cancel,
        )
        .await?;
        self.transition(SyncState::Decoded);
        Ok(ack)
    }
}

/// Waits for the acknowledgment while the session delivers in the background.
async fn await_ack<T, const MAX_TOPICS: usize, const BUF_SIZE: usize>(
    client: &mut MqttClient<'_, T, MAX_TOPICS, BUF_SIZE>,
    channel: &EventChannel<EVENT_DEPTH>,
    stream: &mut ShadowStream<'_, '_, EVENT_DEPTH>,
    token: Option<&str>,
    ack_timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<ShadowAck, ShadowError>
where
    T: MqttTransport,
{
    let receive = async {
        let mut reply = pin!(next_correlated(stream, token));
        match select(client.deliver(channel), reply.as_mut()).await {
            Either::First(ended) => {
                if let Err(e) = ended {
                    warn!("session ended: {}", ConnectionError::from(e));
                }
                // Messages delivered before the session ended are still queued.
                reply.await
            }
            Either::Second(result) => result,
        }
    };

    let bounded = async {
        match ack_timeout {
            Some(limit) => with_timeout(limit, receive)
                .await
                .unwrap_or(Err(ShadowError::AckTimeout)),
            None => receive.await,
        }
    };

    match select(cancel.cancelled(), bounded).await {
        Either::First(()) => Err(ShadowError::Cancelled),
        Either::Second(result) => result,
    }
}

async fn next_correlated<const DEPTH: usize>(
    stream: &mut ShadowStream<'_, '_, DEPTH>,
    token: Option<&str>,
) -> Result<ShadowAck, ShadowError> {
    let reply = match token {
        Some(token) => stream.next_reply_to(token).await?,
        None => stream.next_update().await?,
    };
    match reply {
        ShadowReply::Accepted(doc) => Ok(doc.ack()),
        ShadowReply::Rejected(doc) => {
            warn!("update rejected: {} {}", doc.code, doc.message.as_str());
            Err(ShadowError::Rejected { code: doc.code })
        }
    }
}

/// Loads the configuration from `source` and performs one run.
///
/// A configuration error is recorded in the sink before any connection is
/// attempted.
pub async fn sync_once<Src, C, S, K>(
    source: &Src,
    connector: C,
    sensor: S,
    mut sink: K,
    options: SyncOptions,
    cancel: &CancelToken,
) -> Result<ShadowAck, SyncError>
where
    Src: ConfigSource + ?Sized,
    C: Connector,
    S: TemperatureSensor,
    K: ReportSink,
{
    let config = match AgentConfig::load(source) {
        Ok(config) => config,
        Err(e) => {
            let error = SyncError::from(e);
            sink.failed(&error);
            info!("{}", USAGE);
            sink.flush();
            return Err(error);
        }
    };

    let mut sync: ShadowSync<'_, C, S, K> =
        ShadowSync::new(config, connector, sensor, sink).with_options(options);
    sync.run(cancel).await
}
