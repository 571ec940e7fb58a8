//! Test doubles shared by the unit tests.

extern crate std;

use core::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::{String, ToString};
use std::vec;
use std::vec::Vec;

use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
use embedded_hal_async::i2c::{ErrorType, I2c, Operation};
use serde_json::{Value, json};

use crate::config::{AgentConfig, Credentials, Endpoint};
use crate::error::{ConnectReasonCode, ConnectionError, CredentialKind, SensorError, SyncError};
use crate::packet::{self, ConnAck, EncodePacket, MqttPacket, PubAck, Publish, QoS, SubAck};
use crate::sensor::{MCP9808_DEFAULT_ADDRESS, TemperatureSensor};
use crate::shadow::ShadowAck;
use crate::sink::ReportSink;
use crate::transport::{Connector, MqttTransport, TransportError, TransportErrorKind, is_pem};

fn encode(packet: &impl EncodePacket) -> Vec<u8> {
    let mut buf = [0u8; 4096];
    let len = packet.encode(&mut buf).unwrap();
    buf[..len].to_vec()
}

pub fn connack(code: u8) -> Vec<u8> {
    encode(&ConnAck {
        session_present: false,
        return_code: ConnectReasonCode::from(code),
    })
}

pub fn suback(packet_id: u16, codes: &[u8]) -> Vec<u8> {
    encode(&SubAck {
        packet_id,
        return_codes: heapless::Vec::from_slice(codes).unwrap(),
    })
}

/// A PUBLISH from the broker; QoS 1 when a packet id is given.
pub fn publish(topic: &str, payload: &[u8], packet_id: Option<u16>) -> Vec<u8> {
    let qos = match packet_id {
        Some(_) => QoS::AtLeastOnce,
        None => QoS::AtMostOnce,
    };
    encode(&Publish::new(topic, payload, qos, packet_id))
}

pub fn agent_config() -> AgentConfig<'static> {
    AgentConfig {
        thing_name: "pump-7",
        endpoint: Endpoint {
            host: "broker.local",
            port: 8883,
        },
        credentials: Credentials {
            private_key_path: "/certs/private.pem.key",
            certificate_path: "/certs/certificate.pem.crt",
            root_ca_path: "/certs/AmazonRootCA1.pem",
        },
        log_file_path: "/var/log/shadow-agent.log",
        shadow_name: None,
    }
}

/// How the simulated cloud answers a shadow update.
#[derive(Debug, Clone, Copy)]
pub enum Responder {
    /// Accept and echo the reported state with the given version.
    Echo { version: u64 },
    /// Publish this raw document on the accepted topic.
    Accepted(&'static str),
    /// Publish an error document on the rejected topic.
    Reject { code: u16 },
    /// Accept someone else's update first, then echo ours with `version`.
    StaleThenEcho { version: u64 },
    /// Accept another writer's update of a different field, then echo ours.
    ForeignThenEcho { version: u64 },
    /// Echo ours with metadata too large for the session's payload buffer.
    OversizedEcho { version: u64 },
    /// Drop the connection once pending packets are read.
    Close,
    /// Never answer.
    Silent,
}

#[derive(Debug)]
pub enum ScriptedError {
    Closed,
}

impl TransportError for ScriptedError {
    fn kind(&self) -> TransportErrorKind {
        TransportErrorKind::Closed
    }
}

struct Inner {
    inbound: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    published: Vec<(String, Vec<u8>)>,
    responder: Option<Responder>,
    close_when_idle: bool,
    closed: bool,
}

/// In-memory transport.
///
/// Built with [`ScriptedTransport::new`] it replays fixed broker bytes and
/// reports a closed connection once they are consumed. Built with
/// [`ScriptedTransport::broker`] it answers like a broker hosting the shadow
/// service and stays silent when it has nothing to say. Clones share state,
/// so a test can keep a handle after the transport is moved into a client.
#[derive(Clone)]
pub struct ScriptedTransport {
    inner: Rc<RefCell<Inner>>,
}

impl ScriptedTransport {
    pub fn new(packets: &[Vec<u8>]) -> Self {
        Self::with(packets.concat().into(), None, true)
    }

    pub fn broker(responder: Responder) -> Self {
        Self::with(VecDeque::new(), Some(responder), false)
    }

    fn with(inbound: VecDeque<u8>, responder: Option<Responder>, close_when_idle: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                inbound,
                sent: Vec::new(),
                published: Vec::new(),
                responder,
                close_when_idle,
                closed: false,
            })),
        }
    }

    /// Every packet the client sent, one entry per `send`.
    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().sent.clone()
    }

    /// `(topic, payload)` of every PUBLISH the client sent.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.borrow().published.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }
}

impl Inner {
    fn queue(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes);
    }

    fn respond(&mut self, sent: &[u8]) {
        let Some(responder) = self.responder else {
            return;
        };
        match packet::decode(sent).unwrap() {
            Some(MqttPacket::Connect(_)) => self.queue(&connack(0)),
            Some(MqttPacket::Subscribe(subscribe)) => {
                let granted = vec![1u8; subscribe.topics.len()];
                self.queue(&suback(subscribe.packet_id, &granted));
            }
            Some(MqttPacket::Publish(update)) => {
                self.published
                    .push((update.topic.to_string(), update.payload.to_vec()));
                if let Some(packet_id) = update.packet_id {
                    self.queue(&encode(&PubAck { packet_id }));
                }
                self.answer(responder, update.topic, update.payload);
            }
            Some(MqttPacket::PingReq) => self.queue(&[0xD0, 0x00]),
            _ => {}
        }
    }

    fn answer(&mut self, responder: Responder, topic: &str, payload: &[u8]) {
        let report: Value = serde_json::from_slice(payload).unwrap();
        let accepted = std::format!("{topic}/accepted");
        let rejected = std::format!("{topic}/rejected");
        let echo = |version: u64| {
            let mut doc = json!({
                "state": report["state"],
                "metadata": {"reported": {"temp": {"timestamp": 1_700_000_000}}},
                "version": version,
                "timestamp": 1_700_000_000,
            });
            if let Some(token) = report.get("clientToken") {
                doc["clientToken"] = token.clone();
            }
            serde_json::to_vec(&doc).unwrap()
        };

        match responder {
            Responder::Echo { version } => self.queue(&publish(&accepted, &echo(version), None)),
            Responder::Accepted(raw) => self.queue(&publish(&accepted, raw.as_bytes(), None)),
            Responder::Reject { code } => {
                let mut doc = json!({"code": code, "message": "Bad Request"});
                if let Some(token) = report.get("clientToken") {
                    doc["clientToken"] = token.clone();
                }
                let doc = serde_json::to_vec(&doc).unwrap();
                self.queue(&publish(&rejected, &doc, None));
            }
            Responder::StaleThenEcho { version } => {
                let stale = json!({
                    "state": {"reported": {"temp": 55}},
                    "version": version - 1,
                    "clientToken": "stale",
                });
                self.queue(&publish(&accepted, &serde_json::to_vec(&stale).unwrap(), None));
                self.queue(&publish(&accepted, &echo(version), None));
            }
            Responder::ForeignThenEcho { version } => {
                let foreign = json!({
                    "state": {"reported": {"humidity": 40}},
                    "version": version - 1,
                    "clientToken": "other",
                });
                self.queue(&publish(&accepted, &serde_json::to_vec(&foreign).unwrap(), None));
                self.queue(&publish(&accepted, &echo(version), None));
            }
            Responder::OversizedEcho { version } => {
                let mut doc: Value = serde_json::from_slice(&echo(version)).unwrap();
                doc["metadata"] = Value::String("x".repeat(1100));
                self.queue(&publish(&accepted, &serde_json::to_vec(&doc).unwrap(), None));
            }
            Responder::Close => self.close_when_idle = true,
            Responder::Silent => {}
        }
    }
}

impl MqttTransport for ScriptedTransport {
    type Error = ScriptedError;

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(ScriptedError::Closed);
        }
        inner.sent.push(buf.to_vec());
        inner.respond(buf);
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.inbound.is_empty() {
                let n = buf.len().min(inner.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(inner.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if inner.close_when_idle || inner.closed {
                return Err(ScriptedError::Closed);
            }
        }
        core::future::pending().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.inner.borrow_mut().closed = true;
        Ok(())
    }
}

/// Hands out a [`ScriptedTransport`] or a fixed connection error.
#[derive(Clone)]
pub struct ScriptedConnector {
    outcome: Result<ScriptedTransport, ConnectionError>,
    key_material: Option<Vec<(&'static str, &'static [u8])>>,
    attempts: Rc<Cell<usize>>,
}

impl ScriptedConnector {
    pub fn new(transport: ScriptedTransport) -> Self {
        Self {
            outcome: Ok(transport),
            key_material: None,
            attempts: Rc::default(),
        }
    }

    pub fn failing(error: ConnectionError) -> Self {
        Self {
            outcome: Err(error),
            key_material: None,
            attempts: Rc::default(),
        }
    }

    /// Only these `(path, contents)` files exist; credentials are loaded from them.
    pub fn with_key_material(mut self, files: Vec<(&'static str, &'static [u8])>) -> Self {
        self.key_material = Some(files);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.get()
    }
}

impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(
        &mut self,
        _endpoint: &Endpoint<'_>,
        credentials: &Credentials<'_>,
    ) -> Result<Self::Transport, ConnectionError> {
        self.attempts.set(self.attempts.get() + 1);
        if let Some(files) = &self.key_material {
            for kind in [
                CredentialKind::PrivateKey,
                CredentialKind::Certificate,
                CredentialKind::RootCa,
            ] {
                let path = credentials.path(kind);
                let readable = files
                    .iter()
                    .any(|(name, contents)| *name == path && is_pem(contents));
                if !readable {
                    return Err(ConnectionError::Credentials(kind));
                }
            }
        }
        self.outcome.clone()
    }
}

pub struct FixedSensor(pub i32);

impl TemperatureSensor for FixedSensor {
    async fn read_temperature(&mut self) -> Result<i32, SensorError> {
        Ok(self.0)
    }
}

pub struct FailingSensor(pub SensorError);

impl TemperatureSensor for FailingSensor {
    async fn read_temperature(&mut self) -> Result<i32, SensorError> {
        Err(self.0)
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub updated: Vec<ShadowAck>,
    pub failed: Vec<SyncError>,
    pub flushes: usize,
}

impl ReportSink for RecordingSink {
    fn updated(&mut self, ack: &ShadowAck) {
        self.updated.push(*ack);
    }

    fn failed(&mut self, error: &SyncError) {
        self.failed.push(*error);
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

/// Register-level MCP9808 model on an I2C bus.
pub struct MockI2c {
    address: u8,
    registers: [[u8; 2]; 16],
    pointer: u8,
    fail_next: bool,
}

impl MockI2c {
    /// An MCP9808 at the default address reporting `ambient` in register 0x05.
    pub fn mcp9808(ambient: [u8; 2]) -> Self {
        let mut registers = [[0u8; 2]; 16];
        registers[0x05] = ambient;
        registers[0x06] = [0x00, 0x54];
        registers[0x07] = [0x04, 0x00];
        Self {
            address: MCP9808_DEFAULT_ADDRESS,
            registers,
            pointer: 0,
            fail_next: false,
        }
    }

    pub fn set_register(&mut self, register: u8, value: [u8; 2]) {
        self.registers[usize::from(register & 0x0F)] = value;
    }

    pub fn fail_next(&mut self) {
        self.fail_next = true;
    }
}

impl ErrorType for MockI2c {
    type Error = ErrorKind;
}

impl I2c for MockI2c {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if core::mem::take(&mut self.fail_next) {
            return Err(ErrorKind::Bus);
        }
        if address != self.address {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        for operation in operations {
            match operation {
                Operation::Write(bytes) => {
                    if let Some(&register) = bytes.first() {
                        self.pointer = register & 0x0F;
                    }
                }
                Operation::Read(buf) => {
                    let value = self.registers[usize::from(self.pointer)];
                    for (slot, byte) in buf.iter_mut().zip(value) {
                        *slot = byte;
                    }
                }
            }
        }
        Ok(())
    }
}
