//! # Device Shadow Synchronization for Embedded Systems
//!
//! `myrtio-shadow` is a `no_std`, asynchronous agent that reports one sensor
//! reading into an AWS IoT device shadow and waits for the cloud to
//! acknowledge it. It is built on the [Embassy](https://embassy.dev/) async
//! ecosystem and a small MQTT 3.1.1 client of its own.
//!
//! ## Core Features
//!
//! - **`no_std`:** MQTT buffers, topics and inbound payloads live in `heapless`
//!   containers. `alloc` is only needed for JSON (de)serialization of shadow
//!   documents.
//! - **Fully Async:** native `async fn` in traits (Rust 2024 Edition); timers
//!   and channels come from `embassy-time` and `embassy-sync`.
//! - **Transport Agnostic:** the session runs over any `MqttTransport`;
//!   `StreamTransport` adapts any `embedded-io-async` stream, such as a TLS
//!   session over a TCP socket. TLS itself is owned by a `Connector`.
//! - **Bounded Wait:** the acknowledgment wait has a timeout and a
//!   cancellation token, and replies can be correlated by client token.
//!
//! ## Architecture
//!
//! ```text
//! ShadowSync (sync)        one run: connect, subscribe, read, publish, await ack
//!   ShadowChannel (shadow)  topic layout and documents of the shadow service
//!     MqttClient (client)   MQTT session and background delivery
//!       MqttTransport       bytes in, bytes out
//! ```
//!
//! Collaborators are injected: a `ConfigSource` for settings, a `Connector`
//! for the authenticated connection, a `TemperatureSensor` for the reading and
//! a `ReportSink` for the outcome record.
//!
//! `demos/one_shot_sync.rs` (`cargo run --example one_shot_sync`)
//! loads an [`AgentConfig`], performs a [`ShadowSync::run`] and maps the
//! outcome to [`SyncError::exit_code`].
//!
//! ## Logging
//!
//! Enable one of the `log`, `defmt` or `esp32-log` features to route the
//! crate's log records to that backend. Without any of them logging compiles
//! away.

#![no_std]

extern crate alloc;

mod fmt;

pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod sensor;
pub mod shadow;
pub mod sink;
pub mod sync;
pub mod topic;
pub mod transport;
pub mod util;

#[cfg(test)]
mod test_support;

// Re-export key types for easier access at the crate root.
pub use client::{MqttClient, MqttEvent, MqttOptions, OversizedMessage};
pub use config::{AgentConfig, ArgsSource, ConfigSource, EnvFileSource, Layered, MapSource};
pub use error::{ShadowError, SyncError};
pub use packet::QoS;
pub use sensor::{Mcp9808, Rounding, TemperatureSensor};
pub use shadow::{ShadowAck, ShadowChannel, ShadowTopics};
pub use sink::{LogSink, ReportSink};
pub use sync::{CancelToken, Correlation, ShadowSync, SyncOptions, sync_once};
pub use transport::{Connector, MqttTransport, StreamTransport};
