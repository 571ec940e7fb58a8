//! # Error Types
//!
//! Wire-level errors of the MQTT session (`MqttError`, `ProtocolError`,
//! `ConnectReasonCode`) and the failure taxonomy of a shadow synchronization
//! run (`SyncError` and the kinds it wraps). Every error is fatal to a run;
//! nothing here is retried.

use core::fmt;

use crate::config::ConfigKey;
use crate::transport::{ErrorPlaceHolder, TransportError, TransportErrorKind};

/// The primary error enum for the MQTT session.
///
/// It is generic over the transport error type `T`, allowing it to wrap
/// specific errors from the underlying stream (TCP socket, TLS session, ...).
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError<T> {
    /// An error occurred in the underlying transport layer.
    Transport(T),
    /// A protocol-level error occurred, indicating a violation of the MQTT specification.
    Protocol(ProtocolError),
    /// The connection was refused by the broker. The enclosed code provides the reason.
    ConnectionRefused(ConnectReasonCode),
    /// The client is not currently connected to the broker.
    NotConnected,
    /// The buffer provided for an operation was too small.
    BufferTooSmall,
    /// The broker did not answer within the response timeout.
    Timeout,
}

impl<T> MqttError<T> {
    /// Lifts an error produced by the packet codec into the session's error type.
    ///
    /// The codec never touches the transport, so its placeholder transport type is
    /// uninhabited and the conversion is total.
    pub fn from_codec(other: MqttError<ErrorPlaceHolder>) -> MqttError<T> {
        match other {
            MqttError::Transport(never) => match never {},
            MqttError::Protocol(p) => MqttError::Protocol(p),
            MqttError::ConnectionRefused(c) => MqttError::ConnectionRefused(c),
            MqttError::NotConnected => MqttError::NotConnected,
            MqttError::BufferTooSmall => MqttError::BufferTooSmall,
            MqttError::Timeout => MqttError::Timeout,
        }
    }
}

/// Represents the return codes of a connection refusal (`CONNACK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReasonCode {
    /// The connection was accepted.
    Success,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// An unknown or unspecified error occurred.
    Other(u8),
}

impl From<u8> for ConnectReasonCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Success,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

impl fmt::Display for ConnectReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "accepted"),
            Self::UnacceptableProtocolVersion => write!(f, "unacceptable protocol version"),
            Self::IdentifierRejected => write!(f, "client identifier rejected"),
            Self::ServerUnavailable => write!(f, "server unavailable"),
            Self::BadUserNameOrPassword => write!(f, "bad user name or password"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::Other(code) => write!(f, "return code {code}"),
        }
    }
}

/// Enumerates specific MQTT protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An invalid packet type was received.
    InvalidPacketType(u8),
    /// The server sent an invalid or unexpected response.
    InvalidResponse,
    /// The connection was closed by the broker.
    ConnectionClosed,
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// The payload of a message exceeds the maximum allowable size.
    PayloadTooLarge,
    /// A string was not valid UTF-8.
    InvalidUtf8String,
    /// The broker answered a SUBSCRIBE with the failure return code.
    SubscriptionRejected,
    /// No more topic filters can be registered on this session.
    TooManySubscriptions,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPacketType(t) => write!(f, "invalid packet type {t}"),
            Self::InvalidResponse => write!(f, "unexpected response from broker"),
            Self::ConnectionClosed => write!(f, "connection closed by broker"),
            Self::MalformedPacket => write!(f, "malformed packet"),
            Self::PayloadTooLarge => write!(f, "payload too large"),
            Self::InvalidUtf8String => write!(f, "invalid UTF-8 string"),
            Self::SubscriptionRejected => write!(f, "subscription rejected"),
            Self::TooManySubscriptions => write!(f, "too many subscriptions"),
        }
    }
}

/// Which piece of key material a credential error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CredentialKind {
    PrivateKey,
    Certificate,
    RootCa,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateKey => write!(f, "private key"),
            Self::Certificate => write!(f, "certificate"),
            Self::RootCa => write!(f, "root CA"),
        }
    }
}

/// Missing or invalid settings, detected before any network activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// A required setting is absent or empty.
    Missing(ConfigKey),
    /// A setting is present but cannot be parsed.
    Invalid(ConfigKey),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "missing required setting `{}`", key.flag()),
            Self::Invalid(key) => write!(f, "invalid value for `{}`", key.flag()),
        }
    }
}

/// Credential, network, handshake or session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionError {
    /// Key material could not be read or is not PEM.
    Credentials(CredentialKind),
    /// The thing name used as client identifier is empty.
    EmptyIdentity,
    /// The endpoint could not be resolved or reached.
    Unreachable,
    /// The TLS handshake failed.
    Handshake,
    /// The broker refused the MQTT connection.
    Refused(ConnectReasonCode),
    /// The broker violated the MQTT protocol.
    Protocol(ProtocolError),
    /// The transport failed after the connection was established.
    Transport(TransportErrorKind),
    /// A packet does not fit the session buffers.
    BufferTooSmall,
    /// The broker did not answer in time.
    Timeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credentials(kind) => write!(f, "unreadable {kind} material"),
            Self::EmptyIdentity => write!(f, "thing name must not be empty"),
            Self::Unreachable => write!(f, "endpoint unreachable"),
            Self::Handshake => write!(f, "TLS handshake failed"),
            Self::Refused(code) => write!(f, "connection refused: {code}"),
            Self::Protocol(p) => write!(f, "protocol error: {p}"),
            Self::Transport(kind) => write!(f, "transport error: {kind}"),
            Self::BufferTooSmall => write!(f, "session buffer too small"),
            Self::Timeout => write!(f, "broker did not respond in time"),
        }
    }
}

impl<T: TransportError> From<MqttError<T>> for ConnectionError {
    fn from(err: MqttError<T>) -> Self {
        match err {
            MqttError::Transport(e) => Self::Transport(e.kind()),
            MqttError::Protocol(p) => Self::Protocol(p),
            MqttError::ConnectionRefused(code) => Self::Refused(code),
            MqttError::NotConnected => Self::Protocol(ProtocolError::ConnectionClosed),
            MqttError::BufferTooSmall => Self::BufferTooSmall,
            MqttError::Timeout => Self::Timeout,
        }
    }
}

/// Bus or device failure of the temperature sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// The bus transaction failed.
    Bus,
    /// The device on the bus is not the expected sensor.
    UnknownDevice,
    /// The reading cannot be represented.
    OutOfRange,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus => write!(f, "sensor bus transaction failed"),
            Self::UnknownDevice => write!(f, "unexpected device on sensor address"),
            Self::OutOfRange => write!(f, "sensor reading out of range"),
        }
    }
}

/// Why a received shadow payload could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeErrorKind {
    /// Not valid JSON (or not valid UTF-8).
    Syntax,
    /// Valid JSON that does not match the shadow document schema.
    Schema,
    /// The payload ended in the middle of a value.
    Truncated,
}

impl From<&serde_json::Error> for DecodeErrorKind {
    fn from(err: &serde_json::Error) -> Self {
        use serde_json::error::Category;
        match err.classify() {
            Category::Data => Self::Schema,
            Category::Eof => Self::Truncated,
            Category::Syntax | Category::Io => Self::Syntax,
        }
    }
}

/// Failures of the shadow request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ShadowError {
    /// The subscription ended before an acknowledgment arrived.
    ChannelClosed,
    /// The acknowledgment payload does not match the shadow document schema.
    Decode(DecodeErrorKind),
    /// The cloud rejected the update with the given error code.
    Rejected { code: u16 },
    /// No acknowledgment arrived within the configured wait.
    AckTimeout,
    /// The wait was cancelled by the caller.
    Cancelled,
    /// A topic or payload exceeds the fixed buffers.
    PayloadTooLarge,
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "shadow channel closed"),
            Self::Decode(DecodeErrorKind::Syntax) => write!(f, "shadow payload is not valid JSON"),
            Self::Decode(DecodeErrorKind::Schema) => {
                write!(f, "shadow payload does not match the document schema")
            }
            Self::Decode(DecodeErrorKind::Truncated) => write!(f, "shadow payload is truncated"),
            Self::Rejected { code } => write!(f, "shadow update rejected with code {code}"),
            Self::AckTimeout => write!(f, "timed out waiting for shadow acknowledgment"),
            Self::Cancelled => write!(f, "wait for shadow acknowledgment cancelled"),
            Self::PayloadTooLarge => write!(f, "shadow topic or payload too large"),
        }
    }
}

/// Terminal failure of a synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncError {
    Config(ConfigError),
    Connection(ConnectionError),
    Sensor(SensorError),
    Protocol(ShadowError),
}

impl SyncError {
    /// Process exit status for this failure. Always non-zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Connection(_) => 3,
            Self::Sensor(_) => 4,
            Self::Protocol(_) => 5,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Connection(e) => write!(f, "connection error: {e}"),
            Self::Sensor(e) => write!(f, "sensor error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl core::error::Error for SyncError {}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<ConnectionError> for SyncError {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<SensorError> for SyncError {
    fn from(err: SensorError) -> Self {
        Self::Sensor(err)
    }
}

impl From<ShadowError> for SyncError {
    fn from(err: ShadowError) -> Self {
        Self::Protocol(err)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;

    #[test]
    fn exit_codes_are_non_zero_and_distinct() {
        let errors = [
            SyncError::Config(ConfigError::Missing(ConfigKey::ThingName)),
            SyncError::Connection(ConnectionError::Unreachable),
            SyncError::Sensor(SensorError::Bus),
            SyncError::Protocol(ShadowError::ChannelClosed),
        ];
        let codes: std::vec::Vec<u8> = errors.iter().map(SyncError::exit_code).collect();
        assert!(codes.iter().all(|&c| c != 0));
        assert_eq!(codes, [2, 3, 4, 5]);
    }

    #[test]
    fn channel_closed_is_distinct_from_decode_failure() {
        let closed = SyncError::from(ShadowError::ChannelClosed);
        let decode = SyncError::from(ShadowError::Decode(DecodeErrorKind::Schema));
        assert_ne!(closed, decode);
        assert_eq!(closed.to_string(), "protocol error: shadow channel closed");
    }

    #[test]
    fn missing_setting_names_the_flag() {
        let err = ConfigError::Missing(ConfigKey::RootCaPath);
        assert_eq!(err.to_string(), "missing required setting `--rootca`");
    }

    #[test]
    fn refused_connection_maps_from_session_error() {
        let err: ConnectionError = MqttError::<crate::transport::StreamError<()>>::ConnectionRefused(
            ConnectReasonCode::NotAuthorized,
        )
        .into();
        assert_eq!(err, ConnectionError::Refused(ConnectReasonCode::NotAuthorized));
    }

    #[test]
    fn serde_categories_map_to_decode_kinds() {
        let eof = serde_json::from_slice::<u8>(b"").unwrap_err();
        assert_eq!(DecodeErrorKind::from(&eof), DecodeErrorKind::Truncated);
        let data = serde_json::from_slice::<u8>(b"\"x\"").unwrap_err();
        assert_eq!(DecodeErrorKind::from(&data), DecodeErrorKind::Schema);
        let garbage = serde_json::from_slice::<u8>(b"nope").unwrap_err();
        assert_eq!(DecodeErrorKind::from(&garbage), DecodeErrorKind::Syntax);
    }
}
