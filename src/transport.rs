//! # MQTT Transport Abstraction
//!
//! This module defines the `MqttTransport` trait, which abstracts the underlying
//! byte stream (plain TCP, a TLS session, a serial link), and the `Connector`
//! trait that opens an authenticated transport to the broker endpoint.
//!
//! With the Rust 2024 Edition, these traits use native `async fn`, removing the
//! need for the `#[async_trait]` macro.

use core::fmt;

use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};

use crate::config::{Credentials, Endpoint};
use crate::error::ConnectionError;

/// Transport error type of the packet codec, which never performs I/O.
#[derive(Debug, Copy, Clone)]
pub enum ErrorPlaceHolder {}

/// Coarse classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportErrorKind {
    /// The peer closed the connection.
    Closed,
    /// No data arrived within the read timeout.
    Timeout,
    /// Any other I/O failure.
    Io,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "read timed out"),
            Self::Io => write!(f, "I/O failure"),
        }
    }
}

/// Errors a transport reports to the session.
pub trait TransportError: fmt::Debug {
    fn kind(&self) -> TransportErrorKind {
        TransportErrorKind::Io
    }

    fn is_closed(&self) -> bool {
        self.kind() == TransportErrorKind::Closed
    }

    fn is_timeout(&self) -> bool {
        self.kind() == TransportErrorKind::Timeout
    }
}

/// A trait representing a transport for MQTT packets.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: TransportError;

    /// Sends a buffer of data over the transport.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives data from the transport into a buffer.
    ///
    /// Returns the number of bytes read. A closed connection is reported as an
    /// error whose kind is [`TransportErrorKind::Closed`], never as `Ok(0)`.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Releases the underlying connection.
    async fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Opens an authenticated transport to the broker.
///
/// Implementations own the TLS stack: they resolve the credential paths to PEM
/// key material, connect to the endpoint and complete the handshake.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Transport: MqttTransport;

    async fn connect(
        &mut self,
        endpoint: &Endpoint<'_>,
        credentials: &Credentials<'_>,
    ) -> Result<Self::Transport, ConnectionError>;
}

/// Whether `material` looks like PEM-encoded key material.
pub fn is_pem(material: &[u8]) -> bool {
    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
    contains(material, b"-----BEGIN ") && contains(material, b"-----END ")
}

/// Error of a [`StreamTransport`].
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamError<E> {
    /// The underlying stream failed.
    Io(E),
    /// The peer closed the connection.
    Closed,
    /// No data arrived within the read timeout.
    Timeout,
}

impl<E: fmt::Debug> TransportError for StreamError<E> {
    fn kind(&self) -> TransportErrorKind {
        match self {
            StreamError::Io(_) => TransportErrorKind::Io,
            StreamError::Closed => TransportErrorKind::Closed,
            StreamError::Timeout => TransportErrorKind::Timeout,
        }
    }
}

/// Transport over any `embedded-io-async` stream.
///
/// Works with an `embassy-net` `TcpSocket` directly or with a TLS session
/// wrapping one.
pub struct StreamTransport<S> {
    stream: S,
    timeout: Duration,
}

impl<S> StreamTransport<S>
where
    S: Read + Write,
{
    /// Creates a new `StreamTransport` with the given stream and read timeout.
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self { stream, timeout }
    }

    /// Gives back the wrapped stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// A helper function to perform a read with a timeout.
    async fn read_with_timeout(&mut self, buf: &mut [u8]) -> Result<usize, StreamError<S::Error>> {
        let wanted = buf.len();
        // Race the read against a timer.
        let read_fut = self.stream.read(buf);
        let timer = Timer::after(self.timeout);

        match futures::future::select(core::pin::pin!(read_fut), core::pin::pin!(timer)).await {
            futures::future::Either::Left((Ok(0), _)) if wanted > 0 => {
                // A zero-length read means the peer closed the connection.
                debug!("stream closed by peer");
                Err(StreamError::Closed)
            }
            futures::future::Either::Left((Ok(n), _)) => {
                trace!("stream read {} bytes", n);
                Ok(n)
            }
            futures::future::Either::Left((Err(e), _)) => Err(StreamError::Io(e)),
            futures::future::Either::Right(((), _)) => Err(StreamError::Timeout),
        }
    }
}

impl<S> MqttTransport for StreamTransport<S>
where
    S: Read + Write,
{
    type Error = StreamError<S::Error>;

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        trace!("stream write {} bytes", buf.len());
        self.stream.write_all(buf).await.map_err(StreamError::Io)?;

        // Flush to ensure data is actually sent to the network.
        self.stream.flush().await.map_err(StreamError::Io)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.read_with_timeout(buf).await
    }
}
