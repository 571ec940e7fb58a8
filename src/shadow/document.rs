//! Shadow documents exchanged with the cloud.

use alloc::string::String;
use core::fmt::Write as _;

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::client::MAX_PAYLOAD_LEN;
use crate::error::{DecodeErrorKind, ShadowError};

/// AWS IoT caps client tokens at 64 bytes.
pub const MAX_TOKEN_LEN: usize = 64;

/// Correlation token echoed back by the cloud.
pub type ClientToken = heapless::String<MAX_TOKEN_LEN>;

/// Builds a token from a per-run seed, such as the boot tick count.
pub fn client_token(thing_name: &str, seed: u64) -> ClientToken {
    let mut token = ClientToken::new();
    // 17 bytes of suffix always fit; the thing name is cut to what remains.
    let room = MAX_TOKEN_LEN - 17;
    let prefix = thing_name
        .char_indices()
        .take_while(|(i, c)| i + c.len_utf8() <= room)
        .last()
        .map_or(0, |(i, c)| i + c.len_utf8());
    let _ = write!(token, "{}-{:016x}", &thing_name[..prefix], seed);
    token
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reported {
    pub temp: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedState {
    pub reported: Reported,
}

/// The update published to the shadow: `{"state":{"reported":{"temp":T}}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredReport {
    pub state: ReportedState,
    #[serde(rename = "clientToken", skip_serializing_if = "Option::is_none")]
    pub client_token: Option<ClientToken>,
}

impl DesiredReport {
    pub fn new(temp: i32) -> Self {
        Self {
            state: ReportedState {
                reported: Reported { temp },
            },
            client_token: None,
        }
    }

    pub fn with_client_token(mut self, token: ClientToken) -> Self {
        self.client_token = Some(token);
        self
    }

    /// Serializes the report into a publishable payload.
    pub fn to_payload(&self) -> Result<Vec<u8, MAX_PAYLOAD_LEN>, ShadowError> {
        let json = serde_json::to_vec(self).map_err(|_| ShadowError::PayloadTooLarge)?;
        Vec::from_slice(&json).map_err(|_| ShadowError::PayloadTooLarge)
    }
}

/// The cloud's view of the shadow after an accepted update.
///
/// Fields other than `state.reported.temp`, `version` and `clientToken` are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShadowDocument {
    pub state: ReportedState,
    pub version: u64,
    #[serde(rename = "clientToken", default)]
    pub client_token: Option<ClientToken>,
}

impl ShadowDocument {
    pub fn decode(payload: &[u8]) -> Result<Self, ShadowError> {
        serde_json::from_slice(payload)
            .map_err(|e| ShadowError::Decode(DecodeErrorKind::from(&e)))
    }

    pub fn temperature(&self) -> i32 {
        self.state.reported.temp
    }

    /// The acknowledgment a successful run reports.
    pub fn ack(&self) -> ShadowAck {
        ShadowAck {
            temperature: self.temperature(),
            version: self.version,
        }
    }
}

/// Error document published on the `update/rejected` topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RejectedDocument {
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "clientToken", default)]
    pub client_token: Option<ClientToken>,
}

impl RejectedDocument {
    pub fn decode(payload: &[u8]) -> Result<Self, ShadowError> {
        serde_json::from_slice(payload)
            .map_err(|e| ShadowError::Decode(DecodeErrorKind::from(&e)))
    }
}

/// Only the correlation token of a reply.
#[derive(Deserialize)]
struct TokenEnvelope {
    #[serde(rename = "clientToken", default)]
    client_token: Option<String>,
}

/// The `clientToken` a reply carries, read without checking the rest of the
/// document, so replies to other writers can be skipped whatever they contain.
pub fn reply_token(payload: &[u8]) -> Result<Option<String>, ShadowError> {
    serde_json::from_slice::<TokenEnvelope>(payload)
        .map(|envelope| envelope.client_token)
        .map_err(|e| ShadowError::Decode(DecodeErrorKind::from(&e)))
}

/// Outcome of a successful synchronization: what the cloud recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ShadowAck {
    pub temperature: i32,
    pub version: u64,
}
