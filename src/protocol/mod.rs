//! Contains the protocol spoken between the caller and the worker.
//!
//! Both sides exchange [Envelopes](Envelope) serialized as JSON text frames over a
//! [channel](channel). All envelopes which belong to the same logical call share the same
//! **id**. A fresh id is generated by the [Interface](interface::Interface) for each call.
//!
//! The caller sends **REQUEST**, **INVALIDATE**, **CLEAR_CACHE** and **UNSUBSCRIBE** envelopes.
//! The [Receiver](receiver::Receiver) answers with a sequence of **RESPONSE_NOTIFICATION**
//! envelopes, each carrying a [Notification](Notification): zero or more values, followed by
//! either an error or a completion.
//!
//! # Examples
//!
//! ```
//! # use courier::protocol::{Envelope, EnvelopeType, Notification};
//! # use serde_json::json;
//! let frame = r#"{
//!     "id": "9b2d6b4e-5ae1-4b39-a2b8-6f0e8f5f8a1d",
//!     "type": "RESPONSE_NOTIFICATION",
//!     "payload": { "kind": "N", "value": { "name": "Wanda" } }
//! }"#;
//!
//! let envelope = Envelope::decode(frame).unwrap();
//! assert_eq!(envelope.envelope_type, EnvelopeType::ResponseNotification);
//! assert_eq!(
//!     envelope.payload::<Notification>().unwrap(),
//!     Notification::Next { value: json!({ "name": "Wanda" }) }
//! );
//! ```
use std::fmt::{Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::request::{Method, RequestOptions};

pub mod channel;
pub mod interface;
pub mod receiver;

/// Enumerates the kinds of envelopes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    /// Asks the worker to perform a request. Carries a [RequestPayload](RequestPayload).
    Request,

    /// Carries a [Notification](Notification) for a previously sent envelope.
    ResponseNotification,

    /// Cancels all work done for the given id.
    Unsubscribe,

    /// Empties the cache.
    ClearCache,

    /// Removes a single entry from the cache. Carries an [InvalidatePayload](InvalidatePayload).
    Invalidate,
}

impl Display for EnvelopeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeType::Request => write!(f, "REQUEST"),
            EnvelopeType::ResponseNotification => write!(f, "RESPONSE_NOTIFICATION"),
            EnvelopeType::Unsubscribe => write!(f, "UNSUBSCRIBE"),
            EnvelopeType::ClearCache => write!(f, "CLEAR_CACHE"),
            EnvelopeType::Invalidate => write!(f, "INVALIDATE"),
        }
    }
}

/// Represents a single message exchanged between caller and worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The correlation id of the call this envelope belongs to.
    pub id: Uuid,

    /// The kind of envelope.
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,

    /// The payload as determined by the type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Creates an envelope without payload.
    pub fn new(id: Uuid, envelope_type: EnvelopeType) -> Self {
        Envelope {
            id,
            envelope_type,
            payload: None,
        }
    }

    /// Creates an envelope carrying the given payload.
    pub fn with_payload<P: Serialize>(
        id: Uuid,
        envelope_type: EnvelopeType,
        payload: &P,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload)
            .map_err(|error| ProtocolError::MalformedPayload(envelope_type, error.to_string()))?;

        Ok(Envelope {
            id,
            envelope_type,
            payload: Some(payload),
        })
    }

    /// Creates the **RESPONSE_NOTIFICATION** for the given id.
    pub fn notification(id: Uuid, notification: &Notification) -> Result<Self, ProtocolError> {
        Envelope::with_payload(id, EnvelopeType::ResponseNotification, notification)
    }

    /// Parses an envelope from a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|error| ProtocolError::MalformedFrame(error.to_string()))
    }

    /// Encodes this envelope into a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|error| {
            ProtocolError::MalformedPayload(self.envelope_type, error.to_string())
        })
    }

    /// Parses the payload of this envelope.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P, ProtocolError> {
        let payload = self
            .payload
            .as_ref()
            .ok_or(ProtocolError::MissingPayload(self.envelope_type))?;

        P::deserialize(payload)
            .map_err(|error| ProtocolError::MalformedPayload(self.envelope_type, error.to_string()))
    }
}

/// Represents a single event of a call as seen by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Notification {
    /// Delivers a value.
    #[serde(rename = "N")]
    Next {
        /// The value itself.
        #[serde(default)]
        value: Value,
    },

    /// Terminates the call with the given error message.
    #[serde(rename = "E")]
    Error {
        /// The message of the original error.
        error: String,
    },

    /// Terminates the call successfully.
    #[serde(rename = "C")]
    Complete,
}

impl Notification {
    /// Determines if this is the last notification of a call.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notification::Next { .. })
    }
}

/// The payload of a **REQUEST** envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// The URL to fetch.
    pub url: String,

    /// The options to apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<RequestOptions>,
}

/// The payload of an **INVALIDATE** envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvalidatePayload {
    /// The URL of the cached response to discard.
    pub url: String,

    /// The method of the cached response, **GET** if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
}

/// Describes a frame or envelope which couldn't be processed.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolError {
    /// The frame isn't a valid envelope.
    MalformedFrame(String),

    /// The envelope requires a payload but none was given.
    MissingPayload(EnvelopeType),

    /// The payload doesn't match the type of the envelope.
    MalformedPayload(EnvelopeType, String),

    /// The envelope isn't expected by the receiving side.
    UnexpectedEnvelope(EnvelopeType),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::MalformedFrame(error) => write!(f, "Malformed frame: {}", error),
            ProtocolError::MissingPayload(envelope_type) => {
                write!(f, "A {} envelope requires a payload.", envelope_type)
            }
            ProtocolError::MalformedPayload(envelope_type, error) => {
                write!(f, "Malformed payload of a {} envelope: {}", envelope_type, error)
            }
            ProtocolError::UnexpectedEnvelope(envelope_type) => {
                write!(f, "Unexpected envelope: {}", envelope_type)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
