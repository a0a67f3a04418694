use rst_common::standard::serde::{self, Deserialize, Serialize};
use rst_common::standard::serde_json::{self, Value};
use rst_common::with_errors::thiserror::{self, Error};

/// `DIDCommError` covers failures while reading an unpacked `DIDComm`
/// envelope
#[derive(Debug, PartialEq, Error, Clone)]
pub enum DIDCommError {
    #[error("threadID not found")]
    ThreadIDNotFound,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// `Thread` is the `DIDComm` threading decorator used to correlate
/// asynchronous messages belonging to one protocol instance
///
/// `thid` carries the thread identifier, `pthid` points at the parent thread
/// that spawned this one (for the exchange protocol: the invitation)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Thread {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

/// `Header` holds the envelope fields shared by every `DIDComm` message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Header {
    #[serde(rename = "@type", default)]
    pub message_type: String,

    #[serde(rename = "@id", default)]
    pub id: String,

    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

/// `DIDCommMsg` is an unpacked inbound message: the raw `JSON` payload plus
/// the parsed envelope header
///
/// The payload is kept as a `JSON` value so each protocol state can decode
/// it into its own message entity
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(crate = "self::serde")]
pub struct DIDCommMsg {
    header: Header,
    payload: Value,
}

impl DIDCommMsg {
    pub fn new(payload: &[u8]) -> Result<Self, DIDCommError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| DIDCommError::InvalidPayload(err.to_string()))?;

        Self::from_value(value)
    }

    pub fn from_value(payload: Value) -> Result<Self, DIDCommError> {
        let header: Header = serde_json::from_value(payload.clone())
            .map_err(|err| DIDCommError::InvalidPayload(err.to_string()))?;

        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// `thread_id` resolves the thread this message belongs to: the `thid`
    /// of the `~thread` decorator when present, otherwise the implicit
    /// thread given by the message `@id`
    pub fn thread_id(&self) -> Result<String, DIDCommError> {
        if let Some(thread) = &self.header.thread {
            if let Some(thid) = &thread.thid {
                return Ok(thid.to_owned());
            }
        }

        if !self.header.id.is_empty() {
            return Ok(self.header.id.to_owned());
        }

        Err(DIDCommError::ThreadIDNotFound)
    }
}

/// `Destination` is the delivery target of an outbound message, derived from
/// an invitation or from the peer's `DID Document`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Destination {
    pub recipient_keys: Vec<String>,
    pub service_endpoint: String,
    pub routing_keys: Vec<String>,
}
