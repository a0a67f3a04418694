use rst_common::standard::async_trait::async_trait;
use rst_common::standard::serde::{self, Deserialize, Serialize};
use rst_common::standard::serde_json::Value;
use rst_common::with_errors::thiserror::{self, Error};

use crate::diddoc::{DocError, Document};
use crate::didcomm::types::{Destination, Thread};
use crate::storage::types::StorageError;

/// Protocol identifier used for event correlation and store naming
pub const DID_EXCHANGE: &str = "didexchange";

pub const INVITATION_MSG_TYPE: &str = "https://didcomm.org/didexchange/1.0/invitation";
pub const REQUEST_MSG_TYPE: &str = "https://didcomm.org/didexchange/1.0/request";
pub const RESPONSE_MSG_TYPE: &str = "https://didcomm.org/didexchange/1.0/response";
pub const ACK_MSG_TYPE: &str = "https://didcomm.org/didexchange/1.0/ack";

pub const CONNECTION_SIGNATURE_TYPE: &str =
    "https://didcomm.org/signature/1.0/ed25519Sha512_single";

pub const ACK_STATUS_OK: &str = "OK";

/// `DID` method used when the engine creates a pairwise `DID` for a new
/// connection
pub const PEER_DID_METHOD: &str = "peer";

/// `ExchangeError` is the base error type of the `didexchange` domain
///
/// It covers protocol violations, signature failures, storage failures
/// surfaced through the engine, and collaborator failures. The enum is
/// serializable so a failure can ride inside the `abandoned` post-state
/// event properties.
#[derive(Debug, PartialEq, Error, Clone, Serialize, Deserialize)]
#[serde(crate = "self::serde")]
pub enum ExchangeError {
    #[error("unrecognized msgType: {0}")]
    UnrecognizedMsgType(String),

    #[error("invalid state name: {0}")]
    InvalidStateName(String),

    #[error("invalid state transition: {0} -> {1}")]
    InvalidStateTransition(String, String),

    #[error("illegal msg type {0} for state {1}")]
    IllegalMsgType(String, String),

    #[error("cannot execute no-op")]
    NoOpExecution,

    #[error("not implemented")]
    NotImplementedError,

    #[error("threadID not found")]
    ThreadIDNotFound,

    #[error("unable to compute hash, empty bytes")]
    EmptyBytes,

    #[error("data not found")]
    DataNotFound,

    #[error("storage: {0}")]
    Storage(String),

    #[error("open store: {0}")]
    OpenStore(String),

    #[error("cannot fetch state from store: {0}")]
    FetchState(String),

    #[error("save connection record: {0}")]
    SaveConnectionRecord(String),

    #[error("get connection record: {0}")]
    GetConnectionRecord(String),

    #[error("get transient data : {0}")]
    GetTransientData(String),

    #[error("JSON unmarshalling of {0}: {1}")]
    JSONUnmarshalError(String, String),

    #[error("entity error: {0}")]
    EntityError(String),

    #[error("invitation must carry either a DID or recipient keys with a service endpoint")]
    InvalidInvitation,

    #[error("missing connection attribute")]
    MissingConnection,

    #[error("connection DID doesn't match DID document id")]
    ConnectionDIDMismatch,

    #[error("did document: {0}")]
    DIDDocError(String),

    #[error("no recipient key recorded for connection")]
    MissingRecipientKey,

    #[error("missing or invalid signature data")]
    MissingSignatureData,

    #[error("missing connection attribute bytes")]
    MissingConnectionBytes,

    #[error("decode signature data: {0}")]
    DecodeSignedData(String),

    #[error("decode signature: {0}")]
    DecodeSignature(String),

    #[error("decode signature verification key: {0}")]
    DecodeVerKey(String),

    #[error("verify signature: {0}")]
    VerifySignature(String),

    #[error("signature doesn't match")]
    SignatureMismatch,

    #[error("get invitation for signature: {0}")]
    GetInvitationForSignature(String),

    #[error("get invitation recipient key: {0}")]
    GetInvitationRecipientKey(String),

    #[error("signer: {0}")]
    SignerError(String),

    #[error("did registry: {0}")]
    RegistryError(String),

    #[error("outbound dispatch: {0}")]
    OutboundError(String),

    #[error("failed to execute state {0}: {1}")]
    ExecuteState(String, String),

    #[error("unable to update the state to abandoned: {0}")]
    AbandonFailed(String),

    #[error("accept exchange invitation : {0}")]
    AcceptInvitationError(String),

    #[error("accept exchange request : {0}")]
    AcceptRequestError(String),

    #[error("current state ({0}) is different from expected state ({1})")]
    UnexpectedState(String, String),

    #[error("protocol stopped: {0}")]
    Stopped(String),
}

impl From<DocError> for ExchangeError {
    fn from(err: DocError) -> Self {
        ExchangeError::DIDDocError(err.to_string())
    }
}

impl From<StorageError> for ExchangeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DataNotFound => ExchangeError::DataNotFound,
            other => ExchangeError::Storage(other.to_string()),
        }
    }
}

/// `Invitation` is the out-of-band payload bootstrapping an exchange
///
/// An explicit invitation carries recipient keys and a service endpoint, an
/// implicit invitation carries only a resolvable public `DID`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Invitation {
    #[serde(rename = "@type", default)]
    pub msg_type: String,

    #[serde(rename = "@id", default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,

    #[serde(rename = "recipientKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub recipient_keys: Vec<String>,

    #[serde(
        rename = "serviceEndpoint",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub service_endpoint: String,

    #[serde(rename = "routingKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub did: String,
}

impl Invitation {
    /// Exactly one of the explicit form (recipient keys and/or service
    /// endpoint) or the implicit form (a `DID`) must be populated
    pub fn validate(&self) -> Result<(), ExchangeError> {
        let explicit = !self.recipient_keys.is_empty() || !self.service_endpoint.is_empty();
        let implicit = !self.did.is_empty();

        if explicit == implicit {
            return Err(ExchangeError::InvalidInvitation);
        }

        Ok(())
    }
}

/// `Connection` is the signed body exchanged inside a `Request` and,
/// wrapped in a [`ConnectionSignature`], inside a `Response`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Connection {
    #[serde(rename = "DID", default)]
    pub did: String,

    #[serde(rename = "DIDDoc", default, skip_serializing_if = "Option::is_none")]
    pub did_doc: Option<Document>,
}

/// `ConnectionSignature` wraps a [`Connection`] in a timestamped `Ed25519`
/// signature container
///
/// `sig_data` is the base64url encoding of
/// `timestamp || 0x7C || JSON(connection)`, `signer` is the base64url raw
/// verification key and `signature` the base64url raw signature over the
/// decoded `sig_data` bytes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct ConnectionSignature {
    #[serde(rename = "@type", default)]
    pub msg_type: String,

    #[serde(rename = "sig_data", default)]
    pub signed_data: String,

    #[serde(default)]
    pub signature: String,

    #[serde(rename = "signer", default)]
    pub sign_ver_key: String,
}

/// `Request` asks the inviter for a pairwise connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Request {
    #[serde(rename = "@type", default)]
    pub msg_type: String,

    #[serde(rename = "@id", default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,

    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
}

/// `Response` answers a `Request` with the inviter's signed connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Response {
    #[serde(rename = "@type", default)]
    pub msg_type: String,

    #[serde(rename = "@id", default)]
    pub id: String,

    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,

    #[serde(
        rename = "connection~sig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_signature: Option<ConnectionSignature>,
}

/// `Ack` closes the exchange from the invitee side
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Ack {
    #[serde(rename = "@type", default)]
    pub msg_type: String,

    #[serde(rename = "@id", default)]
    pub id: String,

    #[serde(default)]
    pub status: String,

    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

/// `Signer` is the key management seam of the engine
///
/// Keys live in the embedder's keystore and are addressed by their base58
/// verification key, the engine never sees private key material
#[async_trait]
pub trait Signer: Clone + Send + Sync {
    /// Creates a fresh `Ed25519` keypair in the keystore and returns the
    /// base58 verification key
    async fn create_ver_key(&self) -> Result<String, ExchangeError>;

    /// Signs `message` with the private key matching `from_ver_key`
    async fn sign_message(
        &self,
        message: &[u8],
        from_ver_key: &str,
    ) -> Result<Vec<u8>, ExchangeError>;
}

/// `VdriRegistry` creates and resolves `DID Documents`
#[async_trait]
pub trait VdriRegistry: Clone + Send + Sync {
    async fn create(&self, method: &str) -> Result<Document, ExchangeError>;

    async fn resolve(&self, did: &str) -> Result<Document, ExchangeError>;
}

/// `OutboundDispatcher` delivers an outbound payload to a destination
///
/// Packing and transport selection happen behind this seam, the engine
/// hands over the plaintext message and does not wait beyond the error
/// return
#[async_trait]
pub trait OutboundDispatcher: Clone + Send + Sync {
    async fn send(&self, payload: Value, destination: &Destination) -> Result<(), ExchangeError>;
}
