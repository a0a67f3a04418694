use derive_more::{AsRef, From, Into};
use the_newtype::Newtype;

use sha2::{Digest, Sha256};

use rst_common::standard::chrono::serde::ts_seconds;
use rst_common::standard::chrono::{DateTime, Utc};
use rst_common::standard::serde::{self, Deserialize, Serialize};
use rst_common::standard::serde_json;
use rst_common::standard::uuid::Uuid;

use rstdev_domain::entity::ToJSON;
use rstdev_domain::BaseError;

use crate::didcomm::types::DIDCommMsg;
use crate::storage::types::{StorageError, Store};

use super::types::{ExchangeError, Invitation, INVITATION_MSG_TYPE, RESPONSE_MSG_TYPE};

/// Namespace for threads this agent initiated
pub const MY_NAMESPACE: &str = "my";

/// Namespace for threads the peer initiated
pub const THEIR_NAMESPACE: &str = "their";

const KEY_PREFIX_INVITATION: &str = "inv:";
const KEY_PREFIX_CONNECTION: &str = "conn:";
const KEY_PREFIX_NS_THREAD: &str = "nsThid:";
const KEY_PREFIX_EVENT_DATA: &str = "didex-event-";

const NS_HASH_SEPARATOR: u8 = 0x00;

/// `find_namespace` maps an inbound message type to the namespace its thread
/// is filed under
///
/// Invitations and responses land on threads this agent created (the fresh
/// invitation thread, the thread opened by our own request), requests and
/// acks land on threads the peer created
pub fn find_namespace(msg_type: &str) -> &'static str {
    if msg_type == INVITATION_MSG_TYPE || msg_type == RESPONSE_MSG_TYPE {
        return MY_NAMESPACE;
    }

    THEIR_NAMESPACE
}

/// `ns_thread_key` derives the stable index key for a (namespace, threadID)
/// pair: the hex `SHA-256` over `namespace || 0x00 || threadID`
pub fn ns_thread_key(namespace: &str, thread_id: &str) -> Result<String, ExchangeError> {
    if thread_id.is_empty() {
        return Err(ExchangeError::EmptyBytes);
    }

    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([NS_HASH_SEPARATOR]);
    hasher.update(thread_id.as_bytes());

    let digest = hasher.finalize();
    Ok(digest.iter().map(|byte| format!("{:02x}", byte)).collect())
}

/// Unique identifier of a pairwise connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Newtype, From, Into, AsRef)]
#[serde(crate = "self::serde")]
pub struct ConnectionID(String);

impl ConnectionID {
    /// Generate a new unique connection ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from validated string
    pub fn from_validated(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string reference
    pub fn as_ref(&self) -> &str {
        &self.0
    }
}

/// `ConnectionRecord` is the durable per-pairwise-session entity
///
/// A record advances along the exchange state machine, the driver persists
/// it after every transition. (namespace, threadID) is unique and always
/// resolves to the same connection ID for the lifetime of the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(crate = "self::serde")]
pub struct ConnectionRecord {
    pub connection_id: ConnectionID,
    pub thread_id: String,
    pub parent_thread_id: String,
    pub state: String,
    pub namespace: String,
    pub my_did: String,
    pub their_did: String,
    pub their_label: String,
    pub invitation_id: String,
    pub recipient_keys: Vec<String>,
    pub service_endpoint: String,

    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(connection_id: ConnectionID, thread_id: String, namespace: &str, state: &str) -> Self {
        Self {
            connection_id,
            thread_id,
            parent_thread_id: String::new(),
            state: state.to_string(),
            namespace: namespace.to_string(),
            my_did: String::new(),
            their_did: String::new(),
            their_label: String::new(),
            invitation_id: String::new(),
            recipient_keys: Vec::new(),
            service_endpoint: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn update_state(&mut self, state: &str) {
        self.state = state.to_string();
        self.updated_at = Utc::now();
    }
}

impl ToJSON for ConnectionRecord {
    fn to_json(&self) -> Result<String, BaseError> {
        serde_json::to_string(self).map_err(|err| BaseError::ToJSONError(err.to_string()))
    }
}

impl TryInto<Vec<u8>> for ConnectionRecord {
    type Error = ExchangeError;

    fn try_into(self) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(&self).map_err(|err| ExchangeError::EntityError(err.to_string()))
    }
}

impl TryFrom<Vec<u8>> for ConnectionRecord {
    type Error = ExchangeError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        serde_json::from_slice(&value).map_err(|err| ExchangeError::EntityError(err.to_string()))
    }
}

/// `EventTransientData` parks an inbound message awaiting client approval so
/// the accept operations can resume the suspended protocol instance
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(crate = "self::serde")]
pub struct EventTransientData {
    pub msg: DIDCommMsg,
    pub thread_id: String,
    pub next_state: String,
    pub record: ConnectionRecord,
}

/// `Recorder` persists the protocol entities over two stores
///
/// The transient store holds the hot connection copy, the thread index and
/// parked event data; the durable store holds invitations and the
/// connection copy written at first sighting. Reads prefer the transient
/// copy.
#[derive(Clone)]
pub struct Recorder<TStore>
where
    TStore: Store,
{
    transient: TStore,
    durable: TStore,
}

impl<TStore> Recorder<TStore>
where
    TStore: Store,
{
    pub fn new(transient: TStore, durable: TStore) -> Self {
        Self { transient, durable }
    }

    pub async fn save_invitation(&self, invitation: &Invitation) -> Result<(), ExchangeError> {
        let key = format!("{}{}", KEY_PREFIX_INVITATION, invitation.id);
        let bytes = serde_json::to_vec(invitation)
            .map_err(|err| ExchangeError::EntityError(err.to_string()))?;

        self.durable.put(&key, bytes).await.map_err(Into::into)
    }

    pub async fn get_invitation(&self, id: &str) -> Result<Invitation, ExchangeError> {
        let key = format!("{}{}", KEY_PREFIX_INVITATION, id);
        let bytes = self.durable.get(&key).await?;

        serde_json::from_slice(&bytes).map_err(|err| ExchangeError::EntityError(err.to_string()))
    }

    /// Writes the hot copy of a record, keyed by connection ID. Idempotent.
    pub async fn save_connection_record(
        &self,
        record: &ConnectionRecord,
    ) -> Result<(), ExchangeError> {
        let key = connection_key(&record.connection_id);
        let bytes: Vec<u8> = record.clone().try_into()?;

        self.transient.put(&key, bytes).await.map_err(Into::into)
    }

    /// Writes a first-sighting record to both stores
    pub async fn save_new_connection_record(
        &self,
        record: &ConnectionRecord,
    ) -> Result<(), ExchangeError> {
        self.save_connection_record(record).await?;

        let key = connection_key(&record.connection_id);
        let bytes: Vec<u8> = record.clone().try_into()?;

        self.durable.put(&key, bytes).await.map_err(Into::into)
    }

    pub async fn save_ns_thread_id(
        &self,
        thread_id: &str,
        namespace: &str,
        connection_id: &ConnectionID,
    ) -> Result<(), ExchangeError> {
        let key = format!("{}{}", KEY_PREFIX_NS_THREAD, ns_thread_key(namespace, thread_id)?);

        self.transient
            .put(&key, connection_id.as_ref().as_bytes().to_vec())
            .await
            .map_err(Into::into)
    }

    /// Fetches a record by connection ID, transient copy first
    pub async fn get_connection_record(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionRecord, ExchangeError> {
        let key = format!("{}{}", KEY_PREFIX_CONNECTION, connection_id);

        let bytes = match self.transient.get(&key).await {
            Ok(bytes) => bytes,
            Err(StorageError::DataNotFound) => self.durable.get(&key).await?,
            Err(err) => return Err(err.into()),
        };

        ConnectionRecord::try_from(bytes)
    }

    pub async fn get_connection_record_by_ns_thread_id(
        &self,
        namespace: &str,
        thread_id: &str,
    ) -> Result<ConnectionRecord, ExchangeError> {
        let ns_key = ns_thread_key(namespace, thread_id)?;
        self.get_connection_record_by_ns_key(&ns_key).await
    }

    pub(crate) async fn get_connection_record_by_ns_key(
        &self,
        ns_key: &str,
    ) -> Result<ConnectionRecord, ExchangeError> {
        let key = format!("{}{}", KEY_PREFIX_NS_THREAD, ns_key);
        let bytes = self.transient.get(&key).await?;

        let connection_id = String::from_utf8(bytes)
            .map_err(|err| ExchangeError::EntityError(err.to_string()))?;

        self.get_connection_record(&connection_id).await
    }

    pub async fn store_event_transient_data(
        &self,
        data: &EventTransientData,
    ) -> Result<(), ExchangeError> {
        let key = event_transient_data_key(&data.record.connection_id);
        let bytes =
            serde_json::to_vec(data).map_err(|err| ExchangeError::EntityError(err.to_string()))?;

        self.transient.put(&key, bytes).await.map_err(Into::into)
    }

    pub async fn get_event_transient_data(
        &self,
        connection_id: &str,
    ) -> Result<EventTransientData, ExchangeError> {
        let key = format!("{}{}", KEY_PREFIX_EVENT_DATA, connection_id);
        let bytes = self.transient.get(&key).await?;

        serde_json::from_slice(&bytes).map_err(|err| ExchangeError::EntityError(err.to_string()))
    }

    /// Lists the hot copies of all known connection records
    pub async fn list_connection_records(&self) -> Result<Vec<ConnectionRecord>, ExchangeError> {
        let entries = self.transient.iterate(KEY_PREFIX_CONNECTION).await?;

        entries
            .into_iter()
            .map(|(_, bytes)| ConnectionRecord::try_from(bytes))
            .collect()
    }
}

fn connection_key(connection_id: &ConnectionID) -> String {
    format!("{}{}", KEY_PREFIX_CONNECTION, connection_id.as_ref())
}

fn event_transient_data_key(connection_id: &ConnectionID) -> String {
    format!("{}{}", KEY_PREFIX_EVENT_DATA, connection_id.as_ref())
}
