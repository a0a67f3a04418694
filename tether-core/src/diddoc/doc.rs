use rst_common::standard::chrono::{DateTime, Utc};
use rst_common::standard::serde::{self, Deserialize, Serialize};
use rst_common::standard::serde_json;
use rst_common::with_errors::thiserror::{self, Error};

use rstdev_domain::entity::ToJSON;
use rstdev_domain::BaseError;

pub const CONTEXT_DID_V1: &str = "https://w3id.org/did/v1";
pub const KEY_TYPE_ED25519_VERIFICATION_2018: &str = "Ed25519VerificationKey2018";
pub const SERVICE_TYPE_DID_COMMUNICATION: &str = "did-communication";

/// `DocError` provides all specific error types relate with the `DID
/// Document` entity
#[derive(Debug, PartialEq, Error, Clone, Serialize, Deserialize)]
#[serde(crate = "self::serde")]
pub enum DocError {
    #[error("service not found in DID document: {0}")]
    ServiceNotFound(String),

    #[error("missing recipient keys in did-communication service")]
    MissingRecipientKeys,

    #[error("key not found in DID document: {0}")]
    KeyNotFound(String),

    #[error("recipient keys in did-communication service not supported")]
    UnsupportedRecipientKeys,

    #[error("json error: {0}")]
    JSONError(String),
}

/// `PublicKey` is a verification key entry of a `DID Document`
///
/// The key material is carried base58-encoded, matching the
/// `Ed25519VerificationKey2018` representation the exchange protocol signs
/// with
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct PublicKey {
    pub id: String,

    #[serde(rename = "type")]
    pub key_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub controller: String,

    #[serde(rename = "publicKeyBase58", default)]
    pub value: String,
}

impl PublicKey {
    pub fn new(id: String, key_type: String, controller: String, value: String) -> Self {
        Self {
            id,
            key_type,
            controller,
            value,
        }
    }
}

/// `Service` is a service endpoint entry of a `DID Document`
///
/// A `did-communication` typed service carries the agent inbound endpoint
/// together with the key references a sender must encrypt for
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Service {
    pub id: String,

    #[serde(rename = "type")]
    pub service_type: String,

    #[serde(default)]
    pub priority: u32,

    #[serde(rename = "recipientKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub recipient_keys: Vec<String>,

    #[serde(rename = "routingKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,

    #[serde(rename = "serviceEndpoint", default)]
    pub service_endpoint: String,
}

/// `Document` is the `DID Document` main entity
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(crate = "self::serde")]
pub struct Document {
    #[serde(rename = "@context", default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,

    pub id: String,

    #[serde(rename = "publicKey", default, skip_serializing_if = "Vec::is_empty")]
    pub public_key: Vec<PublicKey>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<Service>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl Document {
    /// `did_communication_service` returns the `did-communication` service
    /// with the lowest priority value
    pub fn did_communication_service(&self) -> Result<&Service, DocError> {
        self.service
            .iter()
            .filter(|svc| svc.service_type == SERVICE_TYPE_DID_COMMUNICATION)
            .min_by_key(|svc| svc.priority)
            .ok_or(DocError::ServiceNotFound(
                SERVICE_TYPE_DID_COMMUNICATION.to_string(),
            ))
    }

    /// `public_key` resolves a key reference from a service entry into the
    /// document key set
    pub fn public_key(&self, id: &str) -> Result<&PublicKey, DocError> {
        self.public_key
            .iter()
            .find(|key| key.id == id)
            .ok_or(DocError::KeyNotFound(id.to_string()))
    }

    /// `primary_public_key` returns the first verification key of the
    /// document
    pub fn primary_public_key(&self) -> Result<&PublicKey, DocError> {
        self.public_key
            .first()
            .ok_or(DocError::KeyNotFound(self.id.to_owned()))
    }

    /// `recipient_keys` resolves the recipient key references of the
    /// `did-communication` service into base58 key values
    ///
    /// Only `Ed25519VerificationKey2018` entries are supported, any other
    /// key type referenced by the service is an error
    pub fn recipient_keys(&self) -> Result<Vec<String>, DocError> {
        let service = self.did_communication_service()?;
        if service.recipient_keys.is_empty() {
            return Err(DocError::MissingRecipientKeys);
        }

        let mut keys = Vec::with_capacity(service.recipient_keys.len());
        for key_ref in &service.recipient_keys {
            let key = self.public_key(key_ref)?;
            if key.key_type != KEY_TYPE_ED25519_VERIFICATION_2018 {
                return Err(DocError::UnsupportedRecipientKeys);
            }

            keys.push(key.value.to_owned());
        }

        Ok(keys)
    }
}

impl ToJSON for Document {
    fn to_json(&self) -> Result<String, BaseError> {
        serde_json::to_string(self).map_err(|err| BaseError::ToJSONError(err.to_string()))
    }
}

impl TryInto<Vec<u8>> for Document {
    type Error = DocError;

    fn try_into(self) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(&self).map_err(|err| DocError::JSONError(err.to_string()))
    }
}

impl TryFrom<Vec<u8>> for Document {
    type Error = DocError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        serde_json::from_slice(&value).map_err(|err| DocError::JSONError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_doc() -> Document {
        let id = "did:test:8HH5gYEeNc3z7PYXmd54d4x6".to_string();
        let key_id = format!("{}#keys-1", id);

        Document {
            context: vec![CONTEXT_DID_V1.to_string()],
            id: id.clone(),
            public_key: vec![PublicKey::new(
                key_id.clone(),
                KEY_TYPE_ED25519_VERIFICATION_2018.to_string(),
                id.clone(),
                "8HH5gYEeNc3z7PYXmd54d4x6qAfCNrqQqEB3nS7Zfu7K".to_string(),
            )],
            service: vec![Service {
                id: format!("{}#endpoint-1", id),
                service_type: SERVICE_TYPE_DID_COMMUNICATION.to_string(),
                priority: 0,
                recipient_keys: vec![key_id],
                routing_keys: vec![],
                service_endpoint: "https://localhost:8090".to_string(),
            }],
            created: None,
            updated: None,
        }
    }

    #[test]
    fn test_did_communication_service() {
        let mut doc = generate_doc();
        doc.service.push(Service {
            id: format!("{}#endpoint-2", doc.id),
            service_type: SERVICE_TYPE_DID_COMMUNICATION.to_string(),
            priority: 1,
            recipient_keys: vec!["unused".to_string()],
            routing_keys: vec![],
            service_endpoint: "https://localhost:9090".to_string(),
        });

        let service = doc.did_communication_service();
        assert!(service.is_ok());

        let service = service.unwrap();
        assert_eq!(service.priority, 0);
        assert_eq!(service.service_endpoint, "https://localhost:8090");
    }

    #[test]
    fn test_did_communication_service_missing() {
        let mut doc = generate_doc();
        doc.service.clear();

        let service = doc.did_communication_service();
        assert!(service.is_err());
        assert!(service
            .unwrap_err()
            .to_string()
            .contains("service not found in DID document: did-communication"));
    }

    #[test]
    fn test_did_communication_service_other_types_only() {
        let mut doc = generate_doc();
        doc.service[0].service_type = "some-type".to_string();

        let service = doc.did_communication_service();
        assert!(matches!(
            service.unwrap_err(),
            DocError::ServiceNotFound(_)
        ));
    }

    #[test]
    fn test_recipient_keys_resolved() {
        let doc = generate_doc();
        let keys = doc.recipient_keys();

        assert!(keys.is_ok());
        assert_eq!(
            keys.unwrap(),
            vec!["8HH5gYEeNc3z7PYXmd54d4x6qAfCNrqQqEB3nS7Zfu7K".to_string()]
        );
    }

    #[test]
    fn test_recipient_keys_empty() {
        let mut doc = generate_doc();
        doc.service[0].recipient_keys.clear();

        let keys = doc.recipient_keys();
        assert!(keys.is_err());
        assert_eq!(keys.unwrap_err(), DocError::MissingRecipientKeys);
    }

    #[test]
    fn test_recipient_keys_unknown_reference() {
        let mut doc = generate_doc();
        doc.service[0].recipient_keys = vec!["invalid".to_string()];

        let keys = doc.recipient_keys();
        assert!(keys.is_err());
        assert_eq!(
            keys.unwrap_err(),
            DocError::KeyNotFound("invalid".to_string())
        );
    }

    #[test]
    fn test_recipient_keys_unsupported_type() {
        let mut doc = generate_doc();
        doc.public_key[0].key_type = "RsaVerificationKey2018".to_string();

        let keys = doc.recipient_keys();
        assert!(keys.is_err());
        assert_eq!(keys.unwrap_err(), DocError::UnsupportedRecipientKeys);
    }

    #[test]
    fn test_primary_public_key_missing() {
        let mut doc = generate_doc();
        doc.public_key.clear();

        let key = doc.primary_public_key();
        assert!(key.is_err());
        assert!(matches!(key.unwrap_err(), DocError::KeyNotFound(_)));
    }

    #[test]
    fn test_json_roundtrip_wire_names() {
        let doc = generate_doc();
        let json = doc.to_json().unwrap();

        assert!(json.contains("\"@context\""));
        assert!(json.contains("\"publicKey\""));
        assert!(json.contains("\"publicKeyBase58\""));
        assert!(json.contains("\"recipientKeys\""));
        assert!(json.contains("\"serviceEndpoint\""));

        let decoded: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, doc);
    }
}
