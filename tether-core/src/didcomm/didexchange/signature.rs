use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use rst_common::standard::serde_json;

use super::types::{Connection, ConnectionSignature, ExchangeError};

/// Byte separating the timestamp prefix from the connection payload inside
/// the signed data
pub const SIGNATURE_DATA_DELIMITER: u8 = b'|';

/// `signature_payload` builds the bytes a connection signature is computed
/// over: `ascii(unix_seconds) || 0x7C || JSON(connection)`
pub(crate) fn signature_payload(
    connection: &Connection,
    now_unix: i64,
) -> Result<Vec<u8>, ExchangeError> {
    let connection_bytes = serde_json::to_vec(connection)
        .map_err(|err| ExchangeError::EntityError(err.to_string()))?;

    let mut payload = now_unix.to_string().into_bytes();
    payload.push(SIGNATURE_DATA_DELIMITER);
    payload.extend_from_slice(&connection_bytes);

    Ok(payload)
}

/// `verify_signature` checks a connection signature against the recipient
/// key recorded from the invitation and returns the inner [`Connection`]
///
/// The recorded key is authoritative: a container carrying a different
/// (even self-consistent) verification key is rejected, which is what
/// defeats key substitution on the response
pub fn verify_signature(
    signature: &ConnectionSignature,
    recipient_key: &str,
) -> Result<Connection, ExchangeError> {
    if signature.signed_data.is_empty() {
        return Err(ExchangeError::MissingSignatureData);
    }

    let signed_data = URL_SAFE
        .decode(&signature.signed_data)
        .map_err(|err| ExchangeError::DecodeSignedData(err.to_string()))?;

    let raw_signature = URL_SAFE
        .decode(&signature.signature)
        .map_err(|err| ExchangeError::DecodeSignature(err.to_string()))?;

    let ver_key = URL_SAFE
        .decode(&signature.sign_ver_key)
        .map_err(|err| ExchangeError::DecodeVerKey(err.to_string()))?;

    let recorded_key = bs58::decode(recipient_key)
        .into_vec()
        .map_err(|err| ExchangeError::DecodeVerKey(err.to_string()))?;

    if ver_key != recorded_key {
        return Err(ExchangeError::SignatureMismatch);
    }

    let key_bytes: [u8; 32] = ver_key
        .as_slice()
        .try_into()
        .map_err(|_| ExchangeError::VerifySignature("bad public key length".to_string()))?;

    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|err| ExchangeError::VerifySignature(err.to_string()))?;

    let ed_signature = Signature::from_slice(&raw_signature)
        .map_err(|err| ExchangeError::VerifySignature(err.to_string()))?;

    verifying_key
        .verify(&signed_data, &ed_signature)
        .map_err(|_| ExchangeError::SignatureMismatch)?;

    // split on the first delimiter only, the payload after it is the
    // connection JSON verbatim
    let delimiter = signed_data
        .iter()
        .position(|byte| *byte == SIGNATURE_DATA_DELIMITER)
        .ok_or(ExchangeError::MissingConnectionBytes)?;

    let connection_bytes = &signed_data[delimiter + 1..];
    if connection_bytes.is_empty() {
        return Err(ExchangeError::MissingConnectionBytes);
    }

    serde_json::from_slice(connection_bytes).map_err(|err| {
        ExchangeError::JSONUnmarshalError("connection".to_string(), err.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use ed25519_dalek::{Signer as DalekSigner, SigningKey};
    use rand::rngs::OsRng;

    use rst_common::standard::chrono::Utc;

    use crate::diddoc::{Document, PublicKey, Service};
    use crate::didcomm::didexchange::types::CONNECTION_SIGNATURE_TYPE;

    fn generate_keypair() -> (SigningKey, String) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let ver_key = bs58::encode(signing_key.verifying_key().to_bytes()).into_string();
        (signing_key, ver_key)
    }

    fn generate_connection(ver_key: &str) -> Connection {
        let did = format!("did:test:{}", &ver_key[..16]);
        let key_id = format!("{}#keys-1", did);

        Connection {
            did: did.clone(),
            did_doc: Some(Document {
                id: did.clone(),
                public_key: vec![PublicKey::new(
                    key_id.clone(),
                    "Ed25519VerificationKey2018".to_string(),
                    did.clone(),
                    ver_key.to_string(),
                )],
                service: vec![Service {
                    id: format!("{}#endpoint-1", did),
                    service_type: "did-communication".to_string(),
                    priority: 0,
                    recipient_keys: vec![key_id],
                    routing_keys: vec![],
                    service_endpoint: "http://localhost:58416".to_string(),
                }],
                ..Default::default()
            }),
        }
    }

    fn sign_connection(connection: &Connection, signing_key: &SigningKey) -> ConnectionSignature {
        let payload = signature_payload(connection, Utc::now().timestamp()).unwrap();
        let raw_signature = signing_key.sign(&payload);

        ConnectionSignature {
            msg_type: CONNECTION_SIGNATURE_TYPE.to_string(),
            signed_data: URL_SAFE.encode(&payload),
            signature: URL_SAFE.encode(raw_signature.to_bytes()),
            sign_ver_key: URL_SAFE.encode(signing_key.verifying_key().to_bytes()),
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let (signing_key, ver_key) = generate_keypair();
        let connection = generate_connection(&ver_key);

        let signature = sign_connection(&connection, &signing_key);
        let verified = verify_signature(&signature, &ver_key);

        assert!(verified.is_ok());
        assert_eq!(verified.unwrap(), connection);
    }

    #[test]
    fn test_tampered_payload_fails() {
        let (signing_key, ver_key) = generate_keypair();
        let connection = generate_connection(&ver_key);

        let mut signature = sign_connection(&connection, &signing_key);
        let mut payload = URL_SAFE.decode(&signature.signed_data).unwrap();

        // flip one byte of the connection JSON
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        signature.signed_data = URL_SAFE.encode(&payload);

        let verified = verify_signature(&signature, &ver_key);
        assert!(verified.is_err());
        assert_eq!(verified.unwrap_err(), ExchangeError::SignatureMismatch);
    }

    #[test]
    fn test_key_substitution_rejected() {
        // attacker swaps in their own keypair and re-signs the payload, the
        // recorded invitation key check must still reject it
        let (_, recorded_key) = generate_keypair();
        let (attacker_key, attacker_ver_key) = generate_keypair();
        let connection = generate_connection(&attacker_ver_key);

        let signature = sign_connection(&connection, &attacker_key);

        let verified = verify_signature(&signature, &recorded_key);
        assert!(verified.is_err());
        assert_eq!(verified.unwrap_err(), ExchangeError::SignatureMismatch);
        assert_eq!(
            ExchangeError::SignatureMismatch.to_string(),
            "signature doesn't match"
        );
    }

    #[test]
    fn test_missing_signature_data() {
        let (_, ver_key) = generate_keypair();

        let verified = verify_signature(&ConnectionSignature::default(), &ver_key);
        assert!(verified.is_err());
        assert_eq!(
            verified.unwrap_err(),
            ExchangeError::MissingSignatureData
        );
    }

    #[test]
    fn test_invalid_base64_signed_data() {
        let (signing_key, ver_key) = generate_keypair();
        let connection = generate_connection(&ver_key);

        let mut signature = sign_connection(&connection, &signing_key);
        signature.signed_data = "invalid-signed-data".to_string();

        let verified = verify_signature(&signature, &ver_key);
        assert!(matches!(
            verified.unwrap_err(),
            ExchangeError::DecodeSignedData(_)
        ));
    }

    #[test]
    fn test_invalid_base64_signature() {
        let (signing_key, ver_key) = generate_keypair();
        let connection = generate_connection(&ver_key);

        let mut signature = sign_connection(&connection, &signing_key);
        signature.signature = "invalid-signature".to_string();

        let verified = verify_signature(&signature, &ver_key);
        assert!(matches!(
            verified.unwrap_err(),
            ExchangeError::DecodeSignature(_)
        ));
    }

    #[test]
    fn test_invalid_recipient_key_encoding() {
        let (signing_key, ver_key) = generate_keypair();
        let connection = generate_connection(&ver_key);

        let signature = sign_connection(&connection, &signing_key);

        // '0' and 'l' are outside the base58 alphabet
        let verified = verify_signature(&signature, "0-invalid-key-l");
        assert!(matches!(
            verified.unwrap_err(),
            ExchangeError::DecodeVerKey(_)
        ));
    }

    #[test]
    fn test_missing_connection_attribute_bytes() {
        let (signing_key, ver_key) = generate_keypair();

        // sign a payload that carries the timestamp prefix but no connection
        let mut payload = Utc::now().timestamp().to_string().into_bytes();
        payload.push(SIGNATURE_DATA_DELIMITER);
        let raw_signature = signing_key.sign(&payload);

        let signature = ConnectionSignature {
            msg_type: CONNECTION_SIGNATURE_TYPE.to_string(),
            signed_data: URL_SAFE.encode(&payload),
            signature: URL_SAFE.encode(raw_signature.to_bytes()),
            sign_ver_key: URL_SAFE.encode(signing_key.verifying_key().to_bytes()),
        };

        let verified = verify_signature(&signature, &ver_key);
        assert_eq!(
            verified.unwrap_err(),
            ExchangeError::MissingConnectionBytes
        );
    }

    #[test]
    fn test_garbage_connection_payload() {
        let (signing_key, ver_key) = generate_keypair();

        let mut payload = Utc::now().timestamp().to_string().into_bytes();
        payload.push(SIGNATURE_DATA_DELIMITER);
        payload.extend_from_slice(b"{hello world}");
        let raw_signature = signing_key.sign(&payload);

        let signature = ConnectionSignature {
            msg_type: CONNECTION_SIGNATURE_TYPE.to_string(),
            signed_data: URL_SAFE.encode(&payload),
            signature: URL_SAFE.encode(raw_signature.to_bytes()),
            sign_ver_key: URL_SAFE.encode(signing_key.verifying_key().to_bytes()),
        };

        let verified = verify_signature(&signature, &ver_key);
        assert!(verified.is_err());
        assert!(verified
            .unwrap_err()
            .to_string()
            .contains("JSON unmarshalling of connection"));
    }

    #[test]
    fn test_split_on_first_delimiter_only() {
        let (signing_key, ver_key) = generate_keypair();

        // a connection whose JSON itself contains the delimiter byte
        let connection = Connection {
            did: "did:test:with|pipe".to_string(),
            did_doc: None,
        };

        let signature = sign_connection(&connection, &signing_key);
        let verified = verify_signature(&signature, &ver_key);

        assert!(verified.is_ok());
        assert_eq!(verified.unwrap().did, "did:test:with|pipe");
    }
}
