use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;

use rst_common::standard::chrono::Utc;
use rst_common::standard::serde_json;
use rst_common::standard::uuid::Uuid;

use crate::diddoc::Document;
use crate::didcomm::event::EventOptions;
use crate::didcomm::types::{Destination, Thread};
use crate::storage::types::Store;

use super::record::{ConnectionRecord, Recorder, MY_NAMESPACE};
use super::signature::{signature_payload, verify_signature};
use super::state::OutboundAction;
use super::types::{
    Ack, Connection, ConnectionSignature, ExchangeError, Invitation, OutboundDispatcher, Request,
    Response, Signer, VdriRegistry, ACK_MSG_TYPE, ACK_STATUS_OK, CONNECTION_SIGNATURE_TYPE,
    PEER_DID_METHOD, REQUEST_MSG_TYPE, RESPONSE_MSG_TYPE,
};

/// `prepare_destination` derives the delivery target for an outbound message
/// from the peer's `DID Document`
pub(crate) fn prepare_destination(doc: &Document) -> Result<Destination, ExchangeError> {
    let service = doc.did_communication_service()?;
    let recipient_keys = doc.recipient_keys()?;

    Ok(Destination {
        recipient_keys,
        service_endpoint: service.service_endpoint.to_owned(),
        routing_keys: service.routing_keys.to_owned(),
    })
}

/// `ExchangeContext` bundles the collaborators consumed by the state
/// actions: the signer, the `VDRI` registry, the outbound dispatcher and the
/// connection recorder
///
/// The bundle is cheap to clone, every collaborator is required to be
/// `Clone + Send + Sync` so the same context can serve concurrent protocol
/// instances
#[derive(Clone)]
pub struct ExchangeContext<TStore, TSigner, TRegistry, TOutbound>
where
    TStore: Store,
    TSigner: Signer,
    TRegistry: VdriRegistry,
    TOutbound: OutboundDispatcher,
{
    signer: TSigner,
    vdri: TRegistry,
    outbound: TOutbound,
    recorder: Recorder<TStore>,
}

impl<TStore, TSigner, TRegistry, TOutbound> ExchangeContext<TStore, TSigner, TRegistry, TOutbound>
where
    TStore: Store,
    TSigner: Signer,
    TRegistry: VdriRegistry,
    TOutbound: OutboundDispatcher,
{
    pub fn new(
        signer: TSigner,
        vdri: TRegistry,
        outbound: TOutbound,
        recorder: Recorder<TStore>,
    ) -> Self {
        Self {
            signer,
            vdri,
            outbound,
            recorder,
        }
    }

    pub(crate) fn signer(&self) -> &TSigner {
        &self.signer
    }

    pub(crate) fn vdri(&self) -> &TRegistry {
        &self.vdri
    }

    pub(crate) fn recorder(&self) -> &Recorder<TStore> {
        &self.recorder
    }

    pub(crate) async fn send_outbound(&self, action: OutboundAction) -> Result<(), ExchangeError> {
        self.outbound.send(action.payload, &action.destination).await
    }

    /// Invitee half of the exchange: build the `Request` answering an
    /// invitation
    ///
    /// The invitee's own `DID Document` is resolved when the client supplied
    /// a public `DID`, otherwise a fresh pairwise `DID` is created through
    /// the registry. The request opens the thread under `thid`.
    pub(crate) async fn handle_inbound_invitation(
        &self,
        invitation: &Invitation,
        thid: &str,
        options: &EventOptions,
        conn_record: &ConnectionRecord,
    ) -> Result<(ConnectionRecord, OutboundAction), ExchangeError> {
        let (did_doc, connection) = self
            .get_did_doc_and_connection(options.public_did.as_deref())
            .await?;

        let destination = self.get_destination(invitation).await?;

        let mut record = conn_record.clone();
        record.my_did = did_doc.id.to_owned();

        let request = Request {
            msg_type: REQUEST_MSG_TYPE.to_string(),
            id: thid.to_string(),
            label: options.label.clone().unwrap_or_default(),
            thread: Some(Thread {
                thid: None,
                pthid: Some(invitation.id.to_owned()),
            }),
            connection: Some(connection),
        };

        let payload = serde_json::to_value(&request)
            .map_err(|err| ExchangeError::EntityError(err.to_string()))?;

        Ok((record, OutboundAction { payload, destination }))
    }

    /// Inviter half of the exchange: answer a `Request` with a `Response`
    /// carrying the inviter's connection, signed with the invitation
    /// recipient key
    pub(crate) async fn handle_inbound_request(
        &self,
        request: &Request,
        options: &EventOptions,
        conn_record: &ConnectionRecord,
    ) -> Result<(ConnectionRecord, OutboundAction), ExchangeError> {
        let connection = request
            .connection
            .as_ref()
            .ok_or(ExchangeError::MissingConnection)?;

        let their_doc = connection
            .did_doc
            .as_ref()
            .ok_or(ExchangeError::MissingConnection)?;

        if their_doc.id != connection.did {
            return Err(ExchangeError::ConnectionDIDMismatch);
        }

        // validates the did-communication service and its Ed25519 keys
        let destination = prepare_destination(their_doc)?;

        let (my_doc, my_connection) = self
            .get_did_doc_and_connection(options.public_did.as_deref())
            .await?;

        let invitation_id = request
            .thread
            .as_ref()
            .and_then(|thread| thread.pthid.to_owned())
            .unwrap_or_default();

        let connection_signature = self
            .prepare_connection_signature(&my_connection, &invitation_id)
            .await?;

        let mut record = conn_record.clone();
        record.my_did = my_doc.id.to_owned();
        record.their_did = connection.did.to_owned();
        record.their_label = request.label.to_owned();

        let response = Response {
            msg_type: RESPONSE_MSG_TYPE.to_string(),
            id: Uuid::new_v4().to_string(),
            thread: Some(Thread {
                thid: Some(request.id.to_owned()),
                pthid: None,
            }),
            connection_signature: Some(connection_signature),
        };

        let payload = serde_json::to_value(&response)
            .map_err(|err| ExchangeError::EntityError(err.to_string()))?;

        Ok((record, OutboundAction { payload, destination }))
    }

    /// Invitee completion: verify the signed connection of a `Response`
    /// against the recipient key recorded from the invitation, persist the
    /// peer `DID`, and acknowledge
    pub(crate) async fn handle_inbound_response(
        &self,
        response: &Response,
    ) -> Result<(ConnectionRecord, OutboundAction), ExchangeError> {
        let thid = response
            .thread
            .as_ref()
            .and_then(|thread| thread.thid.to_owned())
            .ok_or(ExchangeError::ThreadIDNotFound)?;

        let mut record = self
            .recorder
            .get_connection_record_by_ns_thread_id(MY_NAMESPACE, &thid)
            .await
            .map_err(|err| match err {
                ExchangeError::EmptyBytes => ExchangeError::EmptyBytes,
                other => ExchangeError::GetConnectionRecord(other.to_string()),
            })?;

        let connection_signature = response
            .connection_signature
            .as_ref()
            .ok_or(ExchangeError::MissingSignatureData)?;

        let recipient_key = record
            .recipient_keys
            .first()
            .cloned()
            .ok_or(ExchangeError::MissingRecipientKey)?;

        let connection = verify_signature(connection_signature, &recipient_key)?;

        let their_doc = connection
            .did_doc
            .as_ref()
            .ok_or(ExchangeError::MissingConnection)?;
        let destination = prepare_destination(their_doc)?;

        record.their_did = connection.did.to_owned();

        let ack = Ack {
            msg_type: ACK_MSG_TYPE.to_string(),
            id: Uuid::new_v4().to_string(),
            status: ACK_STATUS_OK.to_string(),
            thread: Some(Thread {
                thid: Some(thid),
                pthid: None,
            }),
        };

        let payload = serde_json::to_value(&ack)
            .map_err(|err| ExchangeError::EntityError(err.to_string()))?;

        Ok((record, OutboundAction { payload, destination }))
    }

    /// Resolves the agent's own document when a public `DID` was supplied,
    /// creates a pairwise `DID` otherwise
    pub(crate) async fn get_did_doc_and_connection(
        &self,
        public_did: Option<&str>,
    ) -> Result<(Document, Connection), ExchangeError> {
        let doc = match public_did {
            Some(did) if !did.is_empty() => self.vdri.resolve(did).await?,
            _ => self.vdri.create(PEER_DID_METHOD).await?,
        };

        let connection = Connection {
            did: doc.id.to_owned(),
            did_doc: Some(doc.clone()),
        };

        Ok((doc, connection))
    }

    /// Wraps a connection into the signed container of a `Response`
    pub(crate) async fn prepare_connection_signature(
        &self,
        connection: &Connection,
        invitation_id: &str,
    ) -> Result<ConnectionSignature, ExchangeError> {
        let ver_key = self.get_ver_key(invitation_id).await?;

        let payload = signature_payload(connection, Utc::now().timestamp())?;
        let raw_signature = self.signer.sign_message(&payload, &ver_key).await?;

        let raw_key = bs58::decode(&ver_key)
            .into_vec()
            .map_err(|err| ExchangeError::DecodeVerKey(err.to_string()))?;

        Ok(ConnectionSignature {
            msg_type: CONNECTION_SIGNATURE_TYPE.to_string(),
            signed_data: URL_SAFE.encode(&payload),
            signature: URL_SAFE.encode(&raw_signature),
            sign_ver_key: URL_SAFE.encode(&raw_key),
        })
    }

    /// Looks up the verification key the response must be signed with: the
    /// recipient key of the stored invitation, or the primary key of the
    /// invitation `DID` when the exchange started from an implicit
    /// invitation
    pub(crate) async fn get_ver_key(&self, invitation_id: &str) -> Result<String, ExchangeError> {
        match self.recorder.get_invitation(invitation_id).await {
            Ok(invitation) => self.get_invitation_recipient_key(&invitation).await,
            Err(ExchangeError::DataNotFound) => {
                let doc = self.vdri.resolve(invitation_id).await.map_err(|_| {
                    ExchangeError::GetInvitationForSignature(
                        ExchangeError::DataNotFound.to_string(),
                    )
                })?;

                let key = doc.primary_public_key().map_err(|err| {
                    ExchangeError::GetInvitationForSignature(err.to_string())
                })?;

                Ok(key.value.to_owned())
            }
            Err(other) => Err(ExchangeError::GetInvitationForSignature(other.to_string())),
        }
    }

    pub(crate) async fn get_invitation_recipient_key(
        &self,
        invitation: &Invitation,
    ) -> Result<String, ExchangeError> {
        if !invitation.did.is_empty() {
            let doc = self
                .vdri
                .resolve(&invitation.did)
                .await
                .map_err(|err| ExchangeError::GetInvitationRecipientKey(err.to_string()))?;

            let key = doc
                .primary_public_key()
                .map_err(|err| ExchangeError::GetInvitationRecipientKey(err.to_string()))?;

            return Ok(key.value.to_owned());
        }

        invitation
            .recipient_keys
            .first()
            .cloned()
            .ok_or(ExchangeError::MissingRecipientKey)
    }

    /// Derives the request destination from an invitation, resolving the
    /// invitation `DID` when the explicit endpoint data is absent
    pub(crate) async fn get_destination(
        &self,
        invitation: &Invitation,
    ) -> Result<Destination, ExchangeError> {
        if !invitation.did.is_empty() {
            return self.get_destination_from_did(&invitation.did).await;
        }

        Ok(Destination {
            recipient_keys: invitation.recipient_keys.to_owned(),
            service_endpoint: invitation.service_endpoint.to_owned(),
            routing_keys: invitation.routing_keys.to_owned(),
        })
    }

    pub(crate) async fn get_destination_from_did(
        &self,
        did: &str,
    ) -> Result<Destination, ExchangeError> {
        let doc = self.vdri.resolve(did).await?;
        doc.primary_public_key()?;

        prepare_destination(&doc)
    }
}
