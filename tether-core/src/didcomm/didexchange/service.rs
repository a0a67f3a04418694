use std::sync::{Arc, Mutex as StdMutex};

use rst_common::standard::async_trait::async_trait;
use rst_common::standard::serde_json;
use rst_common::standard::uuid::Uuid;
use rst_common::with_logging::log::{debug, warn};
use rst_common::with_tokio::tokio;
use rst_common::with_tokio::tokio::sync::{mpsc, oneshot, Mutex};

use crate::didcomm::event::{
    DIDCommAction, Decision, EventOptions, EventProperties, StateMsg, StateMsgType,
};
use crate::didcomm::types::DIDCommMsg;
use crate::storage::types::{StorageProvider, Store};

use super::context::{prepare_destination, ExchangeContext};
use super::record::{
    find_namespace, ns_thread_key, ConnectionID, ConnectionRecord, EventTransientData, Recorder,
    MY_NAMESPACE,
};
use super::state::{
    State, StateMachineMsg, STATE_NAME_ABANDONED, STATE_NAME_INVITED, STATE_NAME_NULL,
};
use super::types::{
    ExchangeError, Invitation, OutboundDispatcher, Request, Signer, VdriRegistry, ACK_MSG_TYPE,
    DID_EXCHANGE, INVITATION_MSG_TYPE, REQUEST_MSG_TYPE, RESPONSE_MSG_TYPE,
};

/// Number of serialization shards, inbound processing for one
/// (namespace, threadID) always lands on the same shard
const THREAD_LOCK_SHARDS: usize = 16;

/// `ExchangeAPI` is the client surface of the exchange engine, invoked by
/// the outer agent framework
#[async_trait]
pub trait ExchangeAPI {
    /// Creates and stores an invitation carrying a fresh verification key
    /// and the agent's inbound endpoint
    async fn create_invitation(&self, label: &str) -> Result<Invitation, ExchangeError>;

    /// Drives one unpacked inbound message through the protocol and returns
    /// the connection it belongs to
    async fn handle_inbound(&self, msg: DIDCommMsg) -> Result<ConnectionID, ExchangeError>;

    /// Resumes a connection parked in `invited`, building and dispatching
    /// the exchange request
    async fn accept_invitation(
        &self,
        connection_id: &str,
        options: EventOptions,
    ) -> Result<(), ExchangeError>;

    /// Resumes a connection parked on an inbound request, building and
    /// dispatching the signed response
    async fn accept_exchange_request(
        &self,
        connection_id: &str,
        options: EventOptions,
    ) -> Result<(), ExchangeError>;

    /// Bootstraps a connection towards a peer known only by a resolvable
    /// public `DID`
    async fn create_implicit_invitation(
        &self,
        label: &str,
        their_did: &str,
    ) -> Result<ConnectionID, ExchangeError>;

    async fn get_connection_record(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionRecord, ExchangeError>;

    async fn connections(&self) -> Result<Vec<ConnectionRecord>, ExchangeError>;

    /// Whether this engine handles the given message type, consulted by the
    /// inbound router in front of the protocol services
    fn accept(&self, msg_type: &str) -> bool;

    fn register_action_event(&self, ch: mpsc::Sender<DIDCommAction>);
    fn unregister_action_event(&self, ch: &mpsc::Sender<DIDCommAction>);
    fn register_msg_event(&self, ch: mpsc::Sender<StateMsg>);
    fn unregister_msg_event(&self, ch: &mpsc::Sender<StateMsg>);
}

/// `ExchangeService` is the exchange protocol engine: the inbound dispatch
/// driver plus the client surface
///
/// One service instance serves every connection of the agent. Inbound
/// processing is serialized per (namespace, threadID) through a sharded
/// lock, unrelated connections proceed in parallel. The service is cheap to
/// clone and clones share all state.
#[derive(Clone)]
pub struct ExchangeService<TStore, TSigner, TRegistry, TOutbound>
where
    TStore: Store,
    TSigner: Signer,
    TRegistry: VdriRegistry,
    TOutbound: OutboundDispatcher,
{
    ctx: ExchangeContext<TStore, TSigner, TRegistry, TOutbound>,
    recorder: Recorder<TStore>,
    service_endpoint: String,
    action_listeners: Arc<StdMutex<Vec<mpsc::Sender<DIDCommAction>>>>,
    msg_listeners: Arc<StdMutex<Vec<mpsc::Sender<StateMsg>>>>,
    locks: Arc<Vec<Arc<Mutex<()>>>>,
}

impl<TStore, TSigner, TRegistry, TOutbound> ExchangeService<TStore, TSigner, TRegistry, TOutbound>
where
    TStore: Store + 'static,
    TSigner: Signer + 'static,
    TRegistry: VdriRegistry + 'static,
    TOutbound: OutboundDispatcher + 'static,
{
    /// Opens the protocol stores and assembles the engine
    ///
    /// `service_endpoint` is the agent's own inbound endpoint, advertised
    /// inside created invitations
    pub fn new<TProvider>(
        store_provider: &TProvider,
        transient_store_provider: &TProvider,
        signer: TSigner,
        vdri: TRegistry,
        outbound: TOutbound,
        service_endpoint: String,
    ) -> Result<Self, ExchangeError>
    where
        TProvider: StorageProvider<Store = TStore>,
    {
        let durable = store_provider
            .open_store(DID_EXCHANGE)
            .map_err(|err| ExchangeError::OpenStore(err.to_string()))?;

        let transient = transient_store_provider
            .open_store(DID_EXCHANGE)
            .map_err(|err| ExchangeError::OpenStore(format!("transient: {}", err)))?;

        let recorder = Recorder::new(transient, durable);
        let ctx = ExchangeContext::new(signer, vdri, outbound, recorder.clone());

        let locks = (0..THREAD_LOCK_SHARDS)
            .map(|_| Arc::new(Mutex::new(())))
            .collect();

        Ok(Self {
            ctx,
            recorder,
            service_endpoint,
            action_listeners: Arc::new(StdMutex::new(Vec::new())),
            msg_listeners: Arc::new(StdMutex::new(Vec::new())),
            locks: Arc::new(locks),
        })
    }

    fn shard(&self, ns_key: &str) -> Arc<Mutex<()>> {
        let index = ns_key
            .bytes()
            .fold(0usize, |acc, byte| acc.wrapping_add(byte as usize))
            % THREAD_LOCK_SHARDS;

        self.locks[index].clone()
    }

    fn thread_id(&self, msg: &DIDCommMsg) -> Result<String, ExchangeError> {
        if msg.header().message_type == INVITATION_MSG_TYPE {
            return Ok(Uuid::new_v4().to_string());
        }

        msg.thread_id().map_err(|_| ExchangeError::ThreadIDNotFound)
    }

    async fn current_state(&self, ns_key: &str) -> Result<State, ExchangeError> {
        match self.recorder.get_connection_record_by_ns_key(ns_key).await {
            Ok(record) => State::from_name(&record.state),
            Err(ExchangeError::DataNotFound) => Ok(State::Null),
            Err(err) => Err(ExchangeError::FetchState(err.to_string())),
        }
    }

    /// Creates or loads the record for an inbound message. A fresh
    /// invitation or request opens a new connection, responses and acks must
    /// land on a known thread.
    async fn connection_record(
        &self,
        msg: &DIDCommMsg,
        thid: &str,
        namespace: &str,
    ) -> Result<ConnectionRecord, ExchangeError> {
        match msg.header().message_type.as_str() {
            INVITATION_MSG_TYPE => self.invitation_msg_record(msg, thid).await,
            REQUEST_MSG_TYPE => self.request_msg_record(msg, thid).await,
            RESPONSE_MSG_TYPE | ACK_MSG_TYPE => self
                .recorder
                .get_connection_record_by_ns_thread_id(namespace, thid)
                .await
                .map_err(|err| ExchangeError::GetConnectionRecord(err.to_string())),
            other => Err(ExchangeError::UnrecognizedMsgType(other.to_string())),
        }
    }

    async fn invitation_msg_record(
        &self,
        msg: &DIDCommMsg,
        thid: &str,
    ) -> Result<ConnectionRecord, ExchangeError> {
        let invitation: Invitation = serde_json::from_value(msg.payload().clone())
            .map_err(|err| {
                ExchangeError::JSONUnmarshalError("invitation".to_string(), err.to_string())
            })?;

        invitation.validate()?;

        let mut record = ConnectionRecord::new(
            ConnectionID::generate(),
            thid.to_string(),
            MY_NAMESPACE,
            STATE_NAME_INVITED,
        );
        record.invitation_id = invitation.id;
        record.recipient_keys = invitation.recipient_keys;
        record.service_endpoint = invitation.service_endpoint;
        record.their_label = invitation.label;

        self.save_new_record(&record).await?;
        Ok(record)
    }

    async fn request_msg_record(
        &self,
        msg: &DIDCommMsg,
        thid: &str,
    ) -> Result<ConnectionRecord, ExchangeError> {
        let request: Request = serde_json::from_value(msg.payload().clone()).map_err(|err| {
            ExchangeError::JSONUnmarshalError("request".to_string(), err.to_string())
        })?;

        let mut record = ConnectionRecord::new(
            ConnectionID::generate(),
            thid.to_string(),
            super::record::THEIR_NAMESPACE,
            STATE_NAME_NULL,
        );
        record.invitation_id = request
            .thread
            .as_ref()
            .and_then(|thread| thread.pthid.to_owned())
            .unwrap_or_default();
        record.parent_thread_id = record.invitation_id.to_owned();
        record.their_label = request.label;

        self.save_new_record(&record).await?;
        Ok(record)
    }

    async fn save_new_record(&self, record: &ConnectionRecord) -> Result<(), ExchangeError> {
        self.recorder
            .save_new_connection_record(record)
            .await
            .map_err(|err| ExchangeError::SaveConnectionRecord(err.to_string()))?;

        self.recorder
            .save_ns_thread_id(&record.thread_id, &record.namespace, &record.connection_id)
            .await
            .map_err(|err| ExchangeError::SaveConnectionRecord(err.to_string()))
    }

    /// Persists a record after a transition together with its thread index
    /// entry
    async fn update(&self, msg_type: &str, record: &ConnectionRecord) -> Result<(), ExchangeError> {
        self.recorder
            .save_connection_record(record)
            .await
            .map_err(|err| ExchangeError::SaveConnectionRecord(err.to_string()))?;

        self.recorder
            .save_ns_thread_id(
                &record.thread_id,
                find_namespace(msg_type),
                &record.connection_id,
            )
            .await
            .map_err(|err| ExchangeError::SaveConnectionRecord(err.to_string()))
    }

    /// Executes the entry state and every follow-up it chains into,
    /// persisting and publishing around each one. Any failure abandons the
    /// connection.
    ///
    /// `first_pre_state_sent` is set by callers that already published the
    /// pre-state event before gating on approval.
    async fn execute_chain(
        &self,
        data: EventTransientData,
        options: EventOptions,
        first_pre_state_sent: bool,
    ) -> Result<(), ExchangeError> {
        let mut next = State::from_name(&data.next_state)?;
        let mut record = data.record.clone();
        let msg_type = data.msg.header().message_type.clone();
        let mut first = true;

        while !next.is_noop() {
            if !(first && first_pre_state_sent) {
                self.send_msg_event(StateMsgType::PreState, next.name(), &record, &data.msg, None);
            }
            first = false;

            let smsg = StateMachineMsg {
                msg: data.msg.clone(),
                conn_record: record.clone(),
                options: options.clone(),
            };

            let outcome = next.execute_inbound(&smsg, &data.thread_id, &self.ctx).await;
            let (mut new_record, followup, outbound) = match outcome {
                Ok(executed) => executed,
                Err(err) => {
                    let wrapped =
                        ExchangeError::ExecuteState(next.name().to_string(), err.to_string());
                    self.abandon(&record, &data.msg, &wrapped).await;
                    return Err(wrapped);
                }
            };

            new_record.update_state(next.name());
            if let Err(err) = self.update(&msg_type, &new_record).await {
                self.abandon(&new_record, &data.msg, &err).await;
                return Err(err);
            }

            // outbound goes to the dispatcher before the post-state event
            if let Some(outbound) = outbound {
                if let Err(err) = self.ctx.send_outbound(outbound).await {
                    self.abandon(&new_record, &data.msg, &err).await;
                    return Err(err);
                }
            }

            self.send_msg_event(
                StateMsgType::PostState,
                next.name(),
                &new_record,
                &data.msg,
                None,
            );

            debug!(
                "connection {} moved to state {}",
                new_record.connection_id.as_ref(),
                next.name()
            );

            record = new_record;
            next = followup;
        }

        Ok(())
    }

    /// Forces the connection to `abandoned` and publishes the post-state
    /// event carrying the failure
    async fn abandon(&self, record: &ConnectionRecord, msg: &DIDCommMsg, reason: &ExchangeError) {
        let mut abandoned = record.clone();
        abandoned.update_state(STATE_NAME_ABANDONED);

        if let Err(err) = self.recorder.save_connection_record(&abandoned).await {
            warn!("{}", ExchangeError::AbandonFailed(err.to_string()));
            return;
        }

        self.send_msg_event(
            StateMsgType::PostState,
            STATE_NAME_ABANDONED,
            &abandoned,
            msg,
            Some(reason.to_string()),
        );
    }

    fn send_msg_event(
        &self,
        state_type: StateMsgType,
        state_id: &str,
        record: &ConnectionRecord,
        msg: &DIDCommMsg,
        error: Option<String>,
    ) {
        let event = StateMsg {
            protocol_name: DID_EXCHANGE.to_string(),
            state_type,
            state_id: state_id.to_string(),
            properties: event_properties(record, error),
            msg: Some(msg.clone()),
        };

        let listeners = match self.msg_listeners.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => {
                warn!("state event listener registry poisoned, dropping event");
                return;
            }
        };

        // non-blocking fan-out, a slow subscriber only loses its own events
        for listener in listeners {
            if listener.try_send(event.clone()).is_err() {
                warn!(
                    "dropping state event {} for a slow or closed subscriber",
                    event.state_id
                );
            }
        }
    }

    fn action_listener(&self) -> Option<mpsc::Sender<DIDCommAction>> {
        let listeners = self.action_listeners.lock().ok()?;
        listeners
            .iter()
            .find(|listener| !listener.is_closed())
            .cloned()
    }

    /// Hands the pending message to the action listener. On success the
    /// decision is awaited on a background task; the untouched data is
    /// handed back when the listener is gone.
    async fn dispatch_action_event(
        &self,
        listener: mpsc::Sender<DIDCommAction>,
        data: EventTransientData,
    ) -> Result<(), EventTransientData> {
        let (decision_tx, decision_rx) = oneshot::channel();

        let action = DIDCommAction {
            protocol_name: DID_EXCHANGE.to_string(),
            msg: data.msg.clone(),
            properties: event_properties(&data.record, None),
            decision: Some(decision_tx),
        };

        if listener.send(action).await.is_err() {
            return Err(data);
        }

        self.spawn_decision_supervisor(decision_rx, data);
        Ok(())
    }

    fn spawn_decision_supervisor(
        &self,
        decision_rx: oneshot::Receiver<Decision>,
        data: EventTransientData,
    ) {
        let service = self.clone();

        tokio::spawn(async move {
            match decision_rx.await {
                Ok(Decision::Continue(options)) => {
                    if let Err(err) = service.resume(data, options).await {
                        warn!("continue failed: {}", err);
                    }
                }
                Ok(Decision::Stop(reason)) => {
                    let err = ExchangeError::Stopped(reason);
                    let Ok(ns_key) =
                        ns_thread_key(&data.record.namespace, &data.record.thread_id)
                    else {
                        warn!("stop on a record without a thread");
                        return;
                    };

                    let shard = service.shard(&ns_key);
                    let _guard = shard.lock_owned().await;
                    service.abandon(&data.record, &data.msg, &err).await;
                }
                Err(_) => {
                    // listener dropped the action without deciding, the
                    // connection stays parked for the accept operations
                    debug!(
                        "action event for connection {} dropped without a decision",
                        data.record.connection_id.as_ref()
                    );
                }
            }
        });
    }

    async fn resume(
        &self,
        data: EventTransientData,
        options: EventOptions,
    ) -> Result<(), ExchangeError> {
        let ns_key = ns_thread_key(&data.record.namespace, &data.record.thread_id)?;
        let shard = self.shard(&ns_key);
        let _guard = shard.lock_owned().await;

        self.execute_chain(data, options, true).await
    }
}

fn event_properties(record: &ConnectionRecord, error: Option<String>) -> EventProperties {
    EventProperties::new(
        record.connection_id.as_ref().to_string(),
        record.invitation_id.to_owned(),
        error,
    )
}

#[async_trait]
impl<TStore, TSigner, TRegistry, TOutbound> ExchangeAPI
    for ExchangeService<TStore, TSigner, TRegistry, TOutbound>
where
    TStore: Store + 'static,
    TSigner: Signer + 'static,
    TRegistry: VdriRegistry + 'static,
    TOutbound: OutboundDispatcher + 'static,
{
    async fn create_invitation(&self, label: &str) -> Result<Invitation, ExchangeError> {
        let ver_key = self.ctx.signer().create_ver_key().await?;

        let invitation = Invitation {
            msg_type: INVITATION_MSG_TYPE.to_string(),
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            recipient_keys: vec![ver_key],
            service_endpoint: self.service_endpoint.to_owned(),
            ..Default::default()
        };

        invitation.validate()?;
        self.recorder.save_invitation(&invitation).await?;

        Ok(invitation)
    }

    async fn handle_inbound(&self, msg: DIDCommMsg) -> Result<ConnectionID, ExchangeError> {
        let msg_type = msg.header().message_type.clone();
        let next = State::from_msg_type(&msg_type)?;

        let thid = self.thread_id(&msg)?;
        debug!("handling inbound {} on thread {}", msg_type, thid);

        let namespace = find_namespace(&msg_type);
        let ns_key = ns_thread_key(namespace, &thid)?;

        let shard = self.shard(&ns_key);
        let guard = shard.clone().lock_owned().await;

        let current = self.current_state(&ns_key).await?;
        if !current.can_transition_to(&next) {
            return Err(ExchangeError::InvalidStateTransition(
                current.name().to_string(),
                next.name().to_string(),
            ));
        }

        let record = self.connection_record(&msg, &thid, namespace).await?;
        let connection_id = record.connection_id.clone();

        let data = EventTransientData {
            msg,
            thread_id: thid,
            next_state: next.name().to_string(),
            record,
        };

        self.send_msg_event(
            StateMsgType::PreState,
            next.name(),
            &data.record,
            &data.msg,
            None,
        );

        if let Some(listener) = self.action_listener() {
            if let Err(err) = self.recorder.store_event_transient_data(&data).await {
                warn!("store event transient data: {}", err);
            }

            drop(guard);

            match self.dispatch_action_event(listener, data).await {
                Ok(()) => return Ok(connection_id),
                Err(data) => {
                    warn!("action listener closed, continuing with defaults");

                    let _guard = shard.lock_owned().await;
                    self.execute_chain(data, EventOptions::default(), true).await?;
                    return Ok(connection_id);
                }
            }
        }

        // no approval listener registered, auto-accept inline
        let outcome = self.execute_chain(data, EventOptions::default(), true).await;
        drop(guard);

        outcome.map(|_| connection_id)
    }

    async fn accept_invitation(
        &self,
        connection_id: &str,
        options: EventOptions,
    ) -> Result<(), ExchangeError> {
        let mut data = self
            .recorder
            .get_event_transient_data(connection_id)
            .await
            .map_err(|err| {
                ExchangeError::AcceptInvitationError(
                    ExchangeError::GetTransientData(err.to_string()).to_string(),
                )
            })?;

        let record = self
            .recorder
            .get_connection_record(connection_id)
            .await
            .map_err(|err| ExchangeError::AcceptInvitationError(err.to_string()))?;

        if record.state != STATE_NAME_INVITED {
            return Err(ExchangeError::UnexpectedState(
                record.state,
                STATE_NAME_INVITED.to_string(),
            ));
        }

        data.record = record;
        self.resume(data, options).await
    }

    async fn accept_exchange_request(
        &self,
        connection_id: &str,
        options: EventOptions,
    ) -> Result<(), ExchangeError> {
        let mut data = self
            .recorder
            .get_event_transient_data(connection_id)
            .await
            .map_err(|err| {
                ExchangeError::AcceptRequestError(
                    ExchangeError::GetTransientData(err.to_string()).to_string(),
                )
            })?;

        let record = self
            .recorder
            .get_connection_record(connection_id)
            .await
            .map_err(|err| ExchangeError::AcceptRequestError(err.to_string()))?;

        if record.state != STATE_NAME_NULL {
            return Err(ExchangeError::UnexpectedState(
                record.state,
                STATE_NAME_NULL.to_string(),
            ));
        }

        data.record = record;
        self.resume(data, options).await
    }

    async fn create_implicit_invitation(
        &self,
        label: &str,
        their_did: &str,
    ) -> Result<ConnectionID, ExchangeError> {
        let doc = self.ctx.vdri().resolve(their_did).await?;
        let destination = prepare_destination(&doc)?;

        let thid = Uuid::new_v4().to_string();

        let mut record = ConnectionRecord::new(
            ConnectionID::generate(),
            thid.clone(),
            MY_NAMESPACE,
            STATE_NAME_INVITED,
        );
        record.invitation_id = their_did.to_string();
        record.their_did = their_did.to_string();
        record.their_label = label.to_string();
        record.service_endpoint = destination.service_endpoint.to_owned();
        record.recipient_keys = destination.recipient_keys;

        self.save_new_record(&record).await?;

        let invitation = Invitation {
            msg_type: INVITATION_MSG_TYPE.to_string(),
            id: their_did.to_string(),
            label: label.to_string(),
            did: their_did.to_string(),
            ..Default::default()
        };

        let payload = serde_json::to_value(&invitation)
            .map_err(|err| ExchangeError::EntityError(err.to_string()))?;
        let msg = DIDCommMsg::from_value(payload)
            .map_err(|err| ExchangeError::EntityError(err.to_string()))?;

        let data = EventTransientData {
            msg,
            thread_id: thid,
            next_state: STATE_NAME_INVITED.to_string(),
            record: record.clone(),
        };

        self.recorder.store_event_transient_data(&data).await?;

        self.send_msg_event(
            StateMsgType::PreState,
            STATE_NAME_INVITED,
            &record,
            &data.msg,
            None,
        );

        Ok(record.connection_id)
    }

    async fn get_connection_record(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionRecord, ExchangeError> {
        self.recorder
            .get_connection_record(connection_id)
            .await
            .map_err(|err| ExchangeError::GetConnectionRecord(err.to_string()))
    }

    async fn connections(&self) -> Result<Vec<ConnectionRecord>, ExchangeError> {
        self.recorder.list_connection_records().await
    }

    fn accept(&self, msg_type: &str) -> bool {
        matches!(
            msg_type,
            INVITATION_MSG_TYPE | REQUEST_MSG_TYPE | RESPONSE_MSG_TYPE | ACK_MSG_TYPE
        )
    }

    fn register_action_event(&self, ch: mpsc::Sender<DIDCommAction>) {
        if let Ok(mut listeners) = self.action_listeners.lock() {
            if !listeners.iter().any(|existing| existing.same_channel(&ch)) {
                listeners.push(ch);
            }
        }
    }

    fn unregister_action_event(&self, ch: &mpsc::Sender<DIDCommAction>) {
        if let Ok(mut listeners) = self.action_listeners.lock() {
            listeners.retain(|existing| !existing.same_channel(ch));
        }
    }

    fn register_msg_event(&self, ch: mpsc::Sender<StateMsg>) {
        if let Ok(mut listeners) = self.msg_listeners.lock() {
            if !listeners.iter().any(|existing| existing.same_channel(&ch)) {
                listeners.push(ch);
            }
        }
    }

    fn unregister_msg_event(&self, ch: &mpsc::Sender<StateMsg>) {
        if let Ok(mut listeners) = self.msg_listeners.lock() {
            listeners.retain(|existing| !existing.same_channel(ch));
        }
    }
}
