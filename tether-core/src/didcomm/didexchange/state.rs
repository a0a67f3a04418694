use rst_common::standard::serde_json::{self, Value};

use crate::didcomm::event::EventOptions;
use crate::didcomm::types::{DIDCommMsg, Destination};
use crate::storage::types::Store;

use super::context::ExchangeContext;
use super::record::ConnectionRecord;
use super::types::{
    Ack, ExchangeError, Invitation, OutboundDispatcher, Request, Response, Signer, VdriRegistry,
    ACK_MSG_TYPE, INVITATION_MSG_TYPE, REQUEST_MSG_TYPE, RESPONSE_MSG_TYPE,
};

pub const STATE_NAME_NOOP: &str = "noop";
pub const STATE_NAME_NULL: &str = "null";
pub const STATE_NAME_INVITED: &str = "invited";
pub const STATE_NAME_REQUESTED: &str = "requested";
pub const STATE_NAME_RESPONDED: &str = "responded";
pub const STATE_NAME_COMPLETED: &str = "completed";
pub const STATE_NAME_ABANDONED: &str = "abandoned";

/// `State` is the closed set of exchange protocol states
///
/// Five live states plus two pseudo-states: [`State::Null`] stands for "no
/// record yet" and [`State::NoOp`] is the driver sentinel for "no follow-up
/// action"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    NoOp,
    Null,
    Invited,
    Requested,
    Responded,
    Completed,
    Abandoned,
}

/// `StateMachineMsg` is the per-execution input handed to a state: the
/// inbound message, the connection record loaded by the driver, and the
/// client approval options
#[derive(Debug, Clone)]
pub(crate) struct StateMachineMsg {
    pub msg: DIDCommMsg,
    pub conn_record: ConnectionRecord,
    pub options: EventOptions,
}

/// `OutboundAction` is a message a state action produced for dispatch, the
/// driver hands it to the outbound dispatcher after the record is persisted
#[derive(Debug, Clone)]
pub(crate) struct OutboundAction {
    pub payload: Value,
    pub destination: Destination,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::NoOp => STATE_NAME_NOOP,
            State::Null => STATE_NAME_NULL,
            State::Invited => STATE_NAME_INVITED,
            State::Requested => STATE_NAME_REQUESTED,
            State::Responded => STATE_NAME_RESPONDED,
            State::Completed => STATE_NAME_COMPLETED,
            State::Abandoned => STATE_NAME_ABANDONED,
        }
    }

    pub fn from_name(name: &str) -> Result<State, ExchangeError> {
        match name {
            STATE_NAME_NOOP => Ok(State::NoOp),
            STATE_NAME_NULL => Ok(State::Null),
            STATE_NAME_INVITED => Ok(State::Invited),
            STATE_NAME_REQUESTED => Ok(State::Requested),
            STATE_NAME_RESPONDED => Ok(State::Responded),
            STATE_NAME_COMPLETED => Ok(State::Completed),
            STATE_NAME_ABANDONED => Ok(State::Abandoned),
            other => Err(ExchangeError::InvalidStateName(other.to_string())),
        }
    }

    /// `from_msg_type` maps an inbound message type to the state it drives
    /// the connection into
    pub fn from_msg_type(msg_type: &str) -> Result<State, ExchangeError> {
        match msg_type {
            INVITATION_MSG_TYPE => Ok(State::Invited),
            REQUEST_MSG_TYPE => Ok(State::Requested),
            RESPONSE_MSG_TYPE => Ok(State::Responded),
            ACK_MSG_TYPE => Ok(State::Completed),
            other => Err(ExchangeError::UnrecognizedMsgType(other.to_string())),
        }
    }

    /// Static transition legality table. Terminal states never leave, the
    /// forced transition to `abandoned` is the driver's, not the table's.
    pub fn can_transition_to(&self, next: &State) -> bool {
        matches!(
            (self, next),
            (State::Null, State::Invited)
                | (State::Null, State::Requested)
                | (State::Invited, State::Requested)
                | (State::Requested, State::Responded)
                | (State::Responded, State::Completed)
        )
    }

    pub fn is_noop(&self) -> bool {
        *self == State::NoOp
    }

    /// `execute_inbound` runs the state body for an inbound message and
    /// returns the updated record, the follow-up state the driver should
    /// execute next ([`State::NoOp`] to stop), and an optional outbound
    /// message
    pub(crate) async fn execute_inbound<TStore, TSigner, TRegistry, TOutbound>(
        &self,
        msg: &StateMachineMsg,
        thid: &str,
        ctx: &ExchangeContext<TStore, TSigner, TRegistry, TOutbound>,
    ) -> Result<(ConnectionRecord, State, Option<OutboundAction>), ExchangeError>
    where
        TStore: Store,
        TSigner: Signer,
        TRegistry: VdriRegistry,
        TOutbound: OutboundDispatcher,
    {
        let msg_type = msg.msg.header().message_type.as_str();

        match self {
            State::NoOp => Err(ExchangeError::NoOpExecution),
            State::Abandoned => Err(ExchangeError::NotImplementedError),
            State::Null => Ok((msg.conn_record.clone(), State::NoOp, None)),
            State::Invited => match msg_type {
                INVITATION_MSG_TYPE => Ok((msg.conn_record.clone(), State::Requested, None)),
                other => Err(self.illegal_msg_type(other)),
            },
            State::Requested => match msg_type {
                INVITATION_MSG_TYPE => {
                    let invitation: Invitation = decode_payload(&msg.msg, "invitation")?;
                    let (record, outbound) = ctx
                        .handle_inbound_invitation(
                            &invitation,
                            thid,
                            &msg.options,
                            &msg.conn_record,
                        )
                        .await?;

                    Ok((record, State::NoOp, Some(outbound)))
                }
                REQUEST_MSG_TYPE => Ok((msg.conn_record.clone(), State::Responded, None)),
                other => Err(self.illegal_msg_type(other)),
            },
            State::Responded => match msg_type {
                REQUEST_MSG_TYPE => {
                    let request: Request = decode_payload(&msg.msg, "request")?;
                    let (record, outbound) = ctx
                        .handle_inbound_request(&request, &msg.options, &msg.conn_record)
                        .await?;

                    Ok((record, State::NoOp, Some(outbound)))
                }
                RESPONSE_MSG_TYPE => Ok((msg.conn_record.clone(), State::Completed, None)),
                other => Err(self.illegal_msg_type(other)),
            },
            State::Completed => match msg_type {
                RESPONSE_MSG_TYPE => {
                    let response: Response = decode_payload(&msg.msg, "response")?;
                    let (record, outbound) = ctx.handle_inbound_response(&response).await?;

                    Ok((record, State::NoOp, Some(outbound)))
                }
                ACK_MSG_TYPE => {
                    let _ack: Ack = decode_payload(&msg.msg, "ack")?;
                    Ok((msg.conn_record.clone(), State::NoOp, None))
                }
                other => Err(self.illegal_msg_type(other)),
            },
        }
    }

    fn illegal_msg_type(&self, msg_type: &str) -> ExchangeError {
        ExchangeError::IllegalMsgType(msg_type.to_string(), self.name().to_string())
    }
}

fn decode_payload<T>(msg: &DIDCommMsg, kind: &str) -> Result<T, ExchangeError>
where
    T: rst_common::standard::serde::de::DeserializeOwned,
{
    serde_json::from_value(msg.payload().clone())
        .map_err(|err| ExchangeError::JSONUnmarshalError(kind.to_string(), err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use rst_common::standard::serde_json::json;
    use rst_common::with_tokio::tokio;

    use crate::didcomm::didexchange::context::ExchangeContext;
    use crate::didcomm::didexchange::record::{ConnectionID, Recorder, THEIR_NAMESPACE};
    use crate::storage::memory::MemoryStore;

    use crate::diddoc::Document;

    fn all_states() -> Vec<State> {
        vec![
            State::Null,
            State::Invited,
            State::Requested,
            State::Responded,
            State::Completed,
            State::Abandoned,
        ]
    }

    #[test]
    fn test_noop_state() {
        let noop = State::NoOp;
        assert_eq!(noop.name(), "noop");

        for state in all_states() {
            assert!(!noop.can_transition_to(&state));
        }
    }

    #[test]
    fn test_null_state_transitions() {
        let null = State::Null;
        assert_eq!(null.name(), "null");
        assert!(!null.can_transition_to(&State::Null));
        assert!(null.can_transition_to(&State::Invited));
        assert!(null.can_transition_to(&State::Requested));
        assert!(!null.can_transition_to(&State::Responded));
        assert!(!null.can_transition_to(&State::Completed));
    }

    #[test]
    fn test_invited_state_transitions() {
        let invited = State::Invited;
        assert_eq!(invited.name(), "invited");
        assert!(!invited.can_transition_to(&State::Null));
        assert!(!invited.can_transition_to(&State::Invited));
        assert!(invited.can_transition_to(&State::Requested));
        assert!(!invited.can_transition_to(&State::Responded));
        assert!(!invited.can_transition_to(&State::Completed));
    }

    #[test]
    fn test_requested_state_transitions() {
        let requested = State::Requested;
        assert_eq!(requested.name(), "requested");
        assert!(!requested.can_transition_to(&State::Null));
        assert!(!requested.can_transition_to(&State::Invited));
        assert!(!requested.can_transition_to(&State::Requested));
        assert!(requested.can_transition_to(&State::Responded));
        assert!(!requested.can_transition_to(&State::Completed));
    }

    #[test]
    fn test_responded_state_transitions() {
        let responded = State::Responded;
        assert_eq!(responded.name(), "responded");
        assert!(!responded.can_transition_to(&State::Null));
        assert!(!responded.can_transition_to(&State::Invited));
        assert!(!responded.can_transition_to(&State::Requested));
        assert!(!responded.can_transition_to(&State::Responded));
        assert!(responded.can_transition_to(&State::Completed));
    }

    #[test]
    fn test_terminal_states_never_leave() {
        for terminal in [State::Completed, State::Abandoned] {
            for state in all_states() {
                assert!(!terminal.can_transition_to(&state));
            }
        }
    }

    #[test]
    fn test_from_msg_type() {
        assert_eq!(
            State::from_msg_type(INVITATION_MSG_TYPE).unwrap(),
            State::Invited
        );
        assert_eq!(
            State::from_msg_type(REQUEST_MSG_TYPE).unwrap(),
            State::Requested
        );
        assert_eq!(
            State::from_msg_type(RESPONSE_MSG_TYPE).unwrap(),
            State::Responded
        );
        assert_eq!(State::from_msg_type(ACK_MSG_TYPE).unwrap(), State::Completed);

        let invalid = State::from_msg_type("invalid");
        assert!(invalid.is_err());
        assert!(invalid
            .unwrap_err()
            .to_string()
            .contains("unrecognized msgType: invalid"));
    }

    #[test]
    fn test_from_name() {
        for state in all_states() {
            let rebuilt = State::from_name(state.name()).unwrap();
            assert_eq!(rebuilt, state);
        }
        assert_eq!(State::from_name("noop").unwrap(), State::NoOp);

        let undefined = State::from_name("undefined");
        assert!(undefined.is_err());
        assert!(undefined
            .unwrap_err()
            .to_string()
            .contains("invalid state name"));
    }

    fn generate_ctx() -> ExchangeContext<
        MemoryStore,
        crate::didcomm::didexchange::context::tests::FakeSigner,
        crate::didcomm::didexchange::context::tests::FakeRegistry,
        crate::didcomm::didexchange::context::tests::FakeOutbound,
    > {
        let recorder = Recorder::new(MemoryStore::new(), MemoryStore::new());
        ExchangeContext::new(
            crate::didcomm::didexchange::context::tests::FakeSigner::new(),
            crate::didcomm::didexchange::context::tests::FakeRegistry::with_create(
                Document::default(),
            ),
            crate::didcomm::didexchange::context::tests::FakeOutbound::new(),
            recorder,
        )
    }

    fn generate_msg(msg_type: &str) -> StateMachineMsg {
        StateMachineMsg {
            msg: DIDCommMsg::from_value(json!({"@type": msg_type, "@id": "msg-id"})).unwrap(),
            conn_record: ConnectionRecord::new(
                ConnectionID::generate(),
                "thread-1".to_string(),
                THEIR_NAMESPACE,
                STATE_NAME_NULL,
            ),
            options: EventOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_noop_execute_fails() {
        let ctx = generate_ctx();
        let outcome = State::NoOp
            .execute_inbound(&generate_msg(ACK_MSG_TYPE), "thread-1", &ctx)
            .await;

        assert!(outcome.is_err());
        assert!(outcome
            .unwrap_err()
            .to_string()
            .contains("cannot execute no-op"));
    }

    #[tokio::test]
    async fn test_null_execute_is_noop() {
        let ctx = generate_ctx();
        let outcome = State::Null
            .execute_inbound(&generate_msg(ACK_MSG_TYPE), "thread-1", &ctx)
            .await;

        assert!(outcome.is_ok());
        let (_, followup, outbound) = outcome.unwrap();
        assert!(followup.is_noop());
        assert!(outbound.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_execute_fails() {
        let ctx = generate_ctx();
        let outcome = State::Abandoned
            .execute_inbound(&generate_msg(RESPONSE_MSG_TYPE), "thread-1", &ctx)
            .await;

        assert!(outcome.is_err());
        assert_eq!(outcome.unwrap_err(), ExchangeError::NotImplementedError);
    }

    #[tokio::test]
    async fn test_invited_rejects_non_invitations() {
        let ctx = generate_ctx();
        for other in [REQUEST_MSG_TYPE, RESPONSE_MSG_TYPE, ACK_MSG_TYPE] {
            let outcome = State::Invited
                .execute_inbound(&generate_msg(other), "thread-1", &ctx)
                .await;

            assert!(outcome.is_err());
            assert!(outcome
                .unwrap_err()
                .to_string()
                .contains("illegal msg type"));
        }
    }

    #[tokio::test]
    async fn test_invited_follows_up_to_requested() {
        let ctx = generate_ctx();
        let outcome = State::Invited
            .execute_inbound(&generate_msg(INVITATION_MSG_TYPE), "thread-1", &ctx)
            .await;

        assert!(outcome.is_ok());
        let (_, followup, _) = outcome.unwrap();
        assert_eq!(followup, State::Requested);
    }

    #[tokio::test]
    async fn test_requested_rejects_responses_and_acks() {
        let ctx = generate_ctx();
        for other in [RESPONSE_MSG_TYPE, ACK_MSG_TYPE] {
            let outcome = State::Requested
                .execute_inbound(&generate_msg(other), "thread-1", &ctx)
                .await;
            assert!(outcome
                .unwrap_err()
                .to_string()
                .contains("illegal msg type"));
        }
    }

    #[tokio::test]
    async fn test_requested_follows_up_to_responded_on_request() {
        let ctx = generate_ctx();
        let outcome = State::Requested
            .execute_inbound(&generate_msg(REQUEST_MSG_TYPE), "thread-1", &ctx)
            .await;

        let (_, followup, outbound) = outcome.unwrap();
        assert_eq!(followup, State::Responded);
        assert!(outbound.is_none());
    }

    #[tokio::test]
    async fn test_responded_rejects_invitations_and_acks() {
        let ctx = generate_ctx();
        for other in [INVITATION_MSG_TYPE, ACK_MSG_TYPE] {
            let outcome = State::Responded
                .execute_inbound(&generate_msg(other), "thread-1", &ctx)
                .await;
            assert!(outcome
                .unwrap_err()
                .to_string()
                .contains("illegal msg type"));
        }
    }

    #[tokio::test]
    async fn test_responded_follows_up_to_completed_on_response() {
        let ctx = generate_ctx();
        let outcome = State::Responded
            .execute_inbound(&generate_msg(RESPONSE_MSG_TYPE), "thread-1", &ctx)
            .await;

        let (_, followup, _) = outcome.unwrap();
        assert_eq!(followup, State::Completed);
    }

    #[tokio::test]
    async fn test_completed_rejects_invitations_and_requests() {
        let ctx = generate_ctx();
        for other in [INVITATION_MSG_TYPE, REQUEST_MSG_TYPE] {
            let outcome = State::Completed
                .execute_inbound(&generate_msg(other), "thread-1", &ctx)
                .await;
            assert!(outcome
                .unwrap_err()
                .to_string()
                .contains("illegal msg type"));
        }
    }

    #[tokio::test]
    async fn test_completed_ack_has_no_followup() {
        let ctx = generate_ctx();
        let msg = StateMachineMsg {
            msg: DIDCommMsg::from_value(json!({
                "@type": ACK_MSG_TYPE,
                "@id": "ack-id",
                "status": "OK",
                "~thread": {"thid": "thread-1"},
            }))
            .unwrap(),
            ..generate_msg(ACK_MSG_TYPE)
        };

        let outcome = State::Completed.execute_inbound(&msg, "thread-1", &ctx).await;

        let (_, followup, outbound) = outcome.unwrap();
        assert!(followup.is_noop());
        assert!(outbound.is_none());
    }
}
