use rst_common::with_tokio::tokio::sync::{mpsc, oneshot};

use super::types::DIDCommMsg;

/// Buffer size used when a client builds its event channels, event delivery
/// never blocks so a slow consumer only costs itself dropped notifications
pub const EVENT_CHANNEL_BUFFER: usize = 10;

/// `StateMsgType` tags a state notification as emitted before or after the
/// state action ran
#[derive(Debug, Clone, PartialEq)]
pub enum StateMsgType {
    PreState,
    PostState,
}

/// `EventProperties` lets listeners correlate an event back to a connection
///
/// The `error` field is only populated on the `abandoned` post-state
/// notification emitted for a failed transition
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventProperties {
    connection_id: String,
    invitation_id: String,
    error: Option<String>,
}

impl EventProperties {
    pub fn new(connection_id: String, invitation_id: String, error: Option<String>) -> Self {
        Self {
            connection_id,
            invitation_id,
            error,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn invitation_id(&self) -> &str {
        &self.invitation_id
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// `StateMsg` is a fire-and-forget state notification
#[derive(Debug, Clone)]
pub struct StateMsg {
    pub protocol_name: String,
    pub state_type: StateMsgType,
    pub state_id: String,
    pub properties: EventProperties,
    pub msg: Option<DIDCommMsg>,
}

/// `EventOptions` carries the client inputs attached to an approval:
/// an optional public `DID` the client wants the new connection bound to,
/// and an optional label override
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventOptions {
    pub public_did: Option<String>,
    pub label: Option<String>,
}

/// `Decision` is the client verdict on a pending action event
#[derive(Debug)]
pub(crate) enum Decision {
    Continue(EventOptions),
    Stop(String),
}

/// `DIDCommAction` is delivered to action listeners before a state action
/// runs
///
/// Exactly one of [`DIDCommAction::continue_with`] or
/// [`DIDCommAction::stop`] must be called, the protocol instance stays
/// suspended until the verdict arrives. Dropping the action without deciding
/// leaves the instance parked, it can still be resumed through the accept
/// operations of the client surface.
#[derive(Debug)]
pub struct DIDCommAction {
    pub protocol_name: String,
    pub msg: DIDCommMsg,
    pub properties: EventProperties,
    pub(crate) decision: Option<oneshot::Sender<Decision>>,
}

impl DIDCommAction {
    /// Approves the pending action, `options` may carry a public `DID` and a
    /// label to use while building the outbound message
    pub fn continue_with(mut self, options: EventOptions) {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(Decision::Continue(options));
        }
    }

    /// Rejects the pending action, the connection transitions to `abandoned`
    pub fn stop(mut self, reason: String) {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(Decision::Stop(reason));
        }
    }
}

/// `auto_execute_action_event` drains an action channel, approving every
/// pending action with default options
///
/// Clients that only care about state notifications run this in a task so
/// the engine never waits on them
pub async fn auto_execute_action_event(mut receiver: mpsc::Receiver<DIDCommAction>) {
    while let Some(action) = receiver.recv().await {
        action.continue_with(EventOptions::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rst_common::standard::serde_json::json;
    use rst_common::with_tokio::tokio;

    fn generate_action(decision: oneshot::Sender<Decision>) -> DIDCommAction {
        DIDCommAction {
            protocol_name: "didexchange".to_string(),
            msg: DIDCommMsg::from_value(json!({"@type": "t", "@id": "id"})).unwrap(),
            properties: EventProperties::default(),
            decision: Some(decision),
        }
    }

    #[tokio::test]
    async fn test_continue_sends_decision() {
        let (tx, rx) = oneshot::channel();
        let action = generate_action(tx);

        action.continue_with(EventOptions {
            public_did: Some("did:test:abc".to_string()),
            label: None,
        });

        let decision = rx.await.unwrap();
        assert!(
            matches!(decision, Decision::Continue(opts) if opts.public_did.as_deref() == Some("did:test:abc"))
        );
    }

    #[tokio::test]
    async fn test_stop_sends_decision() {
        let (tx, rx) = oneshot::channel();
        let action = generate_action(tx);

        action.stop("invalid id".to_string());

        let decision = rx.await.unwrap();
        assert!(matches!(decision, Decision::Stop(reason) if reason == "invalid id"));
    }

    #[tokio::test]
    async fn test_dropped_action_closes_channel() {
        let (tx, rx) = oneshot::channel();
        let action = generate_action(tx);
        drop(action);

        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_auto_execute_continues_all() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let handle = tokio::spawn(auto_execute_action_event(rx));

        let (decision_tx, decision_rx) = oneshot::channel();
        tx.send(generate_action(decision_tx)).await.unwrap();

        let decision = decision_rx.await.unwrap();
        assert!(matches!(decision, Decision::Continue(_)));

        drop(tx);
        handle.await.unwrap();
    }
}
