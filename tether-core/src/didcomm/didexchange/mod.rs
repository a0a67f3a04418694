//! # DID-Exchange Module
//!
//! The `didexchange` module implements the protocol negotiating a pairwise
//! connection between two agents over four asynchronous messages:
//! `Invitation`, `Request`, `Response` and `Ack`.
//!
//! ## Module Structure
//!
//! - [`types`] - Message entities, the protocol error type, and the
//!   collaborator traits the engine consumes
//! - [`record`] - The durable `ConnectionRecord` entity and the `Recorder`
//!   indexing records by connection id and by namespaced thread id
//! - [`signature`] - The signed connection container exchanged inside a
//!   `Response`
//! - [`state`] - The per-connection state machine and its legal transitions
//! - [`context`] - The collaborator bundle executed by the state actions
//! - [`service`] - The inbound dispatch driver and the client-facing
//!   operations
//!
//! ## Roles
//!
//! Both roles of the protocol run on the same engine. The *inviter* creates
//! an invitation, answers the incoming request with a signed response, and
//! completes on the acknowledgement. The *invitee* consumes an invitation,
//! emits the request, verifies the signed response and acknowledges it.
//!
//! Client approval sits between the inbound message and the state action:
//! when an action listener is registered, the engine suspends the protocol
//! instance until the client continues or stops it.
pub mod context;
pub mod record;
pub mod service;
pub mod signature;
pub mod state;
pub mod types;
