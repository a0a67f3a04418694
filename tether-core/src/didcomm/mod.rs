//! `didcomm` is the messaging domain of the agent.
//!
//! It carries the pieces every `DIDComm` protocol shares, the unpacked
//! message envelope and thread decorator in [`types`], and the client event
//! channels in [`event`], together with the protocol engines themselves.
//! [`didexchange`] is the engine negotiating pairwise connections between
//! two agents.
//!
//! Envelope encryption sits outside this module: inbound payloads are
//! expected to be already unpacked by the packer in front of the agent, and
//! outbound payloads are handed to the outbound dispatcher which packs and
//! transports them.
pub mod didexchange;
pub mod event;
pub mod types;
