//! `tether-core` is the protocol engine of the `tether` agent, a peer-to-peer
//! messaging agent built on `DID (Decentralized Identifier)` and `DIDComm`.
//!
//! The crate is organized into three domains:
//!
//! - [`diddoc`] holds the `DID Document` entity consumed and produced by the
//!   protocol engine. Creation and resolution of the documents themselves is
//!   delegated to a `VDRI` registry implementation supplied by the embedder.
//! - [`storage`] defines the storage seam (`Store` / `StorageProvider`) used
//!   to persist protocol state, together with an in-memory adapter.
//! - [`didcomm`] contains the `DIDComm` plumbing (unpacked message envelope,
//!   event channels) and the `didexchange` protocol engine itself: the
//!   per-connection state machine, the inbound dispatch driver, and the
//!   client-facing operations.
//!
//! The engine deliberately stops at narrow collaborator seams. Transports,
//! envelope encryption, key management and `DID` method implementations are
//! all injected through the traits defined in
//! [`didcomm::didexchange::types`], which keeps this crate focused on the
//! exchange semantics and lets the outer agent wire in its own
//! infrastructure.
pub mod didcomm;
pub mod diddoc;
pub mod storage;
