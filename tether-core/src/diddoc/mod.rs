//! `diddoc` holds the `DID Document` entity the exchange protocol operates
//! on.
//!
//! The engine never creates or resolves documents itself, that is the job of
//! the injected `VDRI` registry. What it does need is a concrete document
//! shape: the `did-communication` service advertising the peer's inbound
//! endpoint, and the `Ed25519` verification keys the connection signature is
//! built from.
pub mod doc;

pub use doc::{DocError, Document, PublicKey, Service};
