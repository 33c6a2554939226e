//! Trust-and-delivery control plane for an end-to-end-encrypted group relay.
//!
//! The relay only ever handles opaque ciphertext. This crate decides who may
//! fan out to which devices ([`gate`]), what a storable envelope looks like
//! ([`envelope`]), who is online ([`presence`]) and who may learn about it
//! ([`broadcast`]).

pub mod broadcast;
pub mod envelope;
pub mod error;
pub mod gate;
pub mod keys;
pub mod model;
pub mod presence;
pub mod session;
pub mod store;

pub use error::{RelayError, RelayResult, StoreError, StoreResult};
pub use model::DeviceRef;
