//! Cipherlink end-to-end encryption core: identity keys, a signed-ECDH
//! handshake, session-key lifecycle, and the AEAD codec for messages and
//! files. Transport-agnostic: no networking lives in this crate.

pub mod aead;
pub mod canonical;
pub mod clock;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod session_key;
pub mod vault;

pub use error::{CoreError, CoreResult};
