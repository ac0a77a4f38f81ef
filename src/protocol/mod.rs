//! Wire protocol for Losant devices
//!
//! Topic derivation lives in [`topics`]; payload encoding and decoding for
//! state reports and commands lives in [`messages`].

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
