//! Protocol module for the presence exchange.
//!
//! The peripheral asserts an input event with a one-byte notification and
//! the host answers with a one-byte acknowledge write.

pub mod presence;

pub use presence::{
    Acknowledge, ProtocolHandler, ProtocolStats, ACKNOWLEDGE_PAYLOAD, ASSERTED_MARKER,
};
