//! Peer-to-peer networking: wire protocol and TCP transport.

pub mod p2p;
pub mod protocol;

pub use protocol::{Message, PeerId, Topic};
