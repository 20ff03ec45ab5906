//! Secure-messaging core for ephemeral room chat.
//!
//! Peers that found each other through a room-keyed discovery swarm
//! get an authenticated, forward-secret, traffic-shaped channel:
//! a per-message key ratchet with periodic DH rotation, a room-PSK
//! verification gate, bucket-padded frames with timestamp jitter,
//! constant-cadence cover traffic, and a chunked file path.

pub mod cli;
pub mod crypto;
pub mod error;
pub mod files;
pub mod framing;
pub mod protocol;
pub mod session;
pub mod swarm;
