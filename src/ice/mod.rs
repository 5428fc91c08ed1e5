//! Per-peer connectivity establishment.
//!
//! ```text
//! candidates.rs  - candidate exchange payload, pack/unpack ordering rules
//! module.rs      - PeerIceModule state machine and data-channel framing
//! checker.rs     - liveness probes and RTT tracking (offerer side)
//! turn.rs        - relay lease refreshing
//! ```
//!
//! The modules drive an [`crate::engine::IceAgent`] and never touch sockets
//! themselves; timing policy, retries and the exchange protocol live here.

pub mod candidates;
pub mod checker;
pub mod module;
pub mod turn;

pub use candidates::{CandidatePacket, CandidatesMessage};
pub use module::{IceState, PeerIceModule};
