//! Bridge between a loopback-only game process and remote peers behind NAT.
//!
//! The adapter speaks three protocols at once: the game's binary lobby
//! protocol on a local TCP port, a JSON-RPC control plane for the external
//! orchestrator, and an ICE-style candidate exchange that establishes the
//! actual peer-to-peer UDP paths. Game traffic is relayed between a per-peer
//! loopback socket and the established data channel.

pub mod adapter;
pub mod engine;
pub mod gpgnet;
pub mod ice;
pub mod peer;
pub mod rpc;
pub mod session;
pub mod util;
