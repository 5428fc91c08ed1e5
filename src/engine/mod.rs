//! ICE engine capability interface.
//!
//! The connectivity modules never touch sockets or check lists directly; they
//! drive an engine through this small surface so the engine stays swappable
//! (tests use a fake, production uses the UDP engine in [`agent`]).

pub mod agent;
pub mod stun;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use agent::UdpIceEngine;

// ============================================================================
// Candidate Types
// ============================================================================

/// Kind of ICE candidate, in wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateKind {
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relayed")]
    Relayed,
}

impl CandidateKind {
    /// Type preference for priority calculation (RFC 8445 section 5.1.2.1).
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relayed => 0,
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateKind::Host => write!(f, "host"),
            CandidateKind::ServerReflexive => write!(f, "srflx"),
            CandidateKind::PeerReflexive => write!(f, "prflx"),
            CandidateKind::Relayed => write!(f, "relayed"),
        }
    }
}

/// One candidate address as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub addr: SocketAddr,
    pub priority: u64,
    pub foundation: String,
    pub protocol: String,
    /// Base address for reflexive/relayed candidates.
    pub related: Option<SocketAddr>,
}

impl Candidate {
    pub fn new(kind: CandidateKind, addr: SocketAddr, related: Option<SocketAddr>) -> Self {
        Candidate {
            kind,
            addr,
            priority: calculate_priority(kind.type_preference(), local_preference(&addr), 1),
            foundation: format!("{}_{}", kind, addr.ip()),
            protocol: "udp".to_string(),
            related,
        }
    }

    pub fn host(addr: SocketAddr) -> Self {
        Candidate::new(CandidateKind::Host, addr, None)
    }

    pub fn server_reflexive(addr: SocketAddr, base: SocketAddr) -> Self {
        Candidate::new(CandidateKind::ServerReflexive, addr, Some(base))
    }

    pub fn relayed(addr: SocketAddr, base: SocketAddr) -> Self {
        Candidate::new(CandidateKind::Relayed, addr, Some(base))
    }
}

/// Candidate priority per RFC 8445 section 5.1.2.1.
pub fn calculate_priority(type_pref: u32, local_pref: u32, component_id: u32) -> u64 {
    let type_pref = type_pref.min(126) as u64;
    let local_pref = local_pref.min(65535) as u64;
    let component_id = component_id.clamp(1, 256) as u64;
    (type_pref << 24) | (local_pref << 8) | (256 - component_id)
}

fn local_preference(addr: &SocketAddr) -> u32 {
    if addr.is_ipv4() {
        65535
    } else {
        65534
    }
}

// ============================================================================
// Server Configuration
// ============================================================================

/// One configured ICE server entry (parsed from the control plane).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceServer {
    /// STUN endpoints as `host:port`.
    pub stun: Vec<String>,
    /// Relay (TURN) endpoints as `host:port`.
    pub turn: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn address_count(&self) -> usize {
        self.stun.len() + self.turn.len()
    }
}

// ============================================================================
// Engine Traits
// ============================================================================

/// Progress of connectivity establishment inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// The candidate pair the engine settled on.
#[derive(Debug, Clone)]
pub struct SelectedPair {
    pub local: Candidate,
    pub remote: Candidate,
}

/// Factory for ICE agents.
pub trait IceEngine: Send + Sync {
    fn create_agent(
        &self,
        controlling: bool,
        servers: &[IceServer],
    ) -> io::Result<Arc<dyn IceAgent>>;
}

/// One ICE agent: a single candidate component plus its data path.
pub trait IceAgent: Send + Sync {
    fn local_ufrag(&self) -> String;
    fn local_password(&self) -> String;
    fn generation(&self) -> u32;

    /// Harvest local candidates. Blocks for the STUN/relay round trips.
    fn gather_candidates(&self) -> io::Result<Vec<Candidate>>;

    fn set_remote_credentials(&self, ufrag: &str, password: &str);
    fn add_remote_candidate(&self, candidate: Candidate);

    /// Begin connectivity checks against the registered remote candidates.
    fn start_checks(&self);
    fn check_phase(&self) -> CheckPhase;
    fn selected_pair(&self) -> Option<SelectedPair>;

    /// Send one datagram to the connected peer.
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Receive one datagram from the connected peer. `Ok(None)` on timeout,
    /// `Err` once the agent has been freed.
    fn recv(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;

    /// Renew the relay allocation backing a relayed candidate, if one is in use.
    fn refresh_relay(&self) -> io::Result<()>;

    /// Release the agent's socket and stop its workers. Idempotent.
    fn free(&self);
}

// ============================================================================
// Tests
// ============================================================================
