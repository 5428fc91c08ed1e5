//! Game session: the set of active peers for one game, plus the configured
//! ICE server list.
//!
//! Created by a HostGame/JoinGame request from the orchestrator, destroyed as
//! a unit when the game-facing connection goes away.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::engine::IceServer;
use crate::ice::candidates::CandidatesMessage;
use crate::peer::{Peer, PeerContext};

/// Default STUN/TURN port when the url does not name one.
const DEFAULT_ICE_PORT: u16 = 3478;

// ============================================================================
// Session
// ============================================================================

pub struct GameSession {
    ctx: PeerContext,
    peers: Mutex<HashMap<i64, Arc<Peer>>>,
}

impl GameSession {
    pub fn new(ctx: PeerContext) -> Arc<Self> {
        Arc::new(GameSession {
            ctx,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Create a peer and start connecting to it. Returns the local relay port
    /// the game should use for this peer.
    pub fn connect_to_peer(
        &self,
        remote_login: &str,
        remote_id: i64,
        offer: bool,
    ) -> io::Result<u16> {
        let mut peers = self.peers.lock().unwrap();
        let peer = Peer::new(&self.ctx, remote_id, remote_login.to_string(), offer)?;
        let port = peer.local_port();
        if let Some(stale) = peers.insert(remote_id, peer) {
            log::warn!("Replacing existing peer {}", remote_id);
            stale.close();
        }
        Ok(port)
    }

    /// Close and remove the peer. No-op when absent.
    pub fn disconnect_from_peer(&self, remote_id: i64) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(peer) = peers.get(&remote_id) {
            peer.close();
            peers.remove(&remote_id);
        }
    }

    /// Route an inbound candidates message to the matching peer.
    /// Returns false when no such peer exists.
    pub fn route_ice_message(&self, remote_id: i64, message: CandidatesMessage) -> bool {
        let peer = self.peers.lock().unwrap().get(&remote_id).cloned();
        match peer {
            Some(peer) => {
                peer.ice().on_ice_message_received(message);
                true
            }
            None => false,
        }
    }

    /// Run `f` with the peer map locked; status snapshots use this so they
    /// never observe a torn iteration.
    pub fn with_peers<R>(&self, f: impl FnOnce(&HashMap<i64, Arc<Peer>>) -> R) -> R {
        let peers = self.peers.lock().unwrap();
        f(&peers)
    }

    /// Close every peer. Safe to call on an already-empty session.
    pub fn close(&self) {
        let mut peers = self.peers.lock().unwrap();
        for peer in peers.values() {
            peer.close();
        }
        peers.clear();
    }
}

// ============================================================================
// ICE Server Parsing
// ============================================================================

/// One ICE server entry as delivered over the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct IceServerEntry {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Parse the control-plane server list. Malformed urls are skipped, never fatal.
pub fn parse_ice_servers(entries: &[IceServerEntry]) -> Vec<IceServer> {
    let mut servers = Vec::new();
    for entry in entries {
        let mut server = IceServer {
            username: entry.username.clone(),
            credential: entry.credential.clone(),
            ..IceServer::default()
        };
        for url in &entry.urls {
            match parse_ice_server_url(url) {
                Some((true, endpoint)) => server.stun.push(endpoint),
                Some((false, endpoint)) => server.turn.push(endpoint),
                None => log::debug!("Skipping malformed ice server url: {}", url),
            }
        }
        if server.address_count() > 0 {
            servers.push(server);
        }
    }
    servers
}

/// Parse `stun:host[:port]` / `turn:host[:port][?transport=udp|tcp]`.
/// Returns `(is_stun, "host:port")`.
fn parse_ice_server_url(url: &str) -> Option<(bool, String)> {
    let (is_stun, rest) = if let Some(rest) = url.strip_prefix("stun:") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("turn:") {
        (false, rest)
    } else {
        return None;
    };

    let rest = match rest.split_once('?') {
        Some((host_part, query)) => {
            if !is_stun && !query.is_empty() && query != "transport=udp" && query != "transport=tcp"
            {
                return None;
            }
            host_part
        }
        None => rest,
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None => (rest, DEFAULT_ICE_PORT),
    };
    if host.is_empty() || !host.chars().all(|c| c.is_alphanumeric() || c == '.' || c == '-') {
        return None;
    }

    Some((is_stun, format!("{}:{}", host, port)))
}

// ============================================================================
// Tests
// ============================================================================
