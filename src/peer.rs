//! Peer: one remote player, one loopback relay socket, one connectivity module.

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::engine::{IceEngine, IceServer};
use crate::ice::module::{IceModuleContext, PeerIceModule};
use crate::rpc::RpcLink;

/// Poll period for the game-socket read loop; bounds teardown latency.
const GAME_RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Shared surroundings a session hands to each peer it creates.
#[derive(Clone)]
pub struct PeerContext {
    pub local_id: i64,
    /// Port the local game listens on for peer traffic.
    pub lobby_port: u16,
    pub rpc: RpcLink,
    pub engine: Arc<dyn IceEngine>,
    pub ice_servers: Arc<Mutex<Vec<IceServer>>>,
}

pub struct Peer {
    remote_id: i64,
    remote_login: String,
    local_offer: bool,
    /// Ephemeral loopback socket the game addresses this peer through.
    game_socket: Arc<UdpSocket>,
    closing: AtomicBool,
    ice: Arc<PeerIceModule>,
}

impl Peer {
    /// Bind the relay socket and start forwarding. Failing to bind is fatal
    /// to the peer and surfaces as an error to the caller.
    pub fn new(
        ctx: &PeerContext,
        remote_id: i64,
        remote_login: String,
        local_offer: bool,
    ) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.set_read_timeout(Some(GAME_RECV_TIMEOUT))?;
        let game_socket = Arc::new(socket);

        let ice = PeerIceModule::new(
            IceModuleContext {
                local_id: ctx.local_id,
                remote_id,
                local_offer,
                lobby_port: ctx.lobby_port,
                game_socket: game_socket.clone(),
                rpc: ctx.rpc.clone(),
            },
            ctx.engine.clone(),
            ctx.ice_servers.clone(),
        );

        let peer = Arc::new(Peer {
            remote_id,
            remote_login,
            local_offer,
            game_socket,
            closing: AtomicBool::new(false),
            ice,
        });

        log::debug!(
            "Peer created: {}, {}, localOffer: {}",
            remote_id,
            peer.remote_login,
            local_offer
        );

        let listener = peer.clone();
        thread::spawn(move || listener.game_listener());

        if local_offer {
            let ice = peer.ice.clone();
            thread::spawn(move || ice.initiate_ice());
        }

        Ok(peer)
    }

    pub fn remote_id(&self) -> i64 {
        self.remote_id
    }

    pub fn remote_login(&self) -> &str {
        &self.remote_login
    }

    pub fn is_offerer(&self) -> bool {
        self.local_offer
    }

    /// Port of the relay socket; handed to the game so it can address this peer.
    pub fn local_port(&self) -> u16 {
        self.game_socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    pub fn ice(&self) -> &Arc<PeerIceModule> {
        &self.ice
    }

    /// Reads datagrams the game sends to this peer's relay socket.
    fn game_listener(self: Arc<Self>) {
        log::debug!(
            "Now forwarding data to peer {}, {}",
            self.remote_id,
            self.remote_login
        );

        let mut buf = [0u8; 65536];
        loop {
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            match self.game_socket.recv_from(&mut buf) {
                Ok((len, _from)) => self.ice.on_game_data(&buf[..len]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    if !self.closing.load(Ordering::SeqCst) {
                        log::debug!(
                            "Error while reading from local game for peer {}: {}",
                            self.remote_id,
                            e
                        );
                    }
                    break;
                }
            }
        }

        log::debug!("No longer listening for messages from the game");
    }

    /// Release the socket and the connectivity module. In-flight callbacks
    /// observe the closing flag and become no-ops.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.ice.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UdpIceEngine;

    fn test_ctx() -> PeerContext {
        PeerContext {
            local_id: 1,
            lobby_port: 7238,
            rpc: RpcLink::new(),
            engine: Arc::new(UdpIceEngine::with_port_base(43000, 100)),
            ice_servers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[test]
    fn test_peer_binds_ephemeral_relay_port() {
        let ctx = test_ctx();
        let peer = Peer::new(&ctx, 5, "Rhiza".to_string(), false).unwrap();
        assert_ne!(peer.local_port(), 0);
        assert_eq!(peer.remote_id(), 5);
        assert_eq!(peer.remote_login(), "Rhiza");
        assert!(!peer.is_offerer());
        peer.close();
    }

    #[test]
    fn test_two_peers_get_distinct_ports() {
        let ctx = test_ctx();
        let a = Peer::new(&ctx, 1, "a".to_string(), false).unwrap();
        let b = Peer::new(&ctx, 2, "b".to_string(), false).unwrap();
        assert_ne!(a.local_port(), b.local_port());
        a.close();
        b.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let ctx = test_ctx();
        let peer = Peer::new(&ctx, 5, "x".to_string(), false).unwrap();
        peer.close();
        peer.close();
    }
}
