//! Top-level controller.
//!
//! Owns at most one game session and the game-facing server, and turns
//! control-plane requests into session/peer operations. Connect and
//! disconnect are fire-and-forget for the caller; outcomes surface through
//! notifications and the status snapshot.

use std::io;
use std::sync::{Arc, Mutex};

use crate::engine::{IceEngine, IceServer};
use crate::gpgnet::message::Chunk;
use crate::gpgnet::server::{GpgNetConfig, GpgNetServer};
use crate::gpgnet::LobbyInitMode;
use crate::ice::candidates::CandidatesMessage;
use crate::peer::PeerContext;
use crate::rpc::status::{GpgNetState, IceOptions, IceRelay, IceRelayState, IceStatus};
use crate::rpc::RpcLink;
use crate::session::GameSession;
use crate::util::{self, Signal};

/// Scan range for the auto-selected lobby port.
const PORT_SCAN_FROM: u16 = 20000;
const PORT_SCAN_TO: u16 = 65535;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub local_id: i64,
    pub login: String,
    pub rpc_port: u16,
    pub gpgnet_port: u16,
    /// 0 selects a free UDP port for the game lobby.
    pub lobby_port: u16,
}

pub struct Adapter {
    cfg: AdapterConfig,
    lobby_port: u16,
    rpc: RpcLink,
    engine: Arc<dyn IceEngine>,
    ice_servers: Arc<Mutex<Vec<IceServer>>>,
    session: Mutex<Option<Arc<GameSession>>>,
    gpgnet: Arc<GpgNetServer>,
    shutdown: Arc<Signal>,
}

impl Adapter {
    pub fn new(
        cfg: AdapterConfig,
        rpc: RpcLink,
        engine: Arc<dyn IceEngine>,
    ) -> io::Result<Arc<Self>> {
        let lobby_port = if cfg.lobby_port == 0 {
            let generated = util::find_free_udp_port(PORT_SCAN_FROM, PORT_SCAN_TO)?;
            log::info!("Generated lobby port: {}", generated);
            generated
        } else {
            log::info!("Using lobby port: {}", cfg.lobby_port);
            cfg.lobby_port
        };

        let gpgnet = GpgNetServer::new(
            GpgNetConfig {
                login: cfg.login.clone(),
                local_id: cfg.local_id,
                lobby_port,
            },
            rpc.clone(),
        );

        let adapter = Arc::new(Adapter {
            cfg,
            lobby_port,
            rpc,
            engine,
            ice_servers: Arc::new(Mutex::new(Vec::new())),
            session: Mutex::new(None),
            gpgnet,
            shutdown: Arc::new(Signal::new()),
        });

        let cascade = adapter.clone();
        adapter
            .gpgnet
            .set_game_lost_handler(Arc::new(move || cascade.on_game_connection_lost()));

        Ok(adapter)
    }

    /// Start the game-facing server.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        self.gpgnet.start(self.cfg.gpgnet_port)?;
        Ok(())
    }

    pub fn gpgnet(&self) -> &Arc<GpgNetServer> {
        &self.gpgnet
    }

    pub fn shutdown_signal(&self) -> Arc<Signal> {
        self.shutdown.clone()
    }

    fn peer_context(&self) -> PeerContext {
        PeerContext {
            local_id: self.cfg.local_id,
            lobby_port: self.lobby_port,
            rpc: self.rpc.clone(),
            engine: self.engine.clone(),
            ice_servers: self.ice_servers.clone(),
        }
    }

    /// Replace the live session, fully closing the old one first.
    fn create_session(&self) -> Arc<GameSession> {
        let mut slot = self.session.lock().unwrap();
        if let Some(old) = slot.take() {
            old.close();
        }
        let session = GameSession::new(self.peer_context());
        *slot = Some(session.clone());
        session
    }

    fn current_session(&self) -> Option<Arc<GameSession>> {
        self.session.lock().unwrap().clone()
    }

    // ------------------------------------------------------------------
    // Control-plane operations
    // ------------------------------------------------------------------

    pub fn on_host_game(&self, map_name: &str) {
        log::info!("onHostGame");
        self.create_session();
        self.gpgnet
            .send_when_ready("HostGame".to_string(), vec![Chunk::from(map_name)]);
    }

    pub fn on_join_game(&self, remote_login: &str, remote_id: i64) {
        log::info!("onJoinGame {} {}", remote_id, remote_login);
        let session = self.create_session();
        let port = match session.connect_to_peer(remote_login, remote_id, false) {
            Ok(port) => port,
            Err(e) => {
                log::error!("Could not create peer {}: {}", remote_id, e);
                std::process::exit(1);
            }
        };
        self.gpgnet.send_when_ready(
            "JoinGame".to_string(),
            vec![
                Chunk::Str(format!("127.0.0.1:{}", port)),
                Chunk::from(remote_login),
                Chunk::Int(remote_id as i32),
            ],
        );
    }

    pub fn on_connect_to_peer(&self, remote_login: &str, remote_id: i64, offer: bool) {
        log::info!(
            "onConnectToPeer {} {}, offer: {}",
            remote_id,
            remote_login,
            offer
        );
        let session = match self.current_session() {
            Some(session) => session,
            None => {
                log::error!("connectToPeer without an active session");
                return;
            }
        };
        let port = match session.connect_to_peer(remote_login, remote_id, offer) {
            Ok(port) => port,
            Err(e) => {
                log::error!("Could not create peer {}: {}", remote_id, e);
                std::process::exit(1);
            }
        };
        self.gpgnet.send_when_ready(
            "ConnectToPeer".to_string(),
            vec![
                Chunk::Str(format!("127.0.0.1:{}", port)),
                Chunk::from(remote_login),
                Chunk::Int(remote_id as i32),
            ],
        );
    }

    pub fn on_disconnect_from_peer(&self, remote_id: i64) {
        log::info!("onDisconnectFromPeer {}", remote_id);
        if let Some(session) = self.current_session() {
            session.disconnect_from_peer(remote_id);
        }
        self.gpgnet.send_when_ready(
            "DisconnectFromPeer".to_string(),
            vec![Chunk::Int(remote_id as i32)],
        );
    }

    /// Route an inbound candidates payload to the matching peer. The remote
    /// side may be ahead of local session setup; a miss is logged, not fatal.
    pub fn on_ice_msg(&self, remote_id: i64, message: CandidatesMessage) {
        let routed = self
            .current_session()
            .map(|session| session.route_ice_message(remote_id, message))
            .unwrap_or(false);
        if !routed {
            log::error!("ICE message ignored for id: {}", remote_id);
        }
    }

    pub fn set_ice_servers(&self, servers: Vec<IceServer>) {
        let count: usize = servers.iter().map(|s| s.address_count()).sum();
        *self.ice_servers.lock().unwrap() = servers;
        log::info!("Ice servers set: {}", count);
    }

    pub fn set_lobby_init_mode(&self, mode: LobbyInitMode) {
        self.gpgnet.set_lobby_init_mode(mode);
    }

    pub fn send_to_gpgnet(&self, header: String, chunks: Vec<Chunk>) {
        self.gpgnet.send_when_ready(header, chunks);
    }

    /// Triggered by losing the game-facing connection; closes the whole
    /// session as a unit. Idempotent.
    pub fn on_game_connection_lost(&self) {
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            log::info!("Game connection gone, closing session");
            session.close();
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status(&self) -> IceStatus {
        let relays = match self.current_session() {
            Some(session) => session.with_peers(|peers| {
                peers
                    .values()
                    .map(|peer| {
                        let ice = peer.ice();
                        let pair = ice.selected_pair();
                        IceRelay {
                            remote_player_id: peer.remote_id(),
                            remote_player_login: peer.remote_login().to_string(),
                            local_game_udp_port: peer.local_port(),
                            ice: IceRelayState {
                                offerer: peer.is_offerer(),
                                state: ice.ice_state().message().to_string(),
                                gathering_state: String::new(),
                                datachannel_state: String::new(),
                                connected: ice.is_connected(),
                                loc_cand_addr: pair
                                    .as_ref()
                                    .map(|p| p.local.addr.to_string())
                                    .unwrap_or_default(),
                                rem_cand_addr: pair
                                    .as_ref()
                                    .map(|p| p.remote.addr.to_string())
                                    .unwrap_or_default(),
                                loc_cand_type: pair
                                    .as_ref()
                                    .map(|p| p.local.kind.to_string())
                                    .unwrap_or_default(),
                                rem_cand_type: pair
                                    .as_ref()
                                    .map(|p| p.remote.kind.to_string())
                                    .unwrap_or_default(),
                                time_to_connected: -1.0,
                            },
                        }
                    })
                    .collect()
            }),
            None => Vec::new(),
        };

        IceStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ice_servers_size: self
                .ice_servers
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.address_count())
                .sum(),
            lobby_port: self.lobby_port,
            init_mode: self.gpgnet.lobby_init_mode().name().to_string(),
            options: IceOptions {
                player_id: self.cfg.local_id,
                player_login: self.cfg.login.clone(),
                rpc_port: self.cfg.rpc_port,
                gpgnet_port: self.gpgnet.port(),
            },
            gpgpnet: GpgNetState {
                local_port: self.gpgnet.port(),
                connected: self.gpgnet.is_connected(),
                game_state: self.gpgnet.game_state_name(),
                task_string: "-".to_string(),
            },
            relays,
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Ordered shutdown: session, game-facing server, then the run loop
    /// (which closes the RPC service).
    pub fn quit(&self) {
        log::warn!("Close requested, stopping...");
        self.on_game_connection_lost();
        self.gpgnet.close();
        self.shutdown.set();
    }
}

// ============================================================================
// Tests
// ============================================================================
