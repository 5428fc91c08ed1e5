//! Game-facing TCP server.
//!
//! Accepts exactly one active game client. A new connection always wins: the
//! old client is torn down first, cascading into control-plane notification
//! and full session teardown, since losing the game connection invalidates
//! every peer. Commands the game sends are forwarded verbatim to the control
//! plane; the lifecycle-relevant ones additionally drive GameState tracking
//! and the lobby handshake.

use std::io::{self, BufReader};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{json, Value};

use crate::gpgnet::message::{self, Chunk, CodecError, GpgNetMessage};
use crate::gpgnet::{GameState, LobbyInitMode};
use crate::rpc::RpcLink;
use crate::util::{self, Signal};

/// Scan range for an auto-selected game-facing port.
const PORT_SCAN_FROM: u16 = 20000;
const PORT_SCAN_TO: u16 = 65535;

/// Identity the server announces to the game in CreateLobby.
#[derive(Debug, Clone)]
pub struct GpgNetConfig {
    pub login: String,
    pub local_id: i64,
    /// Port the game listens on for relayed peer traffic.
    pub lobby_port: u16,
}

/// One connected game instance.
#[derive(Clone)]
struct ClientHandle {
    stream: Arc<TcpStream>,
    /// Serializes whole frames; the read loop and queued senders share the socket.
    write_lock: Arc<Mutex<()>>,
    game_state: Arc<Mutex<GameState>>,
    /// Fires when the game reports LOBBY; queued commands wait on it.
    lobby_ready: Arc<Signal>,
    generation: u64,
}

struct ServerState {
    client: Option<ClientHandle>,
    /// Fires when a game client connects; replaced for each new cycle.
    client_ready: Arc<Signal>,
}

pub struct GpgNetServer {
    cfg: GpgNetConfig,
    rpc: RpcLink,
    port: AtomicU16,
    running: AtomicBool,
    generation: AtomicU64,
    lobby_init_mode: Mutex<LobbyInitMode>,
    state: Mutex<ServerState>,
    /// Invoked when the game connection is lost; wired to session teardown.
    game_lost_handler: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl GpgNetServer {
    pub fn new(cfg: GpgNetConfig, rpc: RpcLink) -> Arc<Self> {
        Arc::new(GpgNetServer {
            cfg,
            rpc,
            port: AtomicU16::new(0),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            lobby_init_mode: Mutex::new(LobbyInitMode::Normal),
            state: Mutex::new(ServerState {
                client: None,
                client_ready: Arc::new(Signal::new()),
            }),
            game_lost_handler: Mutex::new(None),
        })
    }

    /// Bind the listener and start accepting. `port` 0 selects a free port.
    pub fn start(self: &Arc<Self>, port: u16) -> io::Result<u16> {
        let port = if port == 0 {
            let generated = util::find_free_tcp_port(PORT_SCAN_FROM, PORT_SCAN_TO)?;
            log::info!("Generated gpgnet port: {}", generated);
            generated
        } else {
            log::info!("Using gpgnet port: {}", port);
            port
        };

        let listener = TcpListener::bind(("127.0.0.1", port))?;
        self.port.store(port, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let server = self.clone();
        thread::spawn(move || server.accept_loop(listener));
        log::info!("GPGNet server started");
        Ok(port)
    }

    /// Install the session-teardown cascade for lost game connections.
    pub fn set_game_lost_handler(&self, handler: Arc<dyn Fn() + Send + Sync>) {
        *self.game_lost_handler.lock().unwrap() = Some(handler);
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn set_lobby_init_mode(&self, mode: LobbyInitMode) {
        *self.lobby_init_mode.lock().unwrap() = mode;
        log::debug!("LobbyInitMode set to {}", mode.name());
    }

    pub fn lobby_init_mode(&self) -> LobbyInitMode {
        *self.lobby_init_mode.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().client.is_some()
    }

    /// Name of the tracked game state, or empty while no client is connected.
    pub fn game_state_name(&self) -> String {
        self.state
            .lock()
            .unwrap()
            .client
            .as_ref()
            .map(|c| c.game_state.lock().unwrap().name().to_string())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Accepting and losing clients
    // ------------------------------------------------------------------

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => self.adopt_client(stream),
                Err(e) => log::error!("Could not accept game connection: {}", e),
            }
        }
        log::debug!("GPGNet accept loop stopped");
    }

    fn adopt_client(self: &Arc<Self>, stream: TcpStream) {
        // New connection always wins; the old one is assumed dead.
        let stale = self.state.lock().unwrap().client.take();
        if let Some(stale) = stale {
            log::info!("New game connection supersedes the current one");
            self.teardown_client(stale);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let client = ClientHandle {
            stream: Arc::new(stream),
            write_lock: Arc::new(Mutex::new(())),
            game_state: Arc::new(Mutex::new(GameState::None)),
            lobby_ready: Arc::new(Signal::new()),
            generation,
        };

        {
            let mut state = self.state.lock().unwrap();
            state.client = Some(client.clone());
            state.client_ready.set();
        }

        self.rpc.on_connection_state_changed("Connected");
        log::info!("Game instance has connected");

        let server = self.clone();
        let reader = client.clone();
        thread::spawn(move || server.client_loop(reader));
    }

    /// Cascade for a lost/superseded client. Runs outside the state lock.
    fn teardown_client(&self, client: ClientHandle) {
        client.lobby_ready.cancel();
        let _ = client.stream.shutdown(Shutdown::Both);

        // A fresh cycle gets a fresh "client connected" signal.
        self.state.lock().unwrap().client_ready = Arc::new(Signal::new());

        self.rpc.on_connection_state_changed("Disconnected");
        let handler = self.game_lost_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Remove and tear down `generation`'s client, once.
    fn on_client_lost(&self, generation: u64) {
        let stale = {
            let mut state = self.state.lock().unwrap();
            match &state.client {
                Some(current) if current.generation == generation => state.client.take(),
                _ => None,
            }
        };
        if let Some(client) = stale {
            log::info!("GPGNet connection lost");
            self.teardown_client(client);
        }
    }

    // ------------------------------------------------------------------
    // Client traffic
    // ------------------------------------------------------------------

    fn client_loop(self: Arc<Self>, client: ClientHandle) {
        log::debug!("Listening for GPG messages");
        let mut reader = BufReader::new(&*client.stream);

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match message::read_message(&mut reader) {
                Ok(msg) => self.process_message(&client, msg),
                Err(CodecError::Io(e)) => {
                    log::info!(
                        "Error while communicating with the game (input), assuming shutdown: {}",
                        e
                    );
                    self.on_client_lost(client.generation);
                    break;
                }
                Err(CodecError::Malformed(m)) => {
                    log::error!("Malformed message from the game: {}", m);
                    self.on_client_lost(client.generation);
                    break;
                }
            }
        }
        log::debug!("No longer listening for GPGNet messages from the game");
    }

    fn process_message(self: &Arc<Self>, client: &ClientHandle, msg: GpgNetMessage) {
        if msg.header == "GameState" {
            if let Some(Chunk::Str(name)) = msg.chunks.first() {
                match GameState::from_name(name) {
                    Some(new_state) => {
                        *client.game_state.lock().unwrap() = new_state;
                        log::debug!("New GameState: {}", new_state.name());

                        if new_state == GameState::Idle {
                            self.send_to_client(
                                client,
                                &GpgNetMessage::new(
                                    "CreateLobby",
                                    vec![
                                        Chunk::Int(self.lobby_init_mode().id()),
                                        Chunk::Int(self.cfg.lobby_port as i32),
                                        Chunk::Str(self.cfg.login.clone()),
                                        Chunk::Int(self.cfg.local_id as i32),
                                        Chunk::Int(1),
                                    ],
                                ),
                            );
                        } else if new_state == GameState::Lobby {
                            client.lobby_ready.set();
                        }
                    }
                    None => log::warn!("Unknown GameState: {}", name),
                }
            }
        }

        log::info!(
            "Received GPGNet message: {} {}",
            msg.header,
            msg.chunks
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        );
        self.rpc
            .on_gpgnet_message(&msg.header, chunks_to_values(&msg.chunks));
    }

    fn send_to_client(self: &Arc<Self>, client: &ClientHandle, msg: &GpgNetMessage) {
        let result = {
            let _guard = client.write_lock.lock().unwrap();
            let mut stream = &*client.stream;
            message::write_message(&mut stream, msg)
        };
        if let Err(e) = result {
            log::info!(
                "Error while communicating with the game (output), assuming shutdown: {}",
                e
            );
            self.on_client_lost(client.generation);
        }
    }

    /// Queue a command for the game; it is delivered once a client is
    /// connected and has reached the lobby. Dropped if that cycle dies first.
    pub fn send_when_ready(self: &Arc<Self>, header: String, chunks: Vec<Chunk>) {
        let server = self.clone();
        thread::spawn(move || {
            let client_ready = server.state.lock().unwrap().client_ready.clone();
            if !client_ready.wait() {
                return;
            }
            let client = match server.state.lock().unwrap().client.clone() {
                Some(client) => client,
                None => return,
            };
            if !client.lobby_ready.wait() {
                return;
            }
            server.send_to_client(&client, &GpgNetMessage::new(header, chunks));
        });
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop accepting and drop the current client without the loss cascade.
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let stale = {
            let mut state = self.state.lock().unwrap();
            state.client_ready.cancel();
            state.client.take()
        };
        if let Some(client) = stale {
            client.lobby_ready.cancel();
            let _ = client.stream.shutdown(Shutdown::Both);
        }

        // Nudge the accept loop so it observes the stopped flag.
        let _ = TcpStream::connect(("127.0.0.1", self.port()));
        log::info!("GPGNet server stopped");
    }
}

fn chunks_to_values(chunks: &[Chunk]) -> Vec<Value> {
    chunks
        .iter()
        .map(|c| match c {
            Chunk::Int(v) => json!(v),
            Chunk::Str(s) => json!(s),
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
