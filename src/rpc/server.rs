//! Control-plane RPC service.
//!
//! One orchestrator client at a time; requests are JSON-RPC 2.0 documents,
//! one per line. Method names and argument order are the orchestrator
//! contract. Asynchronous operations acknowledge immediately; their outcome
//! is only visible through notifications and `status`.

use std::io::{self, BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use serde_json::Value;

use crate::adapter::Adapter;
use crate::gpgnet::message::Chunk;
use crate::gpgnet::LobbyInitMode;
use crate::ice::candidates::CandidatesMessage;
use crate::rpc::{parse_request, response_error, response_ok, RpcLink, RpcRequest};
use crate::session::{parse_ice_servers, IceServerEntry};

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

pub struct RpcService {
    adapter: Arc<Adapter>,
    link: RpcLink,
    running: AtomicBool,
    port: AtomicU16,
    generation: AtomicU64,
}

impl RpcService {
    pub fn new(adapter: Arc<Adapter>, link: RpcLink) -> Arc<Self> {
        Arc::new(RpcService {
            adapter,
            link,
            running: AtomicBool::new(false),
            port: AtomicU16::new(0),
            generation: AtomicU64::new(0),
        })
    }

    /// Bind and start serving. Returns the bound port.
    pub fn start(self: &Arc<Self>, port: u16) -> io::Result<u16> {
        log::info!("Creating RPC server on port {}", port);
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let port = listener.local_addr()?.port();
        self.port.store(port, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let service = self.clone();
        thread::spawn(move || service.accept_loop(listener));
        Ok(port)
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    match stream.try_clone() {
                        Ok(writer) => {
                            // Latest client wins the notification channel.
                            self.link.attach(writer);
                            log::info!("Rpc client connected");
                            let service = self.clone();
                            thread::spawn(move || service.client_loop(stream, generation));
                        }
                        Err(e) => log::error!("Could not clone rpc client stream: {}", e),
                    }
                }
                Err(e) => log::error!("Could not accept rpc connection: {}", e),
            }
        }
        log::debug!("Rpc accept loop stopped");
    }

    fn client_loop(self: Arc<Self>, stream: TcpStream, generation: u64) {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::info!("Rpc client read failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            self.handle_line(&line);
        }

        // Only the latest client owns the notification channel.
        if self.generation.load(Ordering::SeqCst) == generation {
            self.link.detach();
            log::info!("Rpc client disconnected");
        }
    }

    fn handle_line(&self, line: &str) {
        let request = match parse_request(line) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Discarding malformed rpc message: {}", e);
                self.link
                    .send(&response_error(Value::Null, PARSE_ERROR, &e.to_string()));
                return;
            }
        };

        let id = request.id.clone();
        let result = self.dispatch(&request);

        // Requests without an id are notifications; nothing goes back.
        if let Some(id) = id {
            match result {
                Ok(value) => self.link.send(&response_ok(id, value)),
                Err((code, message)) => {
                    self.link.send(&response_error(id, code, &message))
                }
            }
        } else if let Err((_, message)) = result {
            log::warn!("Rpc notification {} failed: {}", request.method, message);
        }
    }

    fn dispatch(&self, request: &RpcRequest) -> Result<Value, (i64, String)> {
        match request.method.as_str() {
            "hostGame" => {
                let map = str_param(request, 0)?;
                self.adapter.on_host_game(&map);
                Ok(Value::Null)
            }
            "joinGame" => {
                let login = str_param(request, 0)?;
                let id = i64_param(request, 1)?;
                self.adapter.on_join_game(&login, id);
                Ok(Value::Null)
            }
            "connectToPeer" => {
                let login = str_param(request, 0)?;
                let id = i64_param(request, 1)?;
                let offer = bool_param(request, 2)?;
                self.adapter.on_connect_to_peer(&login, id, offer);
                Ok(Value::Null)
            }
            "disconnectFromPeer" => {
                let id = i64_param(request, 0)?;
                self.adapter.on_disconnect_from_peer(id);
                Ok(Value::Null)
            }
            "setLobbyInitMode" => {
                let mode = str_param(request, 0)?;
                match LobbyInitMode::from_name(&mode) {
                    Some(mode) => {
                        self.adapter.set_lobby_init_mode(mode);
                        Ok(Value::Null)
                    }
                    None => Err((INVALID_PARAMS, format!("unknown lobby init mode: {}", mode))),
                }
            }
            "iceMsg" => {
                let id = i64_param(request, 0)?;
                let message = candidates_param(request, 1)?;
                self.adapter.on_ice_msg(id, message);
                Ok(Value::Null)
            }
            "sendToGpgNet" => {
                let header = str_param(request, 0)?;
                let chunks = request.params[1..]
                    .iter()
                    .map(value_to_chunk)
                    .collect::<Result<Vec<Chunk>, _>>()?;
                self.adapter.send_to_gpgnet(header, chunks);
                Ok(Value::Null)
            }
            "setIceServers" => {
                let raw = request
                    .params
                    .first()
                    .cloned()
                    .unwrap_or(Value::Array(Vec::new()));
                let entries: Vec<IceServerEntry> = serde_json::from_value(raw)
                    .map_err(|e| (INVALID_PARAMS, format!("bad ice server list: {}", e)))?;
                self.adapter.set_ice_servers(parse_ice_servers(&entries));
                Ok(Value::Null)
            }
            "status" => serde_json::to_value(self.adapter.status())
                .map_err(|e| (INVALID_PARAMS, e.to_string())),
            "quit" => {
                self.adapter.quit();
                Ok(Value::Null)
            }
            other => Err((METHOD_NOT_FOUND, format!("unknown method: {}", other))),
        }
    }

    /// Stop accepting clients and release the notification channel.
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.link.detach();
        // Nudge the accept loop so it observes the stopped flag.
        let _ = TcpStream::connect(("127.0.0.1", self.port()));
        log::info!("Rpc server stopped");
    }
}

// ============================================================================
// Parameter Extraction
// ============================================================================

fn param<'a>(request: &'a RpcRequest, index: usize) -> Result<&'a Value, (i64, String)> {
    request.params.get(index).ok_or((
        INVALID_PARAMS,
        format!("{}: missing argument {}", request.method, index),
    ))
}

fn str_param(request: &RpcRequest, index: usize) -> Result<String, (i64, String)> {
    param(request, index)?
        .as_str()
        .map(str::to_string)
        .ok_or((
            INVALID_PARAMS,
            format!("{}: argument {} must be a string", request.method, index),
        ))
}

fn i64_param(request: &RpcRequest, index: usize) -> Result<i64, (i64, String)> {
    param(request, index)?.as_i64().ok_or((
        INVALID_PARAMS,
        format!("{}: argument {} must be an integer", request.method, index),
    ))
}

fn bool_param(request: &RpcRequest, index: usize) -> Result<bool, (i64, String)> {
    param(request, index)?.as_bool().ok_or((
        INVALID_PARAMS,
        format!("{}: argument {} must be a boolean", request.method, index),
    ))
}

/// The candidates payload arrives either as a JSON object or as a
/// JSON-encoded string, depending on the orchestrator build.
fn candidates_param(
    request: &RpcRequest,
    index: usize,
) -> Result<CandidatesMessage, (i64, String)> {
    let value = param(request, index)?;
    let parsed = match value {
        Value::String(inner) => serde_json::from_str(inner),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|e| (INVALID_PARAMS, format!("bad candidates message: {}", e)))
}

fn value_to_chunk(value: &Value) -> Result<Chunk, (i64, String)> {
    match value {
        Value::String(s) => Ok(Chunk::Str(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(|v| Chunk::Int(v as i32))
            .ok_or((INVALID_PARAMS, format!("bad numeric chunk: {}", n))),
        other => Err((INVALID_PARAMS, format!("unsupported chunk: {}", other))),
    }
}

// ============================================================================
// Tests
// ============================================================================
