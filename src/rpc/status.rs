//! Status snapshot document.
//!
//! Field names are consumed by external tooling and must not drift,
//! including the historical `gpgpnet` spelling.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct IceStatus {
    pub version: String,
    pub ice_servers_size: usize,
    pub lobby_port: u16,
    pub init_mode: String,
    pub options: IceOptions,
    pub gpgpnet: GpgNetState,
    pub relays: Vec<IceRelay>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IceOptions {
    pub player_id: i64,
    pub player_login: String,
    pub rpc_port: u16,
    pub gpgnet_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpgNetState {
    pub local_port: u16,
    pub connected: bool,
    pub game_state: String,
    pub task_string: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IceRelay {
    pub remote_player_id: i64,
    pub remote_player_login: String,
    pub local_game_udp_port: u16,
    pub ice: IceRelayState,
}

#[derive(Debug, Clone, Serialize)]
pub struct IceRelayState {
    pub offerer: bool,
    pub state: String,
    pub gathering_state: String,
    pub datachannel_state: String,
    pub connected: bool,
    pub loc_cand_addr: String,
    pub rem_cand_addr: String,
    pub loc_cand_type: String,
    pub rem_cand_type: String,
    pub time_to_connected: f64,
}
