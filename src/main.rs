//! ICE adapter entry point.
//!
//! Starts the game-facing server and the control-plane RPC service, then
//! parks until `quit` arrives over RPC or via signal.

use std::sync::Arc;

use ice_adapter::adapter::{Adapter, AdapterConfig};
use ice_adapter::engine::UdpIceEngine;
use ice_adapter::rpc::server::RpcService;
use ice_adapter::rpc::RpcLink;

const DEFAULT_RPC_PORT: u16 = 7236;

const USAGE: &str = "ice-adapter usage:
--help                 produce help message
--id <num>             set the ID of the local player
--login <string>       set the login of the local player, e.g. \"Rhiza\"
--rpc-port <port>      set the port of the internal JSON-RPC server (default 7236)
--gpgnet-port <port>   set the port of the internal GPGNet server (default: auto)
--lobby-port <port>    set the port the game lobby uses for incoming UDP packets (default: auto)
--log-level <level>    set logging verbosity: error, warn, info, debug or trace";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let log_level = parse_arg(&args, "--log-level").unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    let local_id: i64 = parse_arg(&args, "--id")
        .ok_or("Missing necessary argument: --id")?
        .parse()
        .map_err(|_| "--id must be an integer")?;
    let login = parse_arg(&args, "--login").ok_or("Missing necessary argument: --login")?;
    let rpc_port = parse_port(&args, "--rpc-port")?.unwrap_or(DEFAULT_RPC_PORT);
    let gpgnet_port = parse_port(&args, "--gpgnet-port")?.unwrap_or(0);
    let lobby_port = parse_port(&args, "--lobby-port")?.unwrap_or(0);

    log::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let link = RpcLink::new();
    let adapter = Adapter::new(
        AdapterConfig {
            local_id,
            login,
            rpc_port,
            gpgnet_port,
            lobby_port,
        },
        link.clone(),
        Arc::new(UdpIceEngine::new()),
    )?;
    adapter.start()?;

    let service = RpcService::new(adapter.clone(), link);
    service.start(rpc_port)?;

    // SIGINT/SIGTERM drive the same ordered shutdown as the rpc quit method.
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])?;
    let on_signal = adapter.clone();
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            log::info!("Received termination signal");
            on_signal.quit();
        }
    });

    adapter.shutdown_signal().wait();
    service.close();
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_port(args: &[String], flag: &str) -> Result<Option<u16>, String> {
    match parse_arg(args, flag) {
        Some(raw) => raw
            .parse::<u16>()
            .map(Some)
            .map_err(|_| format!("{} must be a port number", flag)),
        None => Ok(None),
    }
}
