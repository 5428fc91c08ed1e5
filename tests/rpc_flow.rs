//! End-to-end test of the control-plane RPC service over a real TCP
//! connection: request dispatch, status snapshots, and shutdown.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use ice_adapter::adapter::{Adapter, AdapterConfig};
use ice_adapter::engine::UdpIceEngine;
use ice_adapter::rpc::server::RpcService;
use ice_adapter::rpc::RpcLink;

struct Harness {
    adapter: Arc<Adapter>,
    service: Arc<RpcService>,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    next_id: u64,
}

impl Harness {
    fn start() -> Harness {
        let link = RpcLink::new();
        let adapter = Adapter::new(
            AdapterConfig {
                local_id: 4,
                login: "Rhiza".to_string(),
                rpc_port: 0,
                gpgnet_port: 0,
                lobby_port: 0,
            },
            link.clone(),
            Arc::new(UdpIceEngine::with_port_base(46000, 200)),
        )
        .unwrap();

        let service = RpcService::new(adapter.clone(), link);
        let port = service.start(0).unwrap();

        let writer = TcpStream::connect(("127.0.0.1", port)).unwrap();
        writer
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(writer.try_clone().unwrap());

        Harness {
            adapter,
            service,
            reader,
            writer,
            next_id: 0,
        }
    }

    /// Send a request and read documents until its response arrives,
    /// skipping interleaved notifications.
    fn call(&mut self, method: &str, params: Vec<Value>) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        self.writer
            .write_all(format!("{}\n", request).as_bytes())
            .unwrap();

        for _ in 0..64 {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            let doc: Value = serde_json::from_str(&line).unwrap();
            if doc["id"] == json!(id) {
                return doc;
            }
        }
        panic!("no response for {}", method);
    }
}

#[test]
fn test_status_and_peer_lifecycle() {
    let mut harness = Harness::start();

    let response = harness.call("status", vec![]);
    let status = &response["result"];
    assert_eq!(status["options"]["player_login"], "Rhiza");
    assert_eq!(status["options"]["player_id"], 4);
    assert_eq!(status["init_mode"], "normal");
    assert_eq!(status["ice_servers_size"], 0);
    assert_eq!(status["relays"], json!([]));

    // Configure servers; malformed schemes are skipped silently.
    let response = harness.call(
        "setIceServers",
        vec![json!([{
            "urls": ["stun:stun.example.com", "ftp:not-a-server"],
            "username": "",
            "credential": "",
        }])],
    );
    assert_eq!(response["result"], Value::Null);

    harness.call("hostGame", vec![json!("the_map")]);
    harness.call("connectToPeer", vec![json!("remote"), json!(9), json!(false)]);

    let response = harness.call("status", vec![]);
    let status = &response["result"];
    assert_eq!(status["ice_servers_size"], 1);
    let relay = &status["relays"][0];
    assert_eq!(relay["remote_player_id"], 9);
    assert_eq!(relay["remote_player_login"], "remote");
    assert_eq!(relay["ice"]["offerer"], false);
    assert_eq!(relay["ice"]["connected"], false);

    harness.call("disconnectFromPeer", vec![json!(9)]);
    let response = harness.call("status", vec![]);
    assert_eq!(response["result"]["relays"], json!([]));

    harness.adapter.quit();
    harness.service.close();
}

#[test]
fn test_unknown_method_and_bad_params_are_rejected() {
    let mut harness = Harness::start();

    let response = harness.call("definitelyNotAMethod", vec![]);
    assert_eq!(response["error"]["code"], -32601);

    let response = harness.call("connectToPeer", vec![json!(42)]);
    assert_eq!(response["error"]["code"], -32602);

    // A protocol violation leaves the service usable.
    let response = harness.call("status", vec![]);
    assert!(response["error"].is_null());

    harness.adapter.quit();
    harness.service.close();
}

#[test]
fn test_ice_msg_without_session_is_dropped_not_fatal() {
    let mut harness = Harness::start();

    let message = json!({
        "srcId": 9,
        "destId": 4,
        "password": "pw",
        "ufrag": "uf",
        "candidates": [],
    });
    let response = harness.call("iceMsg", vec![json!(9), message]);
    assert_eq!(response["result"], Value::Null);

    // Service still alive.
    let response = harness.call("status", vec![]);
    assert!(response["error"].is_null());

    harness.adapter.quit();
    harness.service.close();
}

#[test]
fn test_quit_sets_shutdown() {
    let mut harness = Harness::start();
    let signal = harness.adapter.shutdown_signal();

    let response = harness.call("quit", vec![]);
    assert_eq!(response["result"], Value::Null);
    assert!(signal.wait_timeout(Duration::from_secs(2)).unwrap());

    harness.service.close();
}
