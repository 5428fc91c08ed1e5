//! Peer connectivity module.
//!
//! Owns one ICE agent and its lifecycle: candidate gathering, the exchange
//! round-trip through the control plane, connectivity establishment, the
//! tagged data channel, and the loss/retry policy. State transitions are
//! serialized through one lock; re-initiation attempts while a cycle is in
//! flight are rejected, not queued.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::{CandidateKind, CheckPhase, IceAgent, IceEngine, IceServer, SelectedPair};
use crate::ice::candidates::{pack_candidates, unpack_candidates, CandidatesMessage};
use crate::ice::checker::ConnectivityChecker;
use crate::ice::turn::TurnRefreshModule;
use crate::rpc::RpcLink;

// ============================================================================
// Constants
// ============================================================================

/// How long the offerer waits for the remote candidate set.
pub const CANDIDATES_TIMEOUT: Duration = Duration::from_secs(6);

/// Poll period while the engine runs its connectivity checks.
pub const CONNECTIVITY_POLL: Duration = Duration::from_millis(20);

/// Wall-clock ceiling on connectivity establishment; the engine may otherwise
/// hang indefinitely on asymmetric networks.
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(15);

/// Retry backoff after a loss that never reached CONNECTED.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Listener poll period; bounds reaction to teardown.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

// ============================================================================
// State
// ============================================================================

/// Peer connection lifecycle. Does not mirror WebRTC states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Gathering,
    AwaitingCandidates,
    Checking,
    Connected,
    Disconnected,
}

impl IceState {
    /// Wire spelling used in control-plane notifications.
    pub fn message(&self) -> &'static str {
        match self {
            IceState::New => "new",
            IceState::Gathering => "gathering",
            IceState::AwaitingCandidates => "awaitingCandidates",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Disconnected => "disconnected",
        }
    }
}

/// Retry delay after a loss, depending on how far the cycle got.
pub fn retry_delay(previous: IceState) -> Duration {
    if previous == IceState::Connected {
        Duration::ZERO
    } else {
        RETRY_BACKOFF
    }
}

// ============================================================================
// Module
// ============================================================================

/// Everything the module needs to know about its surroundings.
pub struct IceModuleContext {
    pub local_id: i64,
    pub remote_id: i64,
    pub local_offer: bool,
    /// Port the local game listens on for relayed peer traffic.
    pub lobby_port: u16,
    /// The peer's loopback relay socket, used to hand data to the game.
    pub game_socket: Arc<UdpSocket>,
    pub rpc: RpcLink,
}

struct ModuleInner {
    ice_state: IceState,
    agent: Option<Arc<dyn IceAgent>>,
    turn_refresh: Option<TurnRefreshModule>,
}

pub struct PeerIceModule {
    ctx: IceModuleContext,
    engine: Arc<dyn IceEngine>,
    servers: Arc<Mutex<Vec<IceServer>>>,
    inner: Mutex<ModuleInner>,
    connected: AtomicBool,
    closing: AtomicBool,
    /// Stamps each gathering round so a late exchange timeout cannot cancel a
    /// newer attempt.
    exchange_id: AtomicU64,
    /// Bumped on teardown; running listeners compare and bail out.
    listener_epoch: AtomicU64,
    checker: ConnectivityChecker,
}

impl PeerIceModule {
    pub fn new(
        ctx: IceModuleContext,
        engine: Arc<dyn IceEngine>,
        servers: Arc<Mutex<Vec<IceServer>>>,
    ) -> Arc<Self> {
        Arc::new(PeerIceModule {
            ctx,
            engine,
            servers,
            inner: Mutex::new(ModuleInner {
                ice_state: IceState::New,
                agent: None,
                turn_refresh: None,
            }),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            exchange_id: AtomicU64::new(0),
            listener_epoch: AtomicU64::new(0),
            checker: ConnectivityChecker::new(),
        })
    }

    pub fn remote_id(&self) -> i64 {
        self.ctx.remote_id
    }

    pub fn is_offerer(&self) -> bool {
        self.ctx.local_offer
    }

    pub fn ice_state(&self) -> IceState {
        self.inner.lock().unwrap().ice_state
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn selected_pair(&self) -> Option<SelectedPair> {
        let inner = self.inner.lock().unwrap();
        inner.agent.as_ref().and_then(|a| a.selected_pair())
    }

    pub(crate) fn checker(&self) -> &ConnectivityChecker {
        &self.checker
    }

    fn set_state(&self, inner: &mut ModuleInner, new_state: IceState) {
        inner.ice_state = new_state;
        self.ctx.rpc.on_ice_state_changed(
            self.ctx.local_id,
            self.ctx.remote_id,
            new_state.message(),
        );
    }

    // ------------------------------------------------------------------
    // Initiation and candidate exchange
    // ------------------------------------------------------------------

    /// Start a new gathering/exchange cycle. Allowed from NEW and
    /// DISCONNECTED only; anything else is rejected and logged.
    pub fn initiate_ice(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.ice_state != IceState::New && inner.ice_state != IceState::Disconnected {
            log::warn!(
                "ICE already in progress, aborting re initiation. current state: {}",
                inner.ice_state.message()
            );
            return;
        }

        self.set_state(&mut inner, IceState::Gathering);
        log::info!("Initiating ICE for peer {}", self.ctx.remote_id);

        let servers = self.servers.lock().unwrap().clone();
        let agent = match self.engine.create_agent(self.ctx.local_offer, &servers) {
            Ok(agent) => agent,
            Err(e) => {
                log::error!("Error while creating ice agent: {}", e);
                drop(inner);
                self.on_connection_lost();
                return;
            }
        };
        inner.agent = Some(agent.clone());

        log::info!("Gathering ice candidates");
        let local_candidates = match agent.gather_candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                log::error!("Error while gathering candidates: {}", e);
                drop(inner);
                self.on_connection_lost();
                return;
            }
        };

        let message = pack_candidates(
            self.ctx.local_id,
            self.ctx.remote_id,
            agent.as_ref(),
            &local_candidates,
        );
        log::debug!("Sending own candidates to {}", self.ctx.remote_id);
        self.set_state(&mut inner, IceState::AwaitingCandidates);
        drop(inner);

        self.ctx.rpc.on_ice_msg(&message);
        self.arm_candidates_timeout();
    }

    fn arm_candidates_timeout(self: &Arc<Self>) {
        let current = self.exchange_id.fetch_add(1, Ordering::SeqCst) + 1;
        let module = self.clone();
        thread::spawn(move || {
            thread::sleep(CANDIDATES_TIMEOUT);
            if module.closing.load(Ordering::SeqCst) {
                return;
            }
            // Only the newest exchange round may time out; a later cycle
            // already superseded this one.
            if module.exchange_id.load(Ordering::SeqCst) == current
                && module.ice_state() == IceState::AwaitingCandidates
            {
                log::warn!(
                    "Timed out waiting for candidates from peer {}",
                    module.ctx.remote_id
                );
                module.on_connection_lost();
            }
        });
    }

    /// Entry point for an inbound candidates message from the control plane.
    pub fn on_ice_message_received(self: &Arc<Self>, message: CandidatesMessage) {
        let module = self.clone();
        thread::spawn(move || module.handle_ice_message(message));
    }

    pub(crate) fn handle_ice_message(self: &Arc<Self>, message: CandidatesMessage) {
        log::debug!("Got IceMsg for peer {}", self.ctx.remote_id);
        if self.closing.load(Ordering::SeqCst) {
            return;
        }

        let agent = if self.ctx.local_offer {
            let mut inner = self.inner.lock().unwrap();
            if inner.ice_state != IceState::AwaitingCandidates {
                log::warn!(
                    "Received candidates unexpectedly, current state: {}",
                    inner.ice_state.message()
                );
                return;
            }
            let agent = match inner.agent.clone() {
                Some(agent) => agent,
                None => return,
            };
            self.set_state(&mut inner, IceState::Checking);
            unpack_candidates(&message, agent.as_ref());
            agent
        } else {
            // A new offer while a cycle is running supersedes it.
            let state = self.ice_state();
            if state != IceState::New && state != IceState::Disconnected {
                log::info!("Received new candidates/offer, stopping...");
                self.on_connection_lost();
            }

            self.initiate_ice();

            let mut inner = self.inner.lock().unwrap();
            if inner.ice_state != IceState::AwaitingCandidates {
                log::warn!(
                    "Gathering for answer did not complete, current state: {}",
                    inner.ice_state.message()
                );
                return;
            }
            let agent = match inner.agent.clone() {
                Some(agent) => agent,
                None => return,
            };
            self.set_state(&mut inner, IceState::Checking);
            unpack_candidates(&message, agent.as_ref());
            agent
        };

        self.establish_connectivity(agent);
    }

    // ------------------------------------------------------------------
    // Connectivity establishment
    // ------------------------------------------------------------------

    fn establish_connectivity(self: &Arc<Self>, agent: Arc<dyn IceAgent>) {
        log::debug!("Starting ICE for peer {}", self.ctx.remote_id);
        agent.start_checks();

        let started = Instant::now();
        loop {
            if self.closing.load(Ordering::SeqCst) || !self.is_current_agent(&agent) {
                return;
            }
            match agent.check_phase() {
                CheckPhase::Succeeded => break,
                CheckPhase::Failed => {
                    self.on_connection_lost();
                    return;
                }
                _ => {
                    if started.elapsed() >= CONNECTIVITY_TIMEOUT {
                        log::warn!(
                            "Connectivity establishment for peer {} exceeded {:?}",
                            self.ctx.remote_id,
                            CONNECTIVITY_TIMEOUT
                        );
                        self.on_connection_lost();
                        return;
                    }
                    thread::sleep(CONNECTIVITY_POLL);
                }
            }
        }

        log::debug!("ICE terminated for {}", self.ctx.remote_id);

        self.connected.store(true, Ordering::SeqCst);
        self.ctx
            .rpc
            .on_connected(self.ctx.local_id, self.ctx.remote_id, true);

        {
            let mut inner = self.inner.lock().unwrap();
            self.set_state(&mut inner, IceState::Connected);
            // Keep the relay allocation alive while it carries the connection.
            if let Some(pair) = agent.selected_pair() {
                if pair.local.kind == CandidateKind::Relayed {
                    inner.turn_refresh =
                        Some(TurnRefreshModule::start(agent.clone(), self.ctx.remote_id));
                }
            }
        }

        if self.ctx.local_offer {
            self.checker.start(self.clone());
        }

        let epoch = self.listener_epoch.load(Ordering::SeqCst);
        let module = self.clone();
        thread::spawn(move || module.listener(agent, epoch));
    }

    fn is_current_agent(&self, agent: &Arc<dyn IceAgent>) -> bool {
        let inner = self.inner.lock().unwrap();
        match &inner.agent {
            Some(current) => Arc::ptr_eq(current, agent),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Data channel
    // ------------------------------------------------------------------

    /// Forward a datagram from the local game over the data channel.
    pub fn on_game_data(self: &Arc<Self>, payload: &[u8]) {
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(b'd');
        data.extend_from_slice(payload);
        self.send_via_ice(&data);
    }

    /// Send one already-tagged packet over the data channel.
    pub fn send_via_ice(self: &Arc<Self>, data: &[u8]) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let agent = self.inner.lock().unwrap().agent.clone();
        if let Some(agent) = agent {
            if let Err(e) = agent.send(data) {
                log::warn!("Failed to send data via ICE: {}", e);
                self.on_connection_lost();
            }
        }
    }

    /// Reads from the data channel and demultiplexes on the tag byte.
    fn listener(self: Arc<Self>, agent: Arc<dyn IceAgent>, epoch: u64) {
        log::debug!(
            "Now forwarding data from ICE to game for peer {}",
            self.ctx.remote_id
        );

        loop {
            if self.closing.load(Ordering::SeqCst)
                || self.listener_epoch.load(Ordering::SeqCst) != epoch
            {
                break;
            }

            let data = match agent.recv(RECV_TIMEOUT) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    if self.listener_epoch.load(Ordering::SeqCst) == epoch
                        && !self.closing.load(Ordering::SeqCst)
                    {
                        log::warn!(
                            "Error while reading from ice agent, peer: {} ({})",
                            self.ctx.remote_id,
                            e
                        );
                        self.on_connection_lost();
                    }
                    break;
                }
            };

            if data.is_empty() {
                continue;
            }

            match data[0] {
                b'd' => {
                    if let Err(e) = self
                        .ctx
                        .game_socket
                        .send_to(&data[1..], ("127.0.0.1", self.ctx.lobby_port))
                    {
                        log::warn!(
                            "Error while writing to local game for peer {}: {}",
                            self.ctx.remote_id,
                            e
                        );
                    }
                }
                b'e' => {
                    if self.ctx.local_offer {
                        self.checker.echo_received(&data);
                    } else {
                        // Turn around, send the echo back unchanged.
                        self.send_via_ice(&data);
                    }
                }
                other => {
                    log::warn!("Received invalid packet, first byte: 0x{:x}", other);
                }
            }
        }

        log::debug!("No longer listening for messages from ICE");
    }

    // ------------------------------------------------------------------
    // Loss and teardown
    // ------------------------------------------------------------------

    /// Tear the current cycle down and, on the offering side, schedule the
    /// next one. Entering this twice for the same cycle is a no-op.
    pub fn on_connection_lost(self: &Arc<Self>) {
        let previous_state;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.ice_state == IceState::Disconnected {
                return;
            }
            previous_state = inner.ice_state;

            self.listener_epoch.fetch_add(1, Ordering::SeqCst);
            self.checker.stop();
            if let Some(turn) = inner.turn_refresh.take() {
                turn.close();
            }
            if let Some(agent) = inner.agent.take() {
                agent.free();
            }
            self.set_state(&mut inner, IceState::Disconnected);
        }

        if self.connected.swap(false, Ordering::SeqCst) {
            log::warn!(
                "ICE connection has been lost for peer {}",
                self.ctx.remote_id
            );
            self.ctx
                .rpc
                .on_connected(self.ctx.local_id, self.ctx.remote_id, false);
        }

        // Only the offering side drives reconnection.
        if self.ctx.local_offer && !self.closing.load(Ordering::SeqCst) {
            let delay = retry_delay(previous_state);
            let module = self.clone();
            thread::spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                if !module.closing.load(Ordering::SeqCst) {
                    module.initiate_ice();
                }
            });
        }
    }

    /// Final teardown on peer removal; no notifications, no retry.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        self.listener_epoch.fetch_add(1, Ordering::SeqCst);
        self.checker.stop();
        if let Some(turn) = inner.turn_refresh.take() {
            turn.close();
        }
        if let Some(agent) = inner.agent.take() {
            agent.free();
        }
        inner.ice_state = IceState::Disconnected;
        self.connected.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Candidate;
    use crate::ice::candidates::CandidatePacket;
    use serde_json::Value;
    use std::io;
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};

    struct FakeEngine {
        fail_gather: bool,
    }

    impl IceEngine for FakeEngine {
        fn create_agent(
            &self,
            _controlling: bool,
            _servers: &[IceServer],
        ) -> io::Result<Arc<dyn IceAgent>> {
            Ok(Arc::new(FakeAgent::new(self.fail_gather)))
        }
    }

    struct FakeAgent {
        fail_gather: bool,
        phase: Mutex<CheckPhase>,
        remote: Mutex<Vec<Candidate>>,
        sent: Mutex<Vec<Vec<u8>>>,
        tx: Mutex<Option<Sender<Vec<u8>>>>,
        rx: Mutex<Receiver<Vec<u8>>>,
    }

    impl FakeAgent {
        fn new(fail_gather: bool) -> Self {
            let (tx, rx) = mpsc::channel();
            FakeAgent {
                fail_gather,
                phase: Mutex::new(CheckPhase::Idle),
                remote: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(rx),
            }
        }
    }

    impl IceAgent for FakeAgent {
        fn local_ufrag(&self) -> String {
            "fakeufrag".to_string()
        }
        fn local_password(&self) -> String {
            "fakepassword".to_string()
        }
        fn generation(&self) -> u32 {
            0
        }
        fn gather_candidates(&self) -> io::Result<Vec<Candidate>> {
            if self.fail_gather {
                return Err(io::Error::new(io::ErrorKind::Other, "no ports"));
            }
            Ok(vec![Candidate::host("127.0.0.1:50000".parse().unwrap())])
        }
        fn set_remote_credentials(&self, _ufrag: &str, _password: &str) {}
        fn add_remote_candidate(&self, candidate: Candidate) {
            self.remote.lock().unwrap().push(candidate);
        }
        fn start_checks(&self) {
            // Checks complete instantly in the fake.
            *self.phase.lock().unwrap() = if self.remote.lock().unwrap().is_empty() {
                CheckPhase::Failed
            } else {
                CheckPhase::Succeeded
            };
        }
        fn check_phase(&self) -> CheckPhase {
            *self.phase.lock().unwrap()
        }
        fn selected_pair(&self) -> Option<SelectedPair> {
            let remote = self.remote.lock().unwrap();
            remote.first().map(|r| SelectedPair {
                local: Candidate::host("127.0.0.1:50000".parse().unwrap()),
                remote: r.clone(),
            })
        }
        fn send(&self, data: &[u8]) -> io::Result<()> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }
        fn recv(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
            match self.rx.lock().unwrap().recv_timeout(timeout) {
                Ok(data) => Ok(Some(data)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "freed"))
                }
            }
        }
        fn refresh_relay(&self) -> io::Result<()> {
            Ok(())
        }
        fn free(&self) {
            *self.tx.lock().unwrap() = None;
        }
    }

    fn test_module(local_offer: bool, fail_gather: bool) -> (Arc<PeerIceModule>, RpcLink) {
        let rpc = RpcLink::new();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let module = PeerIceModule::new(
            IceModuleContext {
                local_id: 1,
                remote_id: 2,
                local_offer,
                lobby_port: 7238,
                game_socket: socket,
                rpc: rpc.clone(),
            },
            Arc::new(FakeEngine { fail_gather }),
            Arc::new(Mutex::new(Vec::new())),
        );
        (module, rpc)
    }

    fn pending_docs(rpc: &RpcLink) -> Vec<Value> {
        rpc.take_pending()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn extract_candidates_message(docs: &[Value]) -> Option<CandidatesMessage> {
        docs.iter()
            .find(|d| d["method"] == "onIceMsg")
            .map(|d| serde_json::from_str(d["params"][2].as_str().unwrap()).unwrap())
    }

    fn remote_message() -> CandidatesMessage {
        CandidatesMessage {
            src_id: 2,
            dest_id: 1,
            password: "remotepw".to_string(),
            ufrag: "remoteuf".to_string(),
            candidates: vec![CandidatePacket {
                foundation: "host_10.0.0.9".to_string(),
                protocol: "udp".to_string(),
                priority: 500,
                ip: "10.0.0.9".to_string(),
                port: 6112,
                kind: CandidateKind::Host,
                generation: 0,
                id: "7".to_string(),
                rel_addr: None,
                rel_port: None,
            }],
        }
    }

    #[test]
    fn test_initiate_reaches_awaiting_and_emits_candidates() {
        let (module, rpc) = test_module(true, false);
        module.initiate_ice();

        assert_eq!(module.ice_state(), IceState::AwaitingCandidates);
        let docs = pending_docs(&rpc);
        let states: Vec<&str> = docs
            .iter()
            .filter(|d| d["method"] == "onIceConnectionStateChanged")
            .map(|d| d["params"][2].as_str().unwrap())
            .collect();
        assert_eq!(states, vec!["gathering", "awaitingCandidates"]);
        let message = extract_candidates_message(&docs).unwrap();
        assert_eq!(message.src_id, 1);
        assert_eq!(message.dest_id, 2);
        assert!(!message.candidates.is_empty());
        module.close();
    }

    #[test]
    fn test_reinitiation_while_in_progress_is_rejected() {
        let (module, rpc) = test_module(true, false);
        module.initiate_ice();
        let first = pending_docs(&rpc);
        assert!(extract_candidates_message(&first).is_some());

        module.initiate_ice();
        assert_eq!(module.ice_state(), IceState::AwaitingCandidates);
        let second = pending_docs(&rpc);
        assert!(extract_candidates_message(&second).is_none());
        module.close();
    }

    #[test]
    fn test_offerer_discards_candidates_in_wrong_state() {
        let (module, rpc) = test_module(true, false);
        module.handle_ice_message(remote_message());

        assert_eq!(module.ice_state(), IceState::New);
        assert!(extract_candidates_message(&pending_docs(&rpc)).is_none());
        module.close();
    }

    #[test]
    fn test_gathering_failure_transitions_to_disconnected() {
        let (module, rpc) = test_module(true, true);
        module.initiate_ice();
        assert_eq!(module.ice_state(), IceState::Disconnected);
        assert!(!module.is_connected());
        // The retry is scheduled with backoff and must not have fired yet.
        assert!(extract_candidates_message(&pending_docs(&rpc)).is_none());
        module.close();
    }

    #[test]
    fn test_offer_answer_pair_reaches_connected() {
        let (offerer, offerer_rpc) = test_module(true, false);
        let (answerer, answerer_rpc) = test_module(false, false);

        // Offerer starts the exchange.
        offerer.initiate_ice();
        let offer = extract_candidates_message(&pending_docs(&offerer_rpc)).unwrap();

        // Answerer reacts: gathers synchronously, answers, starts checks.
        answerer.handle_ice_message(offer);
        assert_eq!(answerer.ice_state(), IceState::Connected);
        assert!(answerer.is_connected());

        let answerer_docs = pending_docs(&answerer_rpc);
        let answer = extract_candidates_message(&answerer_docs).unwrap();
        let answer_states: Vec<&str> = answerer_docs
            .iter()
            .filter(|d| d["method"] == "onIceConnectionStateChanged")
            .map(|d| d["params"][2].as_str().unwrap())
            .collect();
        assert_eq!(
            answer_states,
            vec!["gathering", "awaitingCandidates", "checking", "connected"]
        );

        // The answer completes the offerer side.
        offerer.handle_ice_message(answer);
        assert_eq!(offerer.ice_state(), IceState::Connected);
        assert!(offerer.is_connected());
        let connected_events: Vec<Value> = pending_docs(&offerer_rpc)
            .into_iter()
            .filter(|d| d["method"] == "onConnected")
            .collect();
        assert_eq!(connected_events.len(), 1);
        assert_eq!(connected_events[0]["params"][2], Value::Bool(true));

        offerer.close();
        answerer.close();
    }

    #[test]
    fn test_connection_loss_is_reported_exactly_once() {
        let (offerer, offerer_rpc) = test_module(true, false);
        let (answerer, answerer_rpc) = test_module(false, false);
        offerer.initiate_ice();
        let offer = extract_candidates_message(&pending_docs(&offerer_rpc)).unwrap();
        answerer.handle_ice_message(offer);
        assert!(answerer.is_connected());
        pending_docs(&answerer_rpc);

        answerer.on_connection_lost();
        answerer.on_connection_lost();

        assert_eq!(answerer.ice_state(), IceState::Disconnected);
        let docs = pending_docs(&answerer_rpc);
        let lost: Vec<&Value> = docs
            .iter()
            .filter(|d| d["method"] == "onConnected" && d["params"][2] == Value::Bool(false))
            .collect();
        assert_eq!(lost.len(), 1);
        let disconnects: Vec<&Value> = docs
            .iter()
            .filter(|d| {
                d["method"] == "onIceConnectionStateChanged" && d["params"][2] == "disconnected"
            })
            .collect();
        assert_eq!(disconnects.len(), 1);

        offerer.close();
        answerer.close();
    }

    #[test]
    fn test_answerer_never_schedules_retry() {
        let (offerer, offerer_rpc) = test_module(true, false);
        let (answerer, answerer_rpc) = test_module(false, false);
        offerer.initiate_ice();
        let offer = extract_candidates_message(&pending_docs(&offerer_rpc)).unwrap();
        answerer.handle_ice_message(offer);
        pending_docs(&answerer_rpc);

        answerer.on_connection_lost();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(answerer.ice_state(), IceState::Disconnected);
        assert!(extract_candidates_message(&pending_docs(&answerer_rpc)).is_none());

        offerer.close();
        answerer.close();
    }

    #[test]
    fn test_offerer_retries_immediately_after_connected_loss() {
        let (offerer, offerer_rpc) = test_module(true, false);
        let (answerer, _answerer_rpc) = test_module(false, false);
        offerer.initiate_ice();
        let offer = extract_candidates_message(&pending_docs(&offerer_rpc)).unwrap();
        answerer.handle_ice_message(offer);
        let answer =
            extract_candidates_message(&pending_docs(&_answerer_rpc)).unwrap();
        offerer.handle_ice_message(answer);
        assert!(offerer.is_connected());
        pending_docs(&offerer_rpc);

        // Loss from CONNECTED re-initiates without backoff.
        offerer.on_connection_lost();
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if offerer.ice_state() == IceState::AwaitingCandidates {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(offerer.ice_state(), IceState::AwaitingCandidates);

        offerer.close();
        answerer.close();
    }

    #[test]
    fn test_retry_delay_policy() {
        assert_eq!(retry_delay(IceState::Connected), Duration::ZERO);
        assert_eq!(retry_delay(IceState::Checking), RETRY_BACKOFF);
        assert_eq!(retry_delay(IceState::Gathering), RETRY_BACKOFF);
        assert_eq!(retry_delay(IceState::AwaitingCandidates), RETRY_BACKOFF);
    }

    #[test]
    fn test_close_blocks_further_initiation() {
        let (module, rpc) = test_module(true, false);
        module.close();
        module.initiate_ice();
        assert_eq!(module.ice_state(), IceState::Disconnected);
        assert!(extract_candidates_message(&pending_docs(&rpc)).is_none());
    }

    #[test]
    fn test_state_messages() {
        assert_eq!(IceState::New.message(), "new");
        assert_eq!(IceState::Gathering.message(), "gathering");
        assert_eq!(IceState::AwaitingCandidates.message(), "awaitingCandidates");
        assert_eq!(IceState::Checking.message(), "checking");
        assert_eq!(IceState::Connected.message(), "connected");
        assert_eq!(IceState::Disconnected.message(), "disconnected");
    }
}
