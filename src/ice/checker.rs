//! Liveness probing for established connections.
//!
//! ICE does not reliably notice mid-session path loss, so the offering side
//! sends a tagged echo every second and watches for the turnaround. Only the
//! offerer probes and measures RTT; the answerer echoes probes back verbatim.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::ice::module::PeerIceModule;
use crate::util;

/// Probe cadence.
pub const ECHO_INTERVAL: Duration = Duration::from_secs(1);

/// Silence threshold after which the connection is declared dead.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe length: tag byte plus a millisecond timestamp.
pub const ECHO_PACKET_LEN: usize = 9;

struct CheckerState {
    running: bool,
    average_rtt: f32,
    last_received: Instant,
}

/// Sends echo probes over the data channel and tracks the response RTT.
pub struct ConnectivityChecker {
    state: Mutex<CheckerState>,
}

impl ConnectivityChecker {
    pub fn new() -> Self {
        ConnectivityChecker {
            state: Mutex::new(CheckerState {
                running: false,
                average_rtt: 0.0,
                last_received: Instant::now(),
            }),
        }
    }

    /// Begin probing. No-op while already running.
    pub fn start(&self, ice: Arc<PeerIceModule>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return;
            }
            state.running = true;
            state.average_rtt = 0.0;
            state.last_received = Instant::now();
        }

        log::debug!(
            "Starting connectivity checker for peer {}",
            ice.remote_id()
        );
        thread::spawn(move || ice.checker().probe_loop(&ice));
    }

    /// Stop probing. Idempotent, safe before `start`.
    pub fn stop(&self) {
        self.state.lock().unwrap().running = false;
    }

    /// The smoothed RTT, once at least one echo came back.
    pub fn average_rtt(&self) -> Option<f32> {
        let state = self.state.lock().unwrap();
        if state.average_rtt > 0.0 {
            Some(state.average_rtt)
        } else {
            None
        }
    }

    /// Feed one received echo packet back into the RTT tracker.
    pub fn echo_received(&self, data: &[u8]) {
        if data.len() != ECHO_PACKET_LEN {
            log::warn!("Received echo of wrong length, length: {}", data.len());
            return;
        }

        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&data[1..9]);
        let sent_at = u64::from_be_bytes(stamp);
        let rtt = util::now_millis().saturating_sub(sent_at) as f32;

        let mut state = self.state.lock().unwrap();
        if state.average_rtt == 0.0 {
            state.average_rtt = rtt;
        } else {
            state.average_rtt = state.average_rtt * 0.8 + rtt * 0.2;
        }
        state.last_received = Instant::now();
        log::trace!("Received echo after {} ms, averageRTT: {} ms", rtt, state.average_rtt as u32);
    }

    /// Build one probe: tag byte plus the current time in milliseconds.
    pub fn build_probe() -> [u8; ECHO_PACKET_LEN] {
        let mut probe = [0u8; ECHO_PACKET_LEN];
        probe[0] = b'e';
        probe[1..9].copy_from_slice(&util::now_millis().to_be_bytes());
        probe
    }

    fn probe_loop(&self, ice: &Arc<PeerIceModule>) {
        loop {
            if !self.state.lock().unwrap().running {
                return;
            }

            ice.send_via_ice(&Self::build_probe());

            thread::sleep(ECHO_INTERVAL);

            let silent_for = {
                let mut state = self.state.lock().unwrap();
                if !state.running {
                    return;
                }
                let silent_for = state.last_received.elapsed();
                if silent_for > ECHO_TIMEOUT {
                    // Flip the flag before tearing down so the loss path can
                    // only be entered once from here.
                    state.running = false;
                }
                silent_for
            };

            if silent_for > ECHO_TIMEOUT {
                log::warn!(
                    "No echo response from peer {} for {} ms, connection lost",
                    ice.remote_id(),
                    silent_for.as_millis()
                );
                ice.on_connection_lost();
                return;
            }
        }
    }
}

impl Default for ConnectivityChecker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
