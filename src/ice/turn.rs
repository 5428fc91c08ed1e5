//! Relay lease refreshing.
//!
//! A relay allocation expires server-side (ten-minute lease at most), so while
//! a relayed candidate is in use the allocation is renewed well inside that
//! window, for the lifetime of the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::engine::IceAgent;

/// Renewal cadence; the server lease is at most ten minutes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// Step used to re-check the stop flag while sleeping between renewals.
const STOP_POLL: Duration = Duration::from_secs(1);

/// Periodically renews the relay allocation behind a relayed candidate.
pub struct TurnRefreshModule {
    running: Arc<AtomicBool>,
}

impl TurnRefreshModule {
    /// Spawn the refresh worker for `agent`'s relay allocation.
    pub fn start(agent: Arc<dyn IceAgent>, remote_id: i64) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        thread::spawn(move || {
            log::info!("Started turn refresh module for peer {}", remote_id);
            while flag.load(Ordering::SeqCst) {
                match agent.refresh_relay() {
                    Ok(()) => log::debug!("Sent turn refresh request for peer {}", remote_id),
                    Err(e) => {
                        log::error!("Could not send turn refresh request: {}", e);
                    }
                }

                let mut waited = Duration::ZERO;
                while waited < REFRESH_INTERVAL && flag.load(Ordering::SeqCst) {
                    thread::sleep(STOP_POLL);
                    waited += STOP_POLL;
                }
            }
            log::debug!("Turn refresh module for peer {} stopped", remote_id);
        });

        TurnRefreshModule { running }
    }

    /// Stop the refresh worker. Idempotent.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for TurnRefreshModule {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
