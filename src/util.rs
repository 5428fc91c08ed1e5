//! Shared utilities: free-port scanning, one-shot signals, randomness, clock.

use std::io;
use std::net::{TcpListener, UdpSocket};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ring::rand::{SecureRandom, SystemRandom};

/// Attempts per free-port scan before giving up.
const PORT_SCAN_ATTEMPTS: u32 = 64;

/// Alphabet for ufrag/password style tokens.
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

// ============================================================================
// Randomness
// ============================================================================

/// Fill `buf` with cryptographically random bytes.
pub fn rand_bytes(buf: &mut [u8]) -> io::Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "system rng unavailable"))
}

/// A random `u64`.
pub fn rand_u64() -> io::Result<u64> {
    let mut buf = [0u8; 8];
    rand_bytes(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// A random alphanumeric token of `len` characters.
pub fn rand_token(len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    rand_bytes(&mut buf)?;
    Ok(buf
        .iter()
        .map(|b| TOKEN_ALPHABET[*b as usize % TOKEN_ALPHABET.len()] as char)
        .collect())
}

// ============================================================================
// Clock
// ============================================================================

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Free-port scanning
// ============================================================================

/// Find a TCP port in `[from, to)` that is currently free.
///
/// The port is released again before returning; the caller is expected to bind
/// it promptly.
pub fn find_free_tcp_port(from: u16, to: u16) -> io::Result<u16> {
    for _ in 0..PORT_SCAN_ATTEMPTS {
        let port = random_port(from, to)?;
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        "no free tcp port found",
    ))
}

/// Find a UDP port in `[from, to)` that is currently free.
pub fn find_free_udp_port(from: u16, to: u16) -> io::Result<u16> {
    for _ in 0..PORT_SCAN_ATTEMPTS {
        let port = random_port(from, to)?;
        if UdpSocket::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        "no free udp port found",
    ))
}

fn random_port(from: u16, to: u16) -> io::Result<u16> {
    let span = (to - from) as u64;
    Ok(from + (rand_u64()? % span) as u16)
}

// ============================================================================
// One-shot signal
// ============================================================================

/// State of a [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Pending,
    Set,
    Cancelled,
}

/// A one-shot readiness cell with waiters.
///
/// Fires at most once; a cancelled signal wakes waiters with `false` so queued
/// work can be abandoned. A new lifecycle gets a fresh `Signal` instance, the
/// cell itself is never reset.
#[derive(Debug)]
pub struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Signal {
            state: Mutex::new(SignalState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Mark the signal as fired, waking all waiters. No-op once resolved.
    pub fn set(&self) {
        let mut state = self.state.lock().expect("signal lock poisoned");
        if *state == SignalState::Pending {
            *state = SignalState::Set;
            self.cond.notify_all();
        }
    }

    /// Cancel the signal, waking all waiters with `false`. No-op once resolved.
    pub fn cancel(&self) {
        let mut state = self.state.lock().expect("signal lock poisoned");
        if *state == SignalState::Pending {
            *state = SignalState::Cancelled;
            self.cond.notify_all();
        }
    }

    /// Block until the signal resolves. Returns `true` if it fired.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().expect("signal lock poisoned");
        while *state == SignalState::Pending {
            state = self.cond.wait(state).expect("signal lock poisoned");
        }
        *state == SignalState::Set
    }

    /// Block up to `timeout`. `None` means the signal is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let mut state = self.state.lock().expect("signal lock poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while *state == SignalState::Pending {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("signal lock poisoned");
            state = guard;
        }
        Some(*state == SignalState::Set)
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().expect("signal lock poisoned") == SignalState::Set
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_rand_token_length_and_alphabet() {
        let token = rand_token(22).unwrap();
        assert_eq!(token.len(), 22);
        assert!(token.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_find_free_tcp_port_in_range() {
        let port = find_free_tcp_port(20000, 65535).unwrap();
        assert!((20000..65535).contains(&port));
        // The scan released it, so binding must succeed.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_find_free_udp_port_in_range() {
        let port = find_free_udp_port(20000, 65535).unwrap();
        assert!((20000..65535).contains(&port));
        UdpSocket::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_signal_set_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait())
        };
        signal.set();
        assert!(waiter.join().unwrap());
        assert!(signal.is_set());
    }

    #[test]
    fn test_signal_cancel_wakes_waiter_with_false() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait())
        };
        signal.cancel();
        assert!(!waiter.join().unwrap());
        assert!(!signal.is_set());
    }

    #[test]
    fn test_signal_resolves_only_once() {
        let signal = Signal::new();
        signal.set();
        signal.cancel();
        assert!(signal.is_set());
        assert_eq!(signal.wait_timeout(Duration::from_millis(10)), Some(true));
    }

    #[test]
    fn test_signal_wait_timeout_pending() {
        let signal = Signal::new();
        assert_eq!(signal.wait_timeout(Duration::from_millis(20)), None);
    }
}
