//! Candidate exchange payload.
//!
//! One `CandidatesMessage` per exchange attempt, relayed end-to-end through
//! the control plane. Field names are the wire contract with the paired
//! adapter instance and must not drift.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::engine::{Candidate, CandidateKind, IceAgent};

/// Process-wide source for adapter-local candidate ids.
static CANDIDATE_ID_FACTORY: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Wire Types
// ============================================================================

/// One candidate as carried over the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePacket {
    pub foundation: String,
    pub protocol: String,
    pub priority: u64,
    pub ip: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: CandidateKind,
    pub generation: u32,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_port: Option<u16>,
}

/// A full local candidate set plus the agent's short-term credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatesMessage {
    pub src_id: i64,
    pub dest_id: i64,
    pub password: String,
    pub ufrag: String,
    pub candidates: Vec<CandidatePacket>,
}

// ============================================================================
// Packing / Unpacking
// ============================================================================

/// Pack the agent's local candidate set for the remote adapter.
pub fn pack_candidates(
    src_id: i64,
    dest_id: i64,
    agent: &dyn IceAgent,
    local_candidates: &[Candidate],
) -> CandidatesMessage {
    let candidates = local_candidates
        .iter()
        .map(|c| CandidatePacket {
            foundation: c.foundation.clone(),
            protocol: c.protocol.clone(),
            priority: c.priority,
            ip: c.addr.ip().to_string(),
            port: c.addr.port(),
            kind: c.kind,
            generation: agent.generation(),
            id: CANDIDATE_ID_FACTORY.fetch_add(1, Ordering::SeqCst).to_string(),
            rel_addr: c.related.map(|r| r.ip().to_string()),
            rel_port: c.related.map(|r| r.port()),
        })
        .collect();

    CandidatesMessage {
        src_id,
        dest_id,
        password: agent.local_password(),
        ufrag: agent.local_ufrag(),
        candidates,
    }
}

/// Register a remote candidate set with the agent.
///
/// Candidates are processed in descending priority order; entries from a
/// different generation or with unusable addresses are skipped. Returns the
/// number of candidates registered.
pub fn unpack_candidates(message: &CandidatesMessage, agent: &dyn IceAgent) -> usize {
    agent.set_remote_credentials(&message.ufrag, &message.password);

    let candidates = sorted_remote_candidates(&message.candidates, agent.generation());
    let count = candidates.len();
    for candidate in candidates {
        agent.add_remote_candidate(candidate);
    }
    count
}

/// Decode and order the usable candidates from a remote packet list.
pub fn sorted_remote_candidates(packets: &[CandidatePacket], generation: u32) -> Vec<Candidate> {
    let mut packets: Vec<&CandidatePacket> = packets
        .iter()
        .filter(|p| p.generation == generation)
        .collect();
    packets.sort_by(|a, b| b.priority.cmp(&a.priority));

    packets
        .into_iter()
        .filter_map(|p| {
            if p.port == 0 {
                log::warn!("Skipping candidate {} with port 0", p.id);
                return None;
            }
            let ip: IpAddr = match p.ip.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    log::warn!("Skipping candidate {} with unusable ip {}", p.id, p.ip);
                    return None;
                }
            };
            let related = match (&p.rel_addr, p.rel_port) {
                (Some(addr), Some(port)) if port > 0 => addr
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, port)),
                _ => None,
            };
            Some(Candidate {
                kind: p.kind,
                addr: SocketAddr::new(ip, p.port),
                priority: p.priority,
                foundation: p.foundation.clone(),
                protocol: p.protocol.clone(),
                related,
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(id: &str, priority: u64, ip: &str, port: u16, generation: u32) -> CandidatePacket {
        CandidatePacket {
            foundation: format!("host_{}", ip),
            protocol: "udp".to_string(),
            priority,
            ip: ip.to_string(),
            port,
            kind: CandidateKind::Host,
            generation,
            id: id.to_string(),
            rel_addr: None,
            rel_port: None,
        }
    }

    #[test]
    fn test_wire_field_names() {
        let message = CandidatesMessage {
            src_id: 1,
            dest_id: 2,
            password: "pw".to_string(),
            ufrag: "uf".to_string(),
            candidates: vec![CandidatePacket {
                rel_addr: Some("192.168.1.1".to_string()),
                rel_port: Some(6112),
                ..packet("0", 100, "203.0.113.4", 40000, 0)
            }],
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["srcId"], 1);
        assert_eq!(json["destId"], 2);
        assert_eq!(json["password"], "pw");
        assert_eq!(json["ufrag"], "uf");
        let c = &json["candidates"][0];
        assert_eq!(c["foundation"], "host_203.0.113.4");
        assert_eq!(c["protocol"], "udp");
        assert_eq!(c["priority"], 100);
        assert_eq!(c["ip"], "203.0.113.4");
        assert_eq!(c["port"], 40000);
        assert_eq!(c["type"], "host");
        assert_eq!(c["generation"], 0);
        assert_eq!(c["relAddr"], "192.168.1.1");
        assert_eq!(c["relPort"], 6112);
    }

    #[test]
    fn test_json_roundtrip_preserves_fields() {
        let message = CandidatesMessage {
            src_id: 7,
            dest_id: 9,
            password: "secret".to_string(),
            ufrag: "frag".to_string(),
            candidates: vec![
                packet("1", 500, "10.0.0.1", 6112, 0),
                CandidatePacket {
                    kind: CandidateKind::ServerReflexive,
                    rel_addr: Some("10.0.0.1".to_string()),
                    rel_port: Some(6112),
                    ..packet("2", 300, "203.0.113.4", 40000, 0)
                },
            ],
        };
        let json = serde_json::to_string(&message).unwrap();
        let decoded: CandidatesMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_unpack_sorts_by_descending_priority() {
        let packets = vec![
            packet("low", 10, "10.0.0.1", 1000, 0),
            packet("high", 900, "10.0.0.2", 2000, 0),
            packet("mid", 400, "10.0.0.3", 3000, 0),
        ];
        let candidates = sorted_remote_candidates(&packets, 0);
        let priorities: Vec<u64> = candidates.iter().map(|c| c.priority).collect();
        assert_eq!(priorities, vec![900, 400, 10]);
    }

    #[test]
    fn test_unpack_filters_wrong_generation() {
        let packets = vec![
            packet("current", 100, "10.0.0.1", 1000, 0),
            packet("stale", 900, "10.0.0.2", 2000, 3),
        ];
        let candidates = sorted_remote_candidates(&packets, 0);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].addr.port(), 1000);
    }

    #[test]
    fn test_unpack_skips_unusable_entries() {
        let packets = vec![
            packet("good", 100, "10.0.0.1", 1000, 0),
            packet("no-port", 200, "10.0.0.2", 0, 0),
            packet("bad-ip", 300, "not-an-ip", 1000, 0),
        ];
        let candidates = sorted_remote_candidates(&packets, 0);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].foundation, "host_10.0.0.1");
    }

    #[test]
    fn test_unpack_recovers_related_address() {
        let packets = vec![CandidatePacket {
            kind: CandidateKind::ServerReflexive,
            rel_addr: Some("192.168.1.7".to_string()),
            rel_port: Some(6113),
            ..packet("srflx", 100, "203.0.113.4", 40000, 0)
        }];
        let candidates = sorted_remote_candidates(&packets, 0);
        assert_eq!(
            candidates[0].related,
            Some("192.168.1.7:6113".parse().unwrap())
        );
    }
}
