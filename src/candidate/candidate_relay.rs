use std::sync::atomic::{AtomicU16, AtomicU32};

use super::candidate_base::*;
use super::*;
use crate::rand::generate_cand_id;

/// A TURN server the agent may allocate relayed candidates on.
///
/// Candidates discovered through the same server share one instance; the
/// `Arc` strong count doubles as the reference count, so the entry is
/// released when the last referring candidate is freed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnServer {
    pub addr: String,
    pub username: String,
    pub password: String,
}

/// The config required to create a new `CandidateRelay`.
#[derive(Default)]
pub struct CandidateRelayConfig {
    pub base_config: CandidateBaseConfig,

    pub rel_addr: String,
    pub rel_port: u16,
    pub relay_client: Option<Arc<turn::client::Client>>,
    pub turn_server: Option<Arc<TurnServer>>,
}

impl CandidateRelayConfig {
    /// Creates a new relay candidate.
    pub fn new_candidate_relay(self) -> Result<CandidateBase> {
        let mut candidate_id = self.base_config.candidate_id;
        if candidate_id.is_empty() {
            candidate_id = generate_cand_id();
        }

        let c = CandidateBase {
            id: candidate_id,
            network_type: AtomicU8::new(NetworkType::Udp4 as u8),
            candidate_type: CandidateType::Relay,
            address: self.base_config.address.clone(),
            port: self.base_config.port,
            component: AtomicU16::new(self.base_config.component),
            foundation_override: self.base_config.foundation,
            priority_override: AtomicU32::new(self.base_config.priority),
            related_address: Some(CandidateRelatedAddress {
                address: self.rel_addr.clone(),
                port: self.rel_port,
            }),
            network: self.base_config.network,
            conn: self.base_config.conn,
            relay_client: self.relay_client,
            turn_server: self.turn_server,
            remote_ufrag: self.base_config.remote_ufrag,
            ..CandidateBase::default()
        };

        let ip = self.base_config.address.parse()?;
        c.set_ip(&ip)?;

        Ok(c)
    }
}
