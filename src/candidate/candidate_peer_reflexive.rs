use std::sync::atomic::{AtomicU16, AtomicU32};

use super::candidate_base::*;
use super::*;
use crate::rand::generate_cand_id;

/// The config required to create a new `CandidatePeerReflexive`.
#[derive(Default)]
pub struct CandidatePeerReflexiveConfig {
    pub base_config: CandidateBaseConfig,

    pub rel_addr: String,
    pub rel_port: u16,
}

impl CandidatePeerReflexiveConfig {
    /// Creates a new peer reflective candidate.
    pub fn new_candidate_peer_reflexive(self) -> Result<CandidateBase> {
        let mut candidate_id = self.base_config.candidate_id;
        if candidate_id.is_empty() {
            candidate_id = generate_cand_id();
        }

        let c = CandidateBase {
            id: candidate_id,
            network_type: AtomicU8::new(NetworkType::Udp4 as u8),
            candidate_type: CandidateType::PeerReflexive,
            address: self.base_config.address.clone(),
            port: self.base_config.port,
            component: AtomicU16::new(self.base_config.component),
            foundation_override: self.base_config.foundation,
            priority_override: AtomicU32::new(self.base_config.priority),
            related_address: if self.rel_addr.is_empty() {
                None
            } else {
                Some(CandidateRelatedAddress {
                    address: self.rel_addr.clone(),
                    port: self.rel_port,
                })
            },
            network: self.base_config.network,
            conn: self.base_config.conn,
            remote_ufrag: self.base_config.remote_ufrag,
            ..CandidateBase::default()
        };

        let ip = self.base_config.address.parse()?;
        c.set_ip(&ip)?;

        if !self.rel_addr.is_empty() {
            let base_ip: IpAddr = self.rel_addr.parse()?;
            *c.base_address.lock() = Some(SocketAddr::new(base_ip, self.rel_port));
        }

        Ok(c)
    }
}
