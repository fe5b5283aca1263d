use std::net::IpAddr;
use std::sync::Arc;

use super::candidate_base::{CandidateBaseConfig, CandidateBase};
use super::candidate_host::CandidateHostConfig;
use super::candidate_peer_reflexive::CandidatePeerReflexiveConfig;
use super::candidate_relay::CandidateRelayConfig;
use super::candidate_server_reflexive::CandidateServerReflexiveConfig;
use super::{Candidate, CandidateType};
use crate::error::*;
use crate::network_type::UDP;

/// One candidate of a bootstrap exchange line:
/// `<foundation,priority,ip,port,type>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: IpAddr,
    pub port: u16,
    pub candidate_type: CandidateType,
}

/// A parsed peer line: `ufrag password <cand>...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeLine {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<ExchangeCandidate>,
}

impl ExchangeLine {
    /// Renders the single-line bootstrap form.
    pub fn marshal(&self) -> String {
        let mut out = format!("{} {}", self.ufrag, self.pwd);
        for c in &self.candidates {
            out += &format!(
                " <{},{},{},{},{}>",
                c.foundation, c.priority, c.ip, c.port, c.candidate_type
            );
        }
        out
    }

    /// Parses a peer line produced by `marshal` (or a remote implementation).
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split_whitespace();

        let ufrag = parts
            .next()
            .ok_or(Error::ErrRemoteUfragEmpty)?
            .to_owned();
        let pwd = parts.next().ok_or(Error::ErrRemotePwdEmpty)?.to_owned();

        let mut candidates = vec![];
        for token in parts {
            if !token.starts_with('<') || !token.ends_with('>') {
                return Err(Error::ErrAttributeTooShortCandidate);
            }
            let inner = &token[1..token.len() - 1];
            let fields: Vec<&str> = inner.split(',').collect();
            if fields.len() != 5 {
                return Err(Error::ErrAttributeTooShortCandidate);
            }

            let candidate_type =
                CandidateType::from_token(fields[4]).ok_or(Error::ErrUnknownCandidateType)?;

            candidates.push(ExchangeCandidate {
                foundation: fields[0].to_owned(),
                priority: fields[1].parse().map_err(|_| Error::ErrParsePriority)?,
                ip: fields[2].parse().map_err(|_| Error::ErrAddressParseFailed)?,
                port: fields[3].parse().map_err(|_| Error::ErrParsePort)?,
                candidate_type,
            });
        }

        Ok(Self {
            ufrag,
            pwd,
            candidates,
        })
    }
}

/// Builds the local peer line for a set of gathered candidates.
pub fn encode_exchange_line(
    ufrag: &str,
    pwd: &str,
    candidates: &[Arc<dyn Candidate + Send + Sync>],
) -> String {
    let line = ExchangeLine {
        ufrag: ufrag.to_owned(),
        pwd: pwd.to_owned(),
        candidates: candidates
            .iter()
            .map(|c| ExchangeCandidate {
                foundation: c.foundation(),
                priority: c.priority(),
                ip: c.addr().ip(),
                port: c.port(),
                candidate_type: c.candidate_type(),
            })
            .collect(),
    };
    line.marshal()
}

impl ExchangeCandidate {
    /// Materializes the remote candidate for a component.
    pub fn into_candidate(self, component: u16) -> Result<CandidateBase> {
        let base_config = CandidateBaseConfig {
            network: UDP.to_owned(),
            address: self.ip.to_string(),
            port: self.port,
            component,
            priority: self.priority,
            foundation: self.foundation,
            ..CandidateBaseConfig::default()
        };

        match self.candidate_type {
            CandidateType::Host => CandidateHostConfig {
                base_config,
                ..CandidateHostConfig::default()
            }
            .new_candidate_host(),
            CandidateType::ServerReflexive => CandidateServerReflexiveConfig {
                base_config,
                ..CandidateServerReflexiveConfig::default()
            }
            .new_candidate_server_reflexive(),
            CandidateType::PeerReflexive => CandidatePeerReflexiveConfig {
                base_config,
                ..CandidatePeerReflexiveConfig::default()
            }
            .new_candidate_peer_reflexive(),
            CandidateType::Relay => CandidateRelayConfig {
                base_config,
                ..CandidateRelayConfig::default()
            }
            .new_candidate_relay(),
            CandidateType::Unspecified => Err(Error::ErrUnknownCandidateType),
        }
    }
}
