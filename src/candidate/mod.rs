#[cfg(test)]
mod candidate_pair_test;
#[cfg(test)]
mod candidate_test;
#[cfg(test)]
mod exchange_test;

pub mod candidate_base;
pub mod candidate_host;
pub mod candidate_peer_reflexive;
pub mod candidate_relay;
pub mod candidate_server_reflexive;
pub mod exchange;

use crate::error::Result;
use crate::network_type::*;
use crate::tcp_type::*;
use candidate_base::*;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, Mutex};
use util::sync::Mutex as SyncMutex;

pub(crate) const RECEIVE_MTU: usize = 8192;
pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Represents a transport address the agent may use or accept.
#[async_trait]
pub trait Candidate: fmt::Display {
    /// An arbitrary string used in the freezing algorithm to
    /// group similar candidates.  It is the same for two candidates that
    /// have the same type, base IP address, protocol (UDP, TCP, etc.),
    /// and STUN or TURN server.
    fn foundation(&self) -> String;

    /// A unique identifier for just this candidate
    /// Unlike the foundation this is different for each candidate.
    fn id(&self) -> String;

    /// The component this candidate serves within its stream.
    fn component(&self) -> u16;
    fn set_component(&self, c: u16);

    /// The last time this candidate received traffic
    fn last_received(&self) -> SystemTime;

    /// The last time this candidate sent traffic
    fn last_sent(&self) -> SystemTime;

    fn network_type(&self) -> NetworkType;
    fn address(&self) -> String;
    fn port(&self) -> u16;

    fn priority(&self) -> u32;
    fn set_priority(&self, p: u32);

    /// A transport address related to candidate,
    /// which is useful for diagnostics and other purposes.
    fn related_address(&self) -> Option<CandidateRelatedAddress>;

    fn candidate_type(&self) -> CandidateType;
    fn tcp_type(&self) -> TcpType;

    fn marshal(&self) -> String;

    fn addr(&self) -> SocketAddr;

    /// The address checks are sent from: the candidate's own address for a
    /// host candidate, the underlying host address otherwise.
    fn base_addr(&self) -> SocketAddr;

    async fn close(&self) -> Result<()>;
    fn seen(&self, outbound: bool);

    async fn write_to(&self, raw: &[u8], dst: &(dyn Candidate + Send + Sync)) -> Result<usize>;
    fn equal(&self, other: &dyn Candidate) -> bool;
    fn set_ip(&self, ip: &IpAddr) -> Result<()>;
    fn get_conn(&self) -> Option<&Arc<dyn util::Conn + Send + Sync>>;
    fn get_closed_ch(&self) -> Arc<Mutex<Option<broadcast::Sender<()>>>>;
}

/// Represents the type of candidate `CandidateType` enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidateType {
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

// String makes CandidateType printable
impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unspecified => "Unknown candidate type",
        };
        write!(f, "{s}")
    }
}

impl Default for CandidateType {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl CandidateType {
    /// Returns the preference weight of a `CandidateType`.
    ///
    /// 4.1.2.2.  Guidelines for Choosing Type and Local Preferences
    /// The RECOMMENDED values are 126 for host candidates, 100
    /// for server reflexive candidates, 110 for peer reflexive candidates,
    /// and 0 for relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay | CandidateType::Unspecified => 0,
        }
    }

    /// Parses the exchange-line type token.
    pub fn from_token(raw: &str) -> Option<Self> {
        match raw {
            "host" => Some(Self::Host),
            "srflx" => Some(Self::ServerReflexive),
            "prflx" => Some(Self::PeerReflexive),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }
}

/// Convey transport addresses related to the candidate, useful for diagnostics and other purposes.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct CandidateRelatedAddress {
    pub address: String,
    pub port: u16,
}

// String makes CandidateRelatedAddress printable
impl fmt::Display for CandidateRelatedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " related {}:{}", self.address, self.port)
    }
}

/// Represent the ICE candidate pair state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidatePairState {
    #[serde(rename = "unspecified")]
    Unspecified = 0,

    /// Means a check may not be performed for the pair yet because another
    /// pair with the same foundation is still being checked.
    #[serde(rename = "frozen")]
    Frozen = 1,

    /// Means a check has not been performed for this pair.
    #[serde(rename = "waiting")]
    Waiting = 2,

    /// Means a check has been sent for this pair, but the transaction is in progress.
    #[serde(rename = "in-progress")]
    InProgress = 3,

    /// Means a check for this pair was already done and produced a successful result.
    #[serde(rename = "succeeded")]
    Succeeded = 4,

    /// Means a check for this pair was already done and failed, either never producing any response
    /// or producing an unrecoverable failure response.
    #[serde(rename = "failed")]
    Failed = 5,

    /// Means the pair's check was abandoned because its component nominated
    /// another pair.
    #[serde(rename = "cancelled")]
    Cancelled = 6,

    /// Means the pair was learned from the mapped address of a check response
    /// rather than from signalled candidates.
    #[serde(rename = "discovered")]
    Discovered = 7,
}

impl From<u8> for CandidatePairState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Frozen,
            2 => Self::Waiting,
            3 => Self::InProgress,
            4 => Self::Succeeded,
            5 => Self::Failed,
            6 => Self::Cancelled,
            7 => Self::Discovered,
            _ => Self::Unspecified,
        }
    }
}

impl Default for CandidatePairState {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Frozen => "frozen",
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Discovered => "discovered",
            Self::Unspecified => "unspecified",
        };

        write!(f, "{s}")
    }
}

impl CandidatePairState {
    /// A terminal state never leaves the check list again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// The in-flight Binding transaction of a pair, kept for retransmission
/// and response matching.
#[derive(Debug, Clone)]
pub(crate) struct PairTransaction {
    pub(crate) transaction_id: stun::agent::TransactionId,
    pub(crate) raw: Vec<u8>,
    pub(crate) attempts: u16,
    pub(crate) next_rtx: tokio::time::Instant,
    pub(crate) rto: tokio::time::Duration,
    pub(crate) is_use_candidate: bool,
}

/// Represents a combination of a local and remote candidate.
pub struct CandidatePair {
    pub local: Arc<dyn Candidate + Send + Sync>,
    pub remote: Arc<dyn Candidate + Send + Sync>,
    pub(crate) ice_role_controlling: AtomicBool,
    pub(crate) state: AtomicU8, // CandidatePairState
    pub(crate) nominated: AtomicBool,
    /// Set when USE-CANDIDATE arrived while the pair's own check was still
    /// in flight; the success response completes the nomination.
    pub(crate) nominate_on_success: AtomicBool,
    pub(crate) binding_request_count: AtomicU16,
    /// Priority under the role recorded in `ice_role_controlling`;
    /// recomputed when a role conflict flips the agent.
    pub(crate) cached_priority: AtomicU64,
    pub(crate) transaction: SyncMutex<Option<PairTransaction>>,
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority()
        )
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority()
        )
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.local.equal(&*other.local) && self.remote.equal(&*other.remote)
    }
}

impl CandidatePair {
    #[must_use]
    pub fn new(
        local: Arc<dyn Candidate + Send + Sync>,
        remote: Arc<dyn Candidate + Send + Sync>,
        controlling: bool,
    ) -> Self {
        let pair = Self {
            local,
            remote,
            ice_role_controlling: AtomicBool::new(controlling),
            state: AtomicU8::new(CandidatePairState::Frozen as u8),
            nominated: AtomicBool::new(false),
            nominate_on_success: AtomicBool::new(false),
            binding_request_count: AtomicU16::new(0),
            cached_priority: AtomicU64::new(0),
            transaction: SyncMutex::new(None),
        };
        pair.cached_priority
            .store(pair.compute_priority(), Ordering::SeqCst);
        pair
    }

    /// The pair foundation is the concatenation of the candidate foundations.
    pub fn foundation(&self) -> String {
        format!("{}:{}", self.local.foundation(), self.remote.foundation())
    }

    /// RFC 5245 - 5.7.2.  Computing Pair Priority and Ordering Pairs
    /// Let G be the priority for the candidate provided by the controlling
    /// agent.  Let D be the priority for the candidate provided by the
    /// controlled agent.
    /// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    pub fn priority(&self) -> u64 {
        self.cached_priority.load(Ordering::SeqCst)
    }

    pub(crate) fn compute_priority(&self) -> u64 {
        let (g, d) = if self.ice_role_controlling.load(Ordering::SeqCst) {
            (self.local.priority(), self.remote.priority())
        } else {
            (self.remote.priority(), self.local.priority())
        };

        (1_u64 << 32) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }

    /// Re-derives the pair priority after a role flip.
    pub(crate) fn set_role(&self, controlling: bool) {
        self.ice_role_controlling.store(controlling, Ordering::SeqCst);
        self.cached_priority
            .store(self.compute_priority(), Ordering::SeqCst);
    }

    pub fn state(&self) -> CandidatePairState {
        CandidatePairState::from(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: CandidatePairState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_nominated(&self) -> bool {
        self.nominated.load(Ordering::SeqCst)
    }

    pub async fn write(&self, b: &[u8]) -> Result<usize> {
        self.local.write_to(b, &*self.remote).await
    }
}

/// Orders pairs for the check list: descending priority, ties broken by the
/// local then remote candidate address.
pub(crate) fn pair_ordering(a: &CandidatePair, b: &CandidatePair) -> std::cmp::Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.local.addr().to_string().cmp(&b.local.addr().to_string()))
        .then_with(|| {
            a.remote
                .addr()
                .to_string()
                .cmp(&b.remote.addr().to_string())
        })
}
