use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use util::vnet::net::*;

use crate::network_type::*;
use crate::ptcp::PtcpConfig;
use crate::url::*;

/// Ta, the minimum interval between outgoing connectivity-check and
/// discovery transmissions.
pub(crate) const DEFAULT_TA: Duration = Duration::from_millis(20);

/// Cap on the number of candidate pairs a stream will check.
pub(crate) const DEFAULT_MAX_CONNECTIVITY_CHECKS: usize = 100;

/// The interval used to keep selected pairs alive.
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Max transmissions of one connectivity check before its pair fails.
pub(crate) const DEFAULT_MAX_BINDING_REQUESTS: u16 = 7;

/// How long a selected pair may stay silent before the agent starts
/// complaining about it.
pub(crate) const DEFAULT_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor of the connectivity-check retransmission timeout.
pub(crate) const MIN_CHECK_RTO: Duration = Duration::from_millis(500);

pub type InterfaceFilterFn = Box<dyn (Fn(&str) -> bool) + Send + Sync>;
pub type IpFilterFn = Box<dyn (Fn(IpAddr) -> bool) + Send + Sync>;

/// Collects the arguments to `Agent` construction into a single structure,
/// for future-proofness of the interface.
#[derive(Default)]
pub struct AgentConfig {
    /// STUN and TURN servers used during gathering.
    pub urls: Vec<Url>,

    /// Whether this agent starts in the controlling role.
    pub is_controlling: bool,

    /// Run a pseudo-TCP reliable byte stream over each component's selected
    /// pair.
    pub reliable: bool,

    /// Pacing interval for checks and discovery. Defaults to 20 ms.
    pub ta: Option<Duration>,

    /// Limit on the check-list size per stream. Defaults to 100.
    pub max_connectivity_checks: Option<usize>,

    /// How often to refresh a selected pair. Zero disables keepalives.
    /// Defaults to 2 s.
    pub keepalive_interval: Option<Duration>,

    /// The max amount of binding requests the agent will send over a
    /// candidate pair for validation or nomination before the pair fails.
    pub max_binding_requests: Option<u16>,

    /// An optional configuration for disabling or enabling support for
    /// specific network types.
    pub network_types: Vec<NetworkType>,

    /// A function that you can use in order to whitelist or blacklist the
    /// interfaces which are used to gather ICE candidates.
    pub interface_filter: Arc<Option<InterfaceFilterFn>>,

    /// A function that you can use in order to whitelist or blacklist the
    /// ips which are used to gather ICE candidates.
    pub ip_filter: Arc<Option<IpFilterFn>>,

    /// Include loopback addresses in the candidate list.
    pub include_loopback: bool,

    /// Tuning for the reliable transport.
    pub ptcp: PtcpConfig,

    /// Net is the our abstracted network interface for internal development
    /// purpose only.
    pub net: Option<Arc<Net>>,
}

impl AgentConfig {
    pub(crate) fn ta(&self) -> Duration {
        match self.ta {
            Some(ta) if ta != Duration::from_secs(0) => ta,
            _ => DEFAULT_TA,
        }
    }

    pub(crate) fn max_connectivity_checks(&self) -> usize {
        match self.max_connectivity_checks {
            Some(n) if n > 0 => n,
            _ => DEFAULT_MAX_CONNECTIVITY_CHECKS,
        }
    }

    pub(crate) fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
            .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL)
    }

    pub(crate) fn max_binding_requests(&self) -> u16 {
        match self.max_binding_requests {
            Some(n) if n > 0 => n,
            _ => DEFAULT_MAX_BINDING_REQUESTS,
        }
    }

    pub(crate) fn network_types(&self) -> Vec<NetworkType> {
        if self.network_types.is_empty() {
            supported_network_types()
        } else {
            self.network_types.clone()
        }
    }
}
