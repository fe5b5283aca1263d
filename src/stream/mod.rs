#[cfg(test)]
mod stream_test;

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tokio::sync::Mutex;
use util::sync::Mutex as SyncMutex;

use crate::candidate::*;
use crate::error::*;
use crate::ptcp::PseudoTcp;
use crate::rand::{generate_pwd, generate_ufrag};
use crate::state::{ComponentState, GatheringState};
use crate::timer::TimerId;

/// Inbound non-STUN datagrams held back until a pair is selected. Bounded;
/// the reliable layer retransmits anything dropped past the bound.
pub(crate) const MAX_PENDING_TCP_PACKETS: usize = 128;

pub type OnRecvHdlrFn = Box<
    dyn (FnMut(Bytes) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;

#[derive(Default)]
pub(crate) struct UfragPwd {
    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: String,
    pub(crate) remote_pwd: String,
}

/// One media/data stream under the agent; independent ICE state.
pub struct Stream {
    pub(crate) id: u32,
    pub(crate) components: Vec<Arc<Component>>,

    pub(crate) ufrag_pwd: Mutex<UfragPwd>,
    pub(crate) gathering_state: AtomicU8,

    /// Ordered candidate pairs undergoing connectivity checks.
    pub(crate) checklist: Mutex<Vec<Arc<CandidatePair>>>,
    /// Pairs that must be checked ahead of the ordinary schedule because an
    /// inbound request touched them.
    pub(crate) triggered_queue: Mutex<VecDeque<Arc<CandidatePair>>>,
    pub(crate) check_timer: SyncMutex<Option<TimerId>>,
    pub(crate) keepalive_timer: SyncMutex<Option<TimerId>>,

    pub(crate) tos: AtomicU8,
    pub(crate) initial_binding_request_seen: AtomicBool,
}

impl Stream {
    pub(crate) fn new(id: u32, n_components: u16) -> Self {
        let components = (1..=n_components)
            .map(|component_id| Arc::new(Component::new(id, component_id)))
            .collect();

        Self {
            id,
            components,
            ufrag_pwd: Mutex::new(UfragPwd {
                local_ufrag: generate_ufrag(),
                local_pwd: generate_pwd(),
                remote_ufrag: String::new(),
                remote_pwd: String::new(),
            }),
            gathering_state: AtomicU8::new(GatheringState::New as u8),
            checklist: Mutex::new(vec![]),
            triggered_queue: Mutex::new(VecDeque::new()),
            check_timer: SyncMutex::new(None),
            keepalive_timer: SyncMutex::new(None),
            tos: AtomicU8::new(0),
            initial_binding_request_seen: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn component(&self, component_id: u16) -> Result<&Arc<Component>> {
        self.components
            .get(component_id.wrapping_sub(1) as usize)
            .ok_or(Error::ErrUnknownComponent)
    }

    pub fn gathering_state(&self) -> GatheringState {
        GatheringState::from(self.gathering_state.load(Ordering::SeqCst))
    }

    /// New credentials for a restart. Remote credentials are forgotten; the
    /// peer signals fresh ones.
    pub(crate) async fn regenerate_credentials(&self) {
        let mut ufrag_pwd = self.ufrag_pwd.lock().await;
        ufrag_pwd.local_ufrag = generate_ufrag();
        ufrag_pwd.local_pwd = generate_pwd();
        ufrag_pwd.remote_ufrag = String::new();
        ufrag_pwd.remote_pwd = String::new();
    }
}

/// One transport channel within a stream.
pub struct Component {
    pub(crate) stream_id: u32,
    pub(crate) id: u16,

    pub(crate) state: AtomicU8,

    pub(crate) local_candidates: Mutex<Vec<Arc<dyn Candidate + Send + Sync>>>,
    pub(crate) remote_candidates: Mutex<Vec<Arc<dyn Candidate + Send + Sync>>>,

    pub(crate) selected_pair: ArcSwapOption<CandidatePair>,

    pub(crate) pending_tcp_packets: Mutex<VecDeque<Bytes>>,
    pub(crate) ptcp: Mutex<Option<PseudoTcp>>,
    pub(crate) tcp_clock: SyncMutex<Option<TimerId>>,

    pub(crate) on_recv: ArcSwapOption<Mutex<OnRecvHdlrFn>>,

    pub(crate) port_min: AtomicU16,
    pub(crate) port_max: AtomicU16,
}

impl Component {
    pub(crate) fn new(stream_id: u32, id: u16) -> Self {
        Self {
            stream_id,
            id,
            state: AtomicU8::new(ComponentState::Disconnected as u8),
            local_candidates: Mutex::new(vec![]),
            remote_candidates: Mutex::new(vec![]),
            selected_pair: ArcSwapOption::empty(),
            pending_tcp_packets: Mutex::new(VecDeque::new()),
            ptcp: Mutex::new(None),
            tcp_clock: SyncMutex::new(None),
            on_recv: ArcSwapOption::empty(),
            port_min: AtomicU16::new(0),
            port_max: AtomicU16::new(0),
        }
    }

    pub fn state(&self) -> ComponentState {
        ComponentState::from(self.state.load(Ordering::SeqCst))
    }

    /// Moves the component forward. Backwards transitions are rejected so
    /// the lifecycle stays monotone; `Failed` is always reachable. Returns
    /// whether the state actually changed.
    pub(crate) fn advance_state(&self, new_state: ComponentState) -> bool {
        let current = self.state();
        if new_state == ComponentState::Failed {
            if current == ComponentState::Failed {
                return false;
            }
            self.state.store(new_state as u8, Ordering::SeqCst);
            return true;
        }

        if new_state <= current || current == ComponentState::Failed {
            return false;
        }
        self.state.store(new_state as u8, Ordering::SeqCst);
        true
    }

    /// Restart path: force the component back to `Connecting` regardless of
    /// where it was.
    pub(crate) fn reset_state(&self, new_state: ComponentState) {
        self.state.store(new_state as u8, Ordering::SeqCst);
    }

    /// Adds a local candidate, enforcing unique priorities within the
    /// component. Returns an error for a redundant candidate.
    pub(crate) async fn add_local_candidate(
        &self,
        candidate: &Arc<dyn Candidate + Send + Sync>,
    ) -> Result<()> {
        let mut local_candidates = self.local_candidates.lock().await;
        for cand in &*local_candidates {
            if cand.equal(&**candidate) {
                return Err(Error::ErrRedundantCandidate);
            }
        }

        loop {
            let priority = candidate.priority();
            let collision = local_candidates
                .iter()
                .any(|cand| cand.priority() == priority);
            if !collision {
                break;
            }
            candidate.set_priority(priority - 1);
        }

        local_candidates.push(Arc::clone(candidate));
        Ok(())
    }

    /// Adds a remote candidate unless it is already known.
    pub(crate) async fn add_remote_candidate(
        &self,
        candidate: &Arc<dyn Candidate + Send + Sync>,
    ) -> bool {
        let mut remote_candidates = self.remote_candidates.lock().await;
        for cand in &*remote_candidates {
            if cand.equal(&**candidate) {
                return false;
            }
        }
        remote_candidates.push(Arc::clone(candidate));
        true
    }

    pub(crate) async fn find_local_candidate(
        &self,
        addr: SocketAddr,
    ) -> Option<Arc<dyn Candidate + Send + Sync>> {
        let local_candidates = self.local_candidates.lock().await;
        local_candidates
            .iter()
            .find(|c| c.addr() == addr || c.base_addr() == addr)
            .cloned()
    }

    pub(crate) async fn find_remote_candidate(
        &self,
        addr: SocketAddr,
    ) -> Option<Arc<dyn Candidate + Send + Sync>> {
        let remote_candidates = self.remote_candidates.lock().await;
        remote_candidates
            .iter()
            .find(|c| c.addr().ip() == addr.ip() && c.port() == addr.port())
            .cloned()
    }

    pub(crate) fn selected_pair(&self) -> Option<Arc<CandidatePair>> {
        self.selected_pair.load().clone()
    }

    /// Queues an early non-STUN datagram for replay once a pair exists.
    pub(crate) async fn enqueue_pending_tcp(&self, packet: Bytes) {
        let mut pending = self.pending_tcp_packets.lock().await;
        if pending.len() >= MAX_PENDING_TCP_PACKETS {
            log::debug!(
                "[{}/{}]: pending packet queue full, dropping oldest",
                self.stream_id,
                self.id
            );
            pending.pop_front();
        }
        pending.push_back(packet);
    }

    pub(crate) async fn drain_pending_tcp(&self) -> Vec<Bytes> {
        let mut pending = self.pending_tcp_packets.lock().await;
        pending.drain(..).collect()
    }

    /// Closes every candidate socket of the component.
    pub(crate) async fn close_candidates(&self) {
        let mut local_candidates = self.local_candidates.lock().await;
        for candidate in local_candidates.iter() {
            if let Err(err) = candidate.close().await {
                log::warn!(
                    "[{}/{}]: failed to close candidate {}: {}",
                    self.stream_id,
                    self.id,
                    candidate,
                    err
                );
            }
        }
        local_candidates.clear();

        let mut remote_candidates = self.remote_candidates.lock().await;
        remote_candidates.clear();
    }
}
