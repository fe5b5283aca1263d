#[cfg(test)]
mod agent_check_test;
#[cfg(test)]
mod agent_test;

pub mod agent_check;
pub mod agent_config;
pub mod agent_gather;
pub(crate) mod agent_internal;
pub mod agent_transport;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use util::sync::Mutex as SyncMutex;

use agent_config::AgentConfig;
use agent_internal::AgentInternal;

use crate::candidate::exchange::{encode_exchange_line, ExchangeLine};
use crate::candidate::*;
use crate::control::Role;
use crate::error::*;
use crate::event::Event;
use crate::state::ComponentState;
use crate::stream::OnRecvHdlrFn;

/// The per-process ICE engine instance.
///
/// All public operations are non-blocking; long-running protocol work
/// happens on timers and socket read loops owned by the agent. Lifecycle
/// notifications arrive on the event channel obtained from
/// [`Agent::take_event_receiver`].
pub struct Agent {
    pub(crate) internal: Arc<AgentInternal>,
    event_rx: SyncMutex<Option<mpsc::Receiver<Event>>>,
}

impl Agent {
    /// Creates a new Agent.
    pub async fn new(config: AgentConfig) -> Result<Agent> {
        let (internal, event_rx) = AgentInternal::new(config);
        Ok(Agent {
            internal: Arc::new(internal),
            event_rx: SyncMutex::new(Some(event_rx)),
        })
    }

    /// Takes the receiving half of the event channel. The first caller gets
    /// it; events posted with nobody listening are dropped.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.event_rx.lock().take()
    }

    /// The agent's current role; this can change through conflict
    /// resolution.
    pub fn role(&self) -> Role {
        self.internal.role()
    }

    pub fn tie_breaker(&self) -> u64 {
        self.internal.tie_breaker.load(Ordering::SeqCst)
    }

    /// Allocates a stream with `n_components` components and returns its id.
    pub async fn add_stream(&self, n_components: u16) -> Result<u32> {
        self.internal.ensure_open()?;
        if n_components == 0 {
            return Err(Error::ErrUnknownComponent);
        }
        Ok(self.internal.add_stream(n_components).await)
    }

    /// Removes a stream, cancelling its checks, discovery, timers and
    /// reliable transports.
    pub async fn remove_stream(&self, stream_id: u32) -> Result<()> {
        self.internal.ensure_open()?;
        self.internal.remove_stream(stream_id).await
    }

    /// Restricts the local ports a component's host candidates may bind.
    /// Must be called before `gather_candidates`.
    pub async fn set_port_range(
        &self,
        stream_id: u32,
        component_id: u16,
        port_min: u16,
        port_max: u16,
    ) -> Result<()> {
        self.internal.ensure_open()?;
        if port_min > port_max && port_max != 0 {
            return Err(Error::ErrPort);
        }
        let stream = self.internal.find_stream(stream_id).await?;
        let component = stream.component(component_id)?;
        component.port_min.store(port_min, Ordering::SeqCst);
        component.port_max.store(port_max, Ordering::SeqCst);
        Ok(())
    }

    /// Starts candidate gathering for the stream. Calling it again is a
    /// no-op.
    pub async fn gather_candidates(&self, stream_id: u32) -> Result<()> {
        self.internal.ensure_open()?;
        let stream = self.internal.find_stream(stream_id).await?;
        self.internal.gather_candidates(&stream).await
    }

    /// Returns the local candidates of a component.
    pub async fn get_local_candidates(
        &self,
        stream_id: u32,
        component_id: u16,
    ) -> Result<Vec<Arc<dyn Candidate + Send + Sync>>> {
        let stream = self.internal.find_stream(stream_id).await?;
        let component = stream.component(component_id)?;
        let local_candidates = component.local_candidates.lock().await;
        Ok(local_candidates.clone())
    }

    /// Returns the stream's local (ufrag, pwd).
    pub async fn get_local_credentials(&self, stream_id: u32) -> Result<(String, String)> {
        let stream = self.internal.find_stream(stream_id).await?;
        let ufrag_pwd = stream.ufrag_pwd.lock().await;
        Ok((ufrag_pwd.local_ufrag.clone(), ufrag_pwd.local_pwd.clone()))
    }

    /// Sets the credentials of the remote agent.
    pub async fn set_remote_credentials(
        &self,
        stream_id: u32,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<()> {
        self.internal.ensure_open()?;
        if remote_ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        }
        if remote_pwd.is_empty() {
            return Err(Error::ErrRemotePwdEmpty);
        }

        let stream = self.internal.find_stream(stream_id).await?;
        {
            let mut ufrag_pwd = stream.ufrag_pwd.lock().await;
            ufrag_pwd.remote_ufrag = remote_ufrag;
            ufrag_pwd.remote_pwd = remote_pwd;
        }

        self.internal.start_checks(&stream).await;
        Ok(())
    }

    /// Feeds remote candidates to a component and (re)builds the check
    /// list.
    pub async fn set_remote_candidates(
        &self,
        stream_id: u32,
        component_id: u16,
        candidates: Vec<Arc<dyn Candidate + Send + Sync>>,
    ) -> Result<()> {
        self.internal.ensure_open()?;
        let stream = self.internal.find_stream(stream_id).await?;
        let component = Arc::clone(stream.component(component_id)?);

        for candidate in &candidates {
            self.internal
                .add_remote_candidate(&stream, &component, candidate)
                .await;
        }

        self.internal.build_check_list(&stream).await;
        self.internal.start_checks(&stream).await;
        Ok(())
    }

    /// Renders the stream's bootstrap line:
    /// `ufrag pwd <foundation,priority,ip,port,type>...`.
    pub async fn local_exchange_line(&self, stream_id: u32, component_id: u16) -> Result<String> {
        let (ufrag, pwd) = self.get_local_credentials(stream_id).await?;
        let candidates = self.get_local_candidates(stream_id, component_id).await?;
        Ok(encode_exchange_line(&ufrag, &pwd, &candidates))
    }

    /// Applies a peer's bootstrap line to a component: credentials plus
    /// remote candidates.
    pub async fn apply_remote_exchange_line(
        &self,
        stream_id: u32,
        component_id: u16,
        line: &str,
    ) -> Result<()> {
        let parsed = ExchangeLine::parse(line)?;

        let mut candidates: Vec<Arc<dyn Candidate + Send + Sync>> = vec![];
        for candidate in parsed.candidates {
            candidates.push(Arc::new(candidate.into_candidate(component_id)?));
        }

        self.set_remote_credentials(stream_id, parsed.ufrag, parsed.pwd)
            .await?;
        self.set_remote_candidates(stream_id, component_id, candidates)
            .await
    }

    /// Sends application data on a component. Reliable mode feeds the
    /// pseudo-TCP stream; otherwise the datagram goes straight to the
    /// selected pair. Returns the bytes accepted or `ErrWouldBlock`.
    pub async fn send(&self, stream_id: u32, component_id: u16, buf: &[u8]) -> Result<usize> {
        self.internal.send_data(stream_id, component_id, buf).await
    }

    /// Attaches (or clears) the receive callback of a component. Reliable
    /// bytes buffered before the attach are delivered immediately.
    pub async fn attach_recv(
        &self,
        stream_id: u32,
        component_id: u16,
        handler: Option<OnRecvHdlrFn>,
    ) -> Result<()> {
        let stream = self.internal.find_stream(stream_id).await?;
        let component = Arc::clone(stream.component(component_id)?);

        match handler {
            Some(f) => component
                .on_recv
                .store(Some(Arc::new(tokio::sync::Mutex::new(f)))),
            None => component.on_recv.store(None),
        }

        if self.internal.reliable {
            self.internal.drive_ptcp(&stream, &component).await;
        }
        Ok(())
    }

    /// Returns the selected pair of a component, when nominated.
    pub async fn get_selected_pair(
        &self,
        stream_id: u32,
        component_id: u16,
    ) -> Result<Option<Arc<CandidatePair>>> {
        let stream = self.internal.find_stream(stream_id).await?;
        let component = stream.component(component_id)?;
        Ok(component.selected_pair())
    }

    /// Forces the selection of a pair by candidate foundations, bypassing
    /// the nomination process.
    pub async fn set_selected_pair(
        &self,
        stream_id: u32,
        component_id: u16,
        local_foundation: &str,
        remote_foundation: &str,
    ) -> Result<()> {
        self.internal.ensure_open()?;
        let stream = self.internal.find_stream(stream_id).await?;
        let component = Arc::clone(stream.component(component_id)?);

        let local = {
            let local_candidates = component.local_candidates.lock().await;
            local_candidates
                .iter()
                .find(|c| c.foundation() == local_foundation)
                .cloned()
                .ok_or(Error::ErrInvalidHandle)?
        };
        let remote = {
            let remote_candidates = component.remote_candidates.lock().await;
            remote_candidates
                .iter()
                .find(|c| c.foundation() == remote_foundation)
                .cloned()
                .ok_or(Error::ErrInvalidHandle)?
        };

        self.force_select(&stream, &component, local, remote).await
    }

    /// Forces the remote side of the selection; the best local candidate is
    /// paired with it.
    pub async fn set_selected_remote_candidate(
        &self,
        stream_id: u32,
        component_id: u16,
        remote: Arc<dyn Candidate + Send + Sync>,
    ) -> Result<()> {
        self.internal.ensure_open()?;
        let stream = self.internal.find_stream(stream_id).await?;
        let component = Arc::clone(stream.component(component_id)?);

        self.internal
            .add_remote_candidate(&stream, &component, &remote)
            .await;

        let local = {
            let local_candidates = component.local_candidates.lock().await;
            local_candidates
                .iter()
                .filter(|c| c.get_conn().is_some())
                .max_by_key(|c| c.priority())
                .cloned()
                .ok_or(Error::ErrInvalidHandle)?
        };

        self.force_select(&stream, &component, local, remote).await
    }

    async fn force_select(
        &self,
        stream: &Arc<crate::stream::Stream>,
        component: &Arc<crate::stream::Component>,
        local: Arc<dyn Candidate + Send + Sync>,
        remote: Arc<dyn Candidate + Send + Sync>,
    ) -> Result<()> {
        let controlling = self.internal.is_controlling.load(Ordering::SeqCst);
        let pair = {
            let mut checklist = stream.checklist.lock().await;
            if let Some(pair) = checklist
                .iter()
                .find(|p| p.local.equal(&*local) && p.remote.equal(&*remote))
            {
                Arc::clone(pair)
            } else {
                let pair = Arc::new(CandidatePair::new(local, remote, controlling));
                checklist.push(Arc::clone(&pair));
                pair
            }
        };

        pair.set_state(CandidatePairState::Succeeded);
        self.internal
            .set_selected_pair(stream, component, pair)
            .await;
        Ok(())
    }

    /// Drops relayed candidates (and their TURN allocations) for a
    /// component.
    pub async fn forget_relays(&self, stream_id: u32, component_id: u16) -> Result<()> {
        self.internal.ensure_open()?;
        let stream = self.internal.find_stream(stream_id).await?;
        let component = Arc::clone(stream.component(component_id)?);
        self.internal.forget_relays(&stream, &component).await
    }

    /// Restarts every stream of the agent.
    pub async fn restart(&self) -> Result<()> {
        self.internal.ensure_open()?;
        let streams = {
            let streams = self.internal.streams.lock().await;
            streams.clone()
        };
        for stream in streams {
            self.restart_stream_internal(&stream).await?;
        }
        Ok(())
    }

    /// Restarts one stream: fresh credentials, cleared remote state, and a
    /// new check cycle once the peer signals again. Local candidates and
    /// their sockets survive.
    pub async fn restart_stream(&self, stream_id: u32) -> Result<()> {
        self.internal.ensure_open()?;
        let stream = self.internal.find_stream(stream_id).await?;
        self.restart_stream_internal(&stream).await
    }

    async fn restart_stream_internal(&self, stream: &Arc<crate::stream::Stream>) -> Result<()> {
        if stream.gathering_state() == crate::state::GatheringState::Gathering {
            return Err(Error::ErrRestartWhenGathering);
        }

        let check_timer = { *stream.check_timer.lock() };
        if let Some(id) = check_timer {
            self.internal.wheel.stop(id);
        }

        {
            let mut checklist = stream.checklist.lock().await;
            for pair in checklist.iter() {
                let mut transaction = pair.transaction.lock();
                *transaction = None;
            }
            checklist.clear();
        }
        {
            let mut triggered = stream.triggered_queue.lock().await;
            triggered.clear();
        }

        stream.regenerate_credentials().await;
        stream
            .initial_binding_request_seen
            .store(false, Ordering::SeqCst);

        for component in &stream.components {
            component.selected_pair.store(None);
            {
                let mut remote_candidates = component.remote_candidates.lock().await;
                remote_candidates.clear();
            }
            component.reset_state(ComponentState::Connecting);
            self.internal
                .events
                .post(Event::ComponentStateChanged {
                    stream_id: stream.id,
                    component_id: component.id,
                    state: ComponentState::Connecting,
                })
                .await;
        }

        Ok(())
    }

    /// Stores the type-of-service byte applied to the stream's sockets.
    pub async fn set_stream_tos(&self, stream_id: u32, tos: u8) -> Result<()> {
        self.internal.ensure_open()?;
        let stream = self.internal.find_stream(stream_id).await?;
        stream.tos.store(tos, Ordering::SeqCst);
        // The socket abstraction has no TOS control; the value still shapes
        // candidates created after this call on platforms that grow one.
        log::debug!("stream {} TOS set to {:#04x}", stream_id, tos);
        Ok(())
    }

    /// Cleans up the Agent.
    pub async fn close(&self) -> Result<()> {
        self.internal.close().await
    }
}
