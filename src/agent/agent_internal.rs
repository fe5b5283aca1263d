use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{Duration, Instant};
use util::vnet::net::*;

use super::agent_config::*;
use crate::candidate::*;
use crate::control::Role;
use crate::error::*;
use crate::event::{Event, EventSender};
use crate::network_type::NetworkType;
use crate::ptcp::PtcpConfig;
use crate::rand::generate_tie_breaker;
use crate::state::ComponentState;
use crate::stream::{Component, Stream};
use crate::timer::TimerWheel;
use crate::url::Url;

/// The shared, lock-protected center of the agent. All protocol state
/// transitions run through methods on this type while holding its locks;
/// only events leave through the channel to run off-lock.
pub struct AgentInternal {
    pub(crate) streams: Mutex<Vec<Arc<Stream>>>,
    pub(crate) next_stream_id: AtomicU32,

    pub(crate) wheel: Arc<TimerWheel>,
    pub(crate) events: EventSender,

    pub(crate) is_controlling: AtomicBool,
    pub(crate) tie_breaker: AtomicU64,

    pub(crate) reliable: bool,
    pub(crate) ptcp_config: PtcpConfig,

    pub(crate) net: Arc<Net>,
    pub(crate) urls: Vec<Url>,

    pub(crate) ta: Duration,
    pub(crate) max_connectivity_checks: usize,
    pub(crate) max_binding_requests: u16,
    pub(crate) keepalive_interval: Duration,

    pub(crate) network_types: Vec<NetworkType>,
    pub(crate) interface_filter: Arc<Option<InterfaceFilterFn>>,
    pub(crate) ip_filter: Arc<Option<IpFilterFn>>,
    pub(crate) include_loopback: bool,

    /// Shared TURN server entries; candidates discovered through the same
    /// server hold the same `Arc`, whose strong count is the reference
    /// count.
    pub(crate) turn_servers: Mutex<Vec<Arc<crate::candidate::candidate_relay::TurnServer>>>,

    pub(crate) start_time: Instant,
    pub(crate) done: AtomicBool,
}

impl AgentInternal {
    pub(crate) fn new(config: AgentConfig) -> (Self, mpsc::Receiver<Event>) {
        let (events, event_rx) = EventSender::new();

        let net = if let Some(net) = &config.net {
            if net.is_virtual() {
                log::warn!("vnet is enabled");
            }
            Arc::clone(net)
        } else {
            Arc::new(Net::new(None))
        };

        let ai = AgentInternal {
            streams: Mutex::new(vec![]),
            next_stream_id: AtomicU32::new(1),

            wheel: TimerWheel::new(),
            events,

            is_controlling: AtomicBool::new(config.is_controlling),
            tie_breaker: AtomicU64::new(generate_tie_breaker()),

            reliable: config.reliable,
            ptcp_config: config.ptcp.clone(),

            net,

            ta: config.ta(),
            max_connectivity_checks: config.max_connectivity_checks(),
            max_binding_requests: config.max_binding_requests(),
            keepalive_interval: config.keepalive_interval(),

            network_types: config.network_types(),
            interface_filter: Arc::clone(&config.interface_filter),
            ip_filter: Arc::clone(&config.ip_filter),
            include_loopback: config.include_loopback,

            turn_servers: Mutex::new(vec![]),

            start_time: Instant::now(),
            done: AtomicBool::new(false),

            urls: config.urls,
        };

        (ai, event_rx)
    }

    pub(crate) fn get_name(&self) -> &str {
        if self.is_controlling.load(Ordering::SeqCst) {
            "controlling"
        } else {
            "controlled"
        }
    }

    pub(crate) fn role(&self) -> Role {
        if self.is_controlling.load(Ordering::SeqCst) {
            Role::Controlling
        } else {
            Role::Controlled
        }
    }

    /// Milliseconds of monotonic time since agent creation; the pseudo-TCP
    /// clock domain.
    pub(crate) fn now_ms(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.start_time)
            .as_millis() as u64
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.done.load(Ordering::SeqCst) {
            Err(Error::ErrClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) async fn find_stream(&self, stream_id: u32) -> Result<Arc<Stream>> {
        let streams = self.streams.lock().await;
        streams
            .iter()
            .find(|s| s.id == stream_id)
            .cloned()
            .ok_or(Error::ErrUnknownStream)
    }

    pub(crate) async fn add_stream(&self, n_components: u16) -> u32 {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let stream = Arc::new(Stream::new(id, n_components));
        let mut streams = self.streams.lock().await;
        streams.push(stream);
        id
    }

    /// Tears down everything tied to a stream: timers, checks, sockets and
    /// the reliable transport. In-flight STUN transactions are abandoned;
    /// their responses will miss on transaction id.
    pub(crate) async fn remove_stream(self: &Arc<Self>, stream_id: u32) -> Result<()> {
        let stream = {
            let mut streams = self.streams.lock().await;
            let index = streams
                .iter()
                .position(|s| s.id == stream_id)
                .ok_or(Error::ErrUnknownStream)?;
            streams.remove(index)
        };

        self.stop_stream_timers(&stream);

        {
            let mut checklist = stream.checklist.lock().await;
            checklist.clear();
        }
        {
            let mut triggered = stream.triggered_queue.lock().await;
            triggered.clear();
        }

        for component in &stream.components {
            self.teardown_ptcp(component, true).await;
            component.selected_pair.store(None);
            component.close_candidates().await;
        }

        // TURN servers whose last candidate just went away are released.
        {
            let mut turn_servers = self.turn_servers.lock().await;
            turn_servers.retain(|server| Arc::strong_count(server) > 1);
        }

        Ok(())
    }

    pub(crate) fn stop_stream_timers(&self, stream: &Arc<Stream>) {
        let check_timer = { stream.check_timer.lock().take() };
        if let Some(id) = check_timer {
            self.wheel.unregister(id);
        }
        let keepalive_timer = { stream.keepalive_timer.lock().take() };
        if let Some(id) = keepalive_timer {
            self.wheel.unregister(id);
        }
        for component in &stream.components {
            let tcp_clock = { component.tcp_clock.lock().take() };
            if let Some(id) = tcp_clock {
                self.wheel.unregister(id);
            }
        }
    }

    /// Moves a component forward and publishes the transition.
    pub(crate) async fn set_component_state(
        &self,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        state: ComponentState,
    ) {
        if component.advance_state(state) {
            log::info!(
                "[{}]: component {}/{} state changed to {}",
                self.get_name(),
                stream.id,
                component.id,
                state
            );
            self.events
                .post(Event::ComponentStateChanged {
                    stream_id: stream.id,
                    component_id: component.id,
                    state,
                })
                .await;
        }
    }

    /// Registers a freshly gathered local candidate: inserts it with a
    /// unique priority, announces it, and starts its read loop when it owns
    /// a socket of its own.
    pub(crate) async fn add_local_candidate(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        candidate: Arc<dyn Candidate + Send + Sync>,
        owns_socket: bool,
    ) -> Result<()> {
        component.add_local_candidate(&candidate).await?;

        self.events
            .post(Event::NewCandidate {
                stream_id: stream.id,
                component_id: component.id,
                foundation: candidate.foundation(),
            })
            .await;
        self.events
            .post(Event::NewCandidateFull {
                candidate: Arc::clone(&candidate),
            })
            .await;

        if owns_socket {
            self.start_candidate_io(stream, component, &candidate);
        }

        Ok(())
    }

    /// Registers a remote candidate (signalled or peer-reflexive) and
    /// announces it. Returns false for a duplicate.
    pub(crate) async fn add_remote_candidate(
        &self,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        candidate: &Arc<dyn Candidate + Send + Sync>,
    ) -> bool {
        if !component.add_remote_candidate(candidate).await {
            return false;
        }

        self.events
            .post(Event::NewRemoteCandidate {
                stream_id: stream.id,
                component_id: component.id,
                foundation: candidate.foundation(),
            })
            .await;
        true
    }

    /// Spawns the datagram read loop for a candidate-owned socket.
    pub(crate) fn start_candidate_io(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        candidate: &Arc<dyn Candidate + Send + Sync>,
    ) {
        let conn = match candidate.get_conn() {
            Some(conn) => Arc::clone(conn),
            None => {
                log::error!("[{}]: candidate without socket", self.get_name());
                return;
            }
        };

        let (closed_ch_tx, mut closed_ch_rx) = broadcast::channel(1);
        let closed_ch = candidate.get_closed_ch();
        let weak = Arc::downgrade(self);
        let stream = Arc::clone(stream);
        let component = Arc::clone(component);
        let candidate = Arc::clone(candidate);

        tokio::spawn(async move {
            {
                let mut closed = closed_ch.lock().await;
                *closed = Some(closed_ch_tx);
            }

            let mut buffer = vec![0_u8; RECEIVE_MTU];
            loop {
                let (n, src_addr) = tokio::select! {
                    result = conn.recv_from(&mut buffer) => match result {
                        Ok((n, src)) => (n, src),
                        Err(err) => {
                            log::debug!("read loop exited: {err}");
                            return;
                        }
                    },
                    _ = closed_ch_rx.recv() => return,
                };

                let ai = match Weak::upgrade(&weak) {
                    Some(ai) => ai,
                    None => return,
                };
                ai.handle_inbound_candidate_msg(
                    &stream,
                    &component,
                    &candidate,
                    &buffer[..n],
                    src_addr,
                )
                .await;
            }
        });
    }

    /// Classifies one received datagram: STUN goes to the check engine,
    /// everything else is data.
    pub(crate) async fn handle_inbound_candidate_msg(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        local: &Arc<dyn Candidate + Send + Sync>,
        buf: &[u8],
        src_addr: std::net::SocketAddr,
    ) {
        if self.done.load(Ordering::SeqCst) {
            return;
        }

        if stun::message::is_message(buf) {
            let mut m = Message {
                raw: vec![],
                ..Message::default()
            };
            // Explicitly copy raw buffer so Message can own the memory.
            m.raw.extend_from_slice(buf);

            if let Err(err) = m.decode() {
                log::warn!(
                    "[{}]: failed to decode inbound STUN from {}: {}",
                    self.get_name(),
                    src_addr,
                    err
                );
                return;
            }
            self.handle_inbound_stun(&mut m, stream, component, local, src_addr)
                .await;
        } else {
            self.handle_inbound_data(stream, component, buf, src_addr)
                .await;
        }
    }

    pub(crate) async fn handle_inbound_stun(
        self: &Arc<Self>,
        m: &mut Message,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        local: &Arc<dyn Candidate + Send + Sync>,
        remote_addr: std::net::SocketAddr,
    ) {
        if m.typ.method != METHOD_BINDING {
            log::trace!(
                "[{}]: unhandled STUN method from {}: {}",
                self.get_name(),
                remote_addr,
                m.typ
            );
            return;
        }

        match m.typ.class {
            CLASS_REQUEST => {
                self.handle_binding_request(m, stream, component, local, remote_addr)
                    .await;
            }
            CLASS_SUCCESS_RESPONSE => {
                self.handle_success_response(m, stream, component, local, remote_addr)
                    .await;
            }
            CLASS_ERROR_RESPONSE => {
                self.handle_error_response(m, stream, component, remote_addr)
                    .await;
            }
            _ => {
                log::trace!(
                    "[{}]: unhandled STUN class from {}: {}",
                    self.get_name(),
                    remote_addr,
                    m.typ
                );
            }
        }
    }

    pub(crate) async fn send_stun(
        &self,
        msg: &Message,
        local: &Arc<dyn Candidate + Send + Sync>,
        remote: &Arc<dyn Candidate + Send + Sync>,
    ) {
        if let Err(err) = local.write_to(&msg.raw, &**remote).await {
            log::trace!(
                "[{}]: failed to send STUN message: {}",
                self.get_name(),
                err
            );
        }
    }

    /// Builds the success response for an inbound check and sends it back to
    /// the source.
    pub(crate) async fn send_binding_success(
        &self,
        m: &Message,
        stream: &Arc<Stream>,
        local: &Arc<dyn Candidate + Send + Sync>,
        remote: &Arc<dyn Candidate + Send + Sync>,
    ) {
        let addr = remote.addr();
        let (ip, port) = (addr.ip(), addr.port());
        let local_pwd = {
            let ufrag_pwd = stream.ufrag_pwd.lock().await;
            ufrag_pwd.local_pwd.clone()
        };

        let (out, result) = {
            let mut out = Message::new();
            let result = out.build(&[
                Box::new(m.clone()),
                Box::new(BINDING_SUCCESS),
                Box::new(XorMappedAddress { ip, port }),
                Box::new(MessageIntegrity::new_short_term_integrity(local_pwd)),
                Box::new(FINGERPRINT),
            ]);
            (out, result)
        };

        if let Err(err) = result {
            log::warn!(
                "[{}]: failed to build success response for {}: {}",
                self.get_name(),
                remote,
                err
            );
        } else {
            self.send_stun(&out, local, remote).await;
        }
    }

    /// Replies to an inbound request with an ERROR-CODE response.
    pub(crate) async fn send_binding_error(
        &self,
        m: &Message,
        stream: &Arc<Stream>,
        local: &Arc<dyn Candidate + Send + Sync>,
        remote: &Arc<dyn Candidate + Send + Sync>,
        code: stun::error_code::ErrorCode,
    ) {
        let local_pwd = {
            let ufrag_pwd = stream.ufrag_pwd.lock().await;
            ufrag_pwd.local_pwd.clone()
        };

        let (out, result) = {
            let mut out = Message::new();
            let result = out.build(&[
                Box::new(m.clone()),
                Box::new(BINDING_ERROR),
                Box::new(stun::error_code::ErrorCodeAttribute {
                    code,
                    reason: vec![],
                }),
                Box::new(MessageIntegrity::new_short_term_integrity(local_pwd)),
                Box::new(FINGERPRINT),
            ]);
            (out, result)
        };

        if let Err(err) = result {
            log::warn!(
                "[{}]: failed to build error response: {}",
                self.get_name(),
                err
            );
        } else {
            self.send_stun(&out, local, remote).await;
        }
    }

    /// Nominates a pair: updates the component's selection, publishes the
    /// transition, cancels the remaining checks, and brings up the reliable
    /// transport the first time around.
    pub(crate) async fn set_selected_pair(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        pair: Arc<CandidatePair>,
    ) {
        log::trace!(
            "[{}]: set selected candidate pair: {}",
            self.get_name(),
            pair
        );

        pair.nominated.store(true, Ordering::SeqCst);
        component.selected_pair.store(Some(Arc::clone(&pair)));

        self.events
            .post(Event::NewSelectedPair {
                stream_id: stream.id,
                component_id: component.id,
                local_foundation: pair.local.foundation(),
                remote_foundation: pair.remote.foundation(),
            })
            .await;
        self.events
            .post(Event::NewSelectedPairFull {
                stream_id: stream.id,
                component_id: component.id,
                local: Arc::clone(&pair.local),
                remote: Arc::clone(&pair.remote),
            })
            .await;

        self.set_component_state(stream, component, ComponentState::Connected)
            .await;
        self.set_component_state(stream, component, ComponentState::Ready)
            .await;

        // Remaining in-flight checks for this component are moot.
        {
            let checklist = stream.checklist.lock().await;
            for other in checklist.iter() {
                if other.local.component() == component.id
                    && !Arc::ptr_eq(other, &pair)
                    && other.state() == CandidatePairState::InProgress
                {
                    other.set_state(CandidatePairState::Cancelled);
                    let mut transaction = other.transaction.lock();
                    *transaction = None;
                }
            }
        }

        if self.reliable {
            self.ensure_ptcp(stream, component).await;
            self.replay_pending_tcp(stream, component).await;
        }

        self.maybe_stop_checks(stream).await;
    }

    /// Stops the check timer once every component of the stream has a
    /// selected pair.
    pub(crate) async fn maybe_stop_checks(&self, stream: &Arc<Stream>) {
        let all_selected = stream
            .components
            .iter()
            .all(|component| component.selected_pair().is_some());
        if !all_selected {
            return;
        }

        let check_timer = { *stream.check_timer.lock() };
        if let Some(id) = check_timer {
            self.wheel.stop(id);
        }
    }

    pub(crate) async fn close(self: &Arc<Self>) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }

        let stream_ids: Vec<u32> = {
            let streams = self.streams.lock().await;
            streams.iter().map(|s| s.id).collect()
        };
        for stream_id in stream_ids {
            let _ = self.remove_stream(stream_id).await;
        }

        self.wheel.close();
        Ok(())
    }

    /// Registers a repeating wheel timer whose callback reenters the agent
    /// through a weak reference, so a dropped agent silently disarms its
    /// timers.
    pub(crate) fn register_stream_timer<F, Fut>(
        self: &Arc<Self>,
        interval: Duration,
        stream: &Arc<Stream>,
        f: F,
    ) -> crate::timer::TimerId
    where
        F: Fn(Arc<AgentInternal>, Arc<Stream>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let stream = Arc::clone(stream);
        let f = Arc::new(f);
        self.wheel.register(
            interval,
            true,
            Box::new(move || {
                let weak = weak.clone();
                let stream = Arc::clone(&stream);
                let f = Arc::clone(&f);
                Box::pin(async move {
                    if let Some(ai) = Weak::upgrade(&weak) {
                        f(ai, stream).await;
                    }
                })
            }),
        )
    }
}
