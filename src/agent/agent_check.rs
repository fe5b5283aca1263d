use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use stun::agent::TransactionId;
use stun::attributes::{ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_USERNAME};
use stun::error_code::{ErrorCodeAttribute, CODE_BAD_REQUEST, CODE_ROLE_CONFLICT, CODE_UNAUTHORIZED};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;
use tokio::time::Instant;

use super::agent_config::MIN_CHECK_RTO;
use super::agent_internal::AgentInternal;
use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_peer_reflexive::CandidatePeerReflexiveConfig;
use crate::candidate::*;
use crate::control::{AttrControlled, AttrControlling};
use crate::event::Event;
use crate::network_type::UDP;
use crate::priority::PriorityAttr;
use crate::state::ComponentState;
use crate::stream::{Component, Stream};
use crate::use_candidate::UseCandidateAttr;
use crate::util::{assert_inbound_message_integrity, assert_inbound_username_prefix};

impl AgentInternal {
    /// The PRIORITY attribute carries the priority of the peer-reflexive
    /// candidate this host would create from the check.
    pub(crate) fn prflx_priority(&self, component_id: u16) -> u32 {
        (1 << 24) * u32::from(CandidateType::PeerReflexive.preference())
            + (1 << 8) * u32::from(crate::candidate::DEFAULT_LOCAL_PREFERENCE)
            + (256 - u32::from(component_id))
    }

    /// Pairs every local with every compatible remote of the same
    /// component, prunes, sorts, caps, and unfreezes one pair per
    /// foundation. Safe to call again as candidates trickle in.
    pub(crate) async fn build_check_list(self: &Arc<Self>, stream: &Arc<Stream>) {
        let controlling = self.is_controlling.load(Ordering::SeqCst);
        let mut checklist = stream.checklist.lock().await;

        for component in &stream.components {
            let locals = {
                let local_candidates = component.local_candidates.lock().await;
                local_candidates.clone()
            };
            let remotes = {
                let remote_candidates = component.remote_candidates.lock().await;
                remote_candidates.clone()
            };

            for local in &locals {
                // Server-reflexive candidates are pruned to their base: the
                // checks go out of the host socket they share.
                if local.candidate_type() == CandidateType::ServerReflexive
                    || local.candidate_type() == CandidateType::PeerReflexive
                {
                    continue;
                }

                for remote in &remotes {
                    if !local.network_type().is_udp()
                        || !remote.network_type().is_udp()
                        || local.network_type().is_ipv4() != remote.network_type().is_ipv4()
                    {
                        continue;
                    }

                    let exists = checklist
                        .iter()
                        .any(|p| p.local.equal(&**local) && p.remote.equal(&**remote));
                    if exists {
                        continue;
                    }

                    checklist.push(Arc::new(CandidatePair::new(
                        Arc::clone(local),
                        Arc::clone(remote),
                        controlling,
                    )));
                }
            }
        }

        checklist.sort_by(|a, b| pair_ordering(a, b));
        if checklist.len() > self.max_connectivity_checks {
            let dropped = checklist.split_off(self.max_connectivity_checks);
            log::info!(
                "[{}]: check list for stream {} capped, dropping {} pairs",
                self.get_name(),
                stream.id,
                dropped.len()
            );
        }

        // One Waiting pair per foundation; the rest stay frozen until their
        // foundation proves viable.
        let mut active_foundations: HashSet<String> = checklist
            .iter()
            .filter(|p| p.state() != CandidatePairState::Frozen)
            .map(|p| p.foundation())
            .collect();
        for pair in checklist.iter() {
            if pair.state() != CandidatePairState::Frozen {
                continue;
            }
            let foundation = pair.foundation();
            if !active_foundations.contains(&foundation) {
                pair.set_state(CandidatePairState::Waiting);
                active_foundations.insert(foundation);
            }
        }
    }

    /// Arms the per-stream check and keepalive timers once credentials and
    /// pairs are in place.
    pub(crate) async fn start_checks(self: &Arc<Self>, stream: &Arc<Stream>) {
        {
            let ufrag_pwd = stream.ufrag_pwd.lock().await;
            if ufrag_pwd.remote_ufrag.is_empty() || ufrag_pwd.remote_pwd.is_empty() {
                return;
            }
        }
        {
            let checklist = stream.checklist.lock().await;
            if checklist.is_empty() {
                return;
            }
        }

        for component in &stream.components {
            if component.selected_pair().is_none() {
                self.set_component_state(stream, component, ComponentState::Connecting)
                    .await;
            }
        }

        let needs_check_timer = { stream.check_timer.lock().is_none() };
        if needs_check_timer {
            let id = self.register_stream_timer(self.ta, stream, |ai, stream| async move {
                ai.on_check_tick(&stream).await;
            });
            {
                let mut check_timer = stream.check_timer.lock();
                *check_timer = Some(id);
            }
            self.wheel.start(id);
        } else if let Some(id) = { *stream.check_timer.lock() } {
            self.wheel.start(id);
        }

        let needs_keepalive = { stream.keepalive_timer.lock().is_none() };
        if needs_keepalive {
            let id =
                self.register_stream_timer(self.keepalive_interval, stream, |ai, stream| async move {
                    ai.on_keepalive_tick(&stream).await;
                });
            {
                let mut keepalive_timer = stream.keepalive_timer.lock();
                *keepalive_timer = Some(id);
            }
            self.wheel.start(id);
        }
    }

    /// One Ta tick of the pacing loop.
    pub(crate) async fn on_check_tick(self: &Arc<Self>, stream: &Arc<Stream>) {
        if self.done.load(Ordering::SeqCst) {
            return;
        }

        self.retransmit_due(stream).await;

        if self.is_controlling.load(Ordering::SeqCst) {
            self.maybe_nominate(stream).await;
        }

        // Triggered checks jump the queue.
        if let Some(pair) = self.next_triggered(stream).await {
            self.send_check(stream, &pair, false).await;
            return;
        }

        // Highest-priority Waiting pair next.
        let waiting = {
            let checklist = stream.checklist.lock().await;
            checklist
                .iter()
                .find(|p| p.state() == CandidatePairState::Waiting)
                .cloned()
        };
        if let Some(pair) = waiting {
            self.send_check(stream, &pair, false).await;
            return;
        }

        // Unfreeze a foundation with nothing in flight.
        let unfrozen = {
            let checklist = stream.checklist.lock().await;
            let active: HashSet<String> = checklist
                .iter()
                .filter(|p| {
                    matches!(
                        p.state(),
                        CandidatePairState::Waiting | CandidatePairState::InProgress
                    )
                })
                .map(|p| p.foundation())
                .collect();
            checklist
                .iter()
                .find(|p| {
                    p.state() == CandidatePairState::Frozen && !active.contains(&p.foundation())
                })
                .cloned()
        };
        if let Some(pair) = unfrozen {
            pair.set_state(CandidatePairState::Waiting);
            self.send_check(stream, &pair, false).await;
            return;
        }

        self.evaluate_completion(stream).await;
    }

    /// Retransmits due in-flight checks, failing pairs that exhausted their
    /// transmission budget.
    async fn retransmit_due(&self, stream: &Arc<Stream>) {
        let now = Instant::now();
        let mut to_send: Vec<(Arc<CandidatePair>, Vec<u8>)> = vec![];

        {
            let checklist = stream.checklist.lock().await;
            for pair in checklist.iter() {
                let raw = {
                    let mut transaction = pair.transaction.lock();
                    match transaction.as_mut() {
                        Some(txn) if txn.next_rtx <= now => {
                            if txn.attempts >= self.max_binding_requests {
                                *transaction = None;
                                None
                            } else {
                                txn.attempts += 1;
                                txn.rto *= 2;
                                txn.next_rtx = now + txn.rto;
                                Some(txn.raw.clone())
                            }
                        }
                        _ => None,
                    }
                };

                match raw {
                    Some(raw) => to_send.push((Arc::clone(pair), raw)),
                    None => {
                        // Either nothing due, or the budget ran out above.
                        let timed_out = pair.state() == CandidatePairState::InProgress
                            && pair.transaction.lock().is_none()
                            && pair.binding_request_count.load(Ordering::SeqCst)
                                >= self.max_binding_requests;
                        if timed_out {
                            log::trace!(
                                "[{}]: max requests reached for pair {}, marking it as failed",
                                self.get_name(),
                                pair
                            );
                            pair.set_state(CandidatePairState::Failed);
                        }
                    }
                }
            }
        }

        for (pair, raw) in to_send {
            pair.binding_request_count.fetch_add(1, Ordering::SeqCst);
            if let Err(err) = pair.local.write_to(&raw, &*pair.remote).await {
                log::trace!("[{}]: retransmission failed: {}", self.get_name(), err);
            }
        }
    }

    async fn next_triggered(&self, stream: &Arc<Stream>) -> Option<Arc<CandidatePair>> {
        let mut triggered = stream.triggered_queue.lock().await;
        while let Some(pair) = triggered.pop_front() {
            if !pair.state().is_terminal() && !pair.is_nominated() {
                return Some(pair);
            }
        }
        None
    }

    /// Builds and sends one Binding request for the pair, recording the
    /// transaction for retransmission and response matching.
    pub(crate) async fn send_check(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        pair: &Arc<CandidatePair>,
        use_candidate: bool,
    ) {
        let (username, remote_pwd) = {
            let ufrag_pwd = stream.ufrag_pwd.lock().await;
            (
                ufrag_pwd.remote_ufrag.clone() + ":" + ufrag_pwd.local_ufrag.as_str(),
                ufrag_pwd.remote_pwd.clone(),
            )
        };
        if remote_pwd.is_empty() {
            return;
        }

        let controlling = self.is_controlling.load(Ordering::SeqCst);
        let tie_breaker = self.tie_breaker.load(Ordering::SeqCst);

        let mut msg = Message::new();
        {
            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(BINDING_REQUEST),
                Box::new(TransactionId::new()),
                Box::new(Username::new(ATTR_USERNAME, username)),
            ];
            if use_candidate {
                setters.push(Box::<UseCandidateAttr>::default());
            }
            if controlling {
                setters.push(Box::new(AttrControlling(tie_breaker)));
            } else {
                setters.push(Box::new(AttrControlled(tie_breaker)));
            }
            setters.push(Box::new(PriorityAttr(
                self.prflx_priority(pair.local.component()),
            )));
            setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
                remote_pwd,
            )));
            setters.push(Box::new(FINGERPRINT));

            if let Err(err) = msg.build(&setters) {
                log::error!("[{}]: failed to build check: {}", self.get_name(), err);
                return;
            }
        }

        let pair_count = {
            let checklist = stream.checklist.lock().await;
            checklist.len().max(1)
        };
        let rto = std::cmp::max(MIN_CHECK_RTO, self.ta * pair_count as u32);

        pair.ice_role_controlling.store(controlling, Ordering::SeqCst);
        {
            let mut transaction = pair.transaction.lock();
            *transaction = Some(PairTransaction {
                transaction_id: msg.transaction_id,
                raw: msg.raw.clone(),
                attempts: 1,
                next_rtx: Instant::now() + rto,
                rto,
                is_use_candidate: use_candidate,
            });
        }
        pair.binding_request_count.fetch_add(1, Ordering::SeqCst);

        if !use_candidate
            && matches!(
                pair.state(),
                CandidatePairState::Frozen | CandidatePairState::Waiting
            )
        {
            pair.set_state(CandidatePairState::InProgress);
        }

        log::trace!(
            "[{}]: ping STUN from {} to {} (use_candidate: {})",
            self.get_name(),
            pair.local,
            pair.remote,
            use_candidate
        );
        self.send_stun(&msg, &pair.local, &pair.remote).await;
    }

    /// Regular nomination: once a component has a succeeded pair and no
    /// nomination in flight, the controlling side resends the best one with
    /// USE-CANDIDATE.
    async fn maybe_nominate(self: &Arc<Self>, stream: &Arc<Stream>) {
        for component in &stream.components {
            if component.selected_pair().is_some() {
                continue;
            }

            let best = {
                let checklist = stream.checklist.lock().await;

                let nomination_in_flight = checklist.iter().any(|p| {
                    p.local.component() == component.id
                        && p.transaction
                            .lock()
                            .as_ref()
                            .map_or(false, |txn| txn.is_use_candidate)
                });
                if nomination_in_flight {
                    continue;
                }

                checklist
                    .iter()
                    .filter(|p| {
                        p.local.component() == component.id
                            && p.state() == CandidatePairState::Succeeded
                    })
                    .max_by_key(|p| p.priority())
                    .cloned()
            };

            if let Some(pair) = best {
                log::trace!(
                    "[{}]: nominating pair {} for {}/{}",
                    self.get_name(),
                    pair,
                    stream.id,
                    component.id
                );
                self.send_check(stream, &pair, true).await;
            }
        }
    }

    /// Once nothing is scheduled or in flight, the stream has converged:
    /// stop pacing and fail the components that never produced a pair.
    async fn evaluate_completion(self: &Arc<Self>, stream: &Arc<Stream>) {
        let (idle, failed_components) = {
            let checklist = stream.checklist.lock().await;
            if checklist.is_empty() {
                return;
            }

            let busy = checklist.iter().any(|p| {
                matches!(
                    p.state(),
                    CandidatePairState::Frozen
                        | CandidatePairState::Waiting
                        | CandidatePairState::InProgress
                ) || p.transaction.lock().is_some()
            });

            let mut failed = vec![];
            if !busy {
                for component in &stream.components {
                    if component.selected_pair().is_some() {
                        continue;
                    }
                    let pairs: Vec<_> = checklist
                        .iter()
                        .filter(|p| p.local.component() == component.id)
                        .collect();
                    if !pairs.is_empty()
                        && pairs.iter().all(|p| p.state() == CandidatePairState::Failed)
                    {
                        failed.push(Arc::clone(component));
                    }
                }
            }
            (!busy, failed)
        };

        if !idle {
            return;
        }

        let check_timer = { *stream.check_timer.lock() };
        if let Some(id) = check_timer {
            self.wheel.stop(id);
        }

        for component in failed_components {
            self.set_component_state(stream, &component, ComponentState::Failed)
                .await;
        }
    }

    /// Consent-refresh style keepalive on each selected pair.
    pub(crate) async fn on_keepalive_tick(self: &Arc<Self>, stream: &Arc<Stream>) {
        if self.done.load(Ordering::SeqCst) {
            return;
        }

        for component in &stream.components {
            let pair = match component.selected_pair() {
                Some(pair) => pair,
                None => continue,
            };

            let last_sent = std::time::SystemTime::now()
                .duration_since(pair.local.last_sent())
                .unwrap_or_else(|_| std::time::Duration::from_secs(0));
            let last_received = std::time::SystemTime::now()
                .duration_since(pair.remote.last_received())
                .unwrap_or_else(|_| std::time::Duration::from_secs(0));

            if last_received > super::agent_config::DEFAULT_DISCONNECTED_TIMEOUT {
                log::warn!(
                    "[{}]: selected pair on {}/{} silent for {:?}",
                    self.get_name(),
                    stream.id,
                    component.id,
                    last_received
                );
            }

            if last_sent > self.keepalive_interval || last_received > self.keepalive_interval {
                // A request rather than an indication, to refresh consent.
                self.send_check(stream, &pair, false).await;
            }
        }
    }

    /// An inbound Binding request: authenticate, arbitrate roles, learn
    /// peer-reflexive candidates, answer, and schedule the triggered check.
    pub(crate) async fn handle_binding_request(
        self: &Arc<Self>,
        m: &mut Message,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        local: &Arc<dyn Candidate + Send + Sync>,
        remote_addr: SocketAddr,
    ) {
        let (local_ufrag, local_pwd) = {
            let ufrag_pwd = stream.ufrag_pwd.lock().await;
            (ufrag_pwd.local_ufrag.clone(), ufrag_pwd.local_pwd.clone())
        };

        // A pre-validated remote is needed for the error responses below.
        let reply_target: Arc<dyn Candidate + Send + Sync> = match self
            .remote_for_reply(component, remote_addr)
            .await
        {
            Ok(target) => target,
            Err(err) => {
                log::warn!(
                    "[{}]: cannot answer binding request from {}: {}",
                    self.get_name(),
                    remote_addr,
                    err
                );
                return;
            }
        };

        if let Err(err) = assert_inbound_username_prefix(m, &local_ufrag) {
            log::warn!(
                "[{}]: discarding request from {}: {}",
                self.get_name(),
                remote_addr,
                err
            );
            self.send_binding_error(m, stream, local, &reply_target, CODE_UNAUTHORIZED)
                .await;
            return;
        }
        if let Err(err) = assert_inbound_message_integrity(m, local_pwd.as_bytes()) {
            log::warn!(
                "[{}]: integrity failure from {}: {}",
                self.get_name(),
                remote_addr,
                err
            );
            self.send_binding_error(m, stream, local, &reply_target, CODE_UNAUTHORIZED)
                .await;
            return;
        }

        // Role conflict arbitration, RFC 8445 §7.3.1.1.
        let our_tie_breaker = self.tie_breaker.load(Ordering::SeqCst);
        if self.is_controlling.load(Ordering::SeqCst) && m.contains(ATTR_ICE_CONTROLLING) {
            let mut theirs = AttrControlling::default();
            if theirs.get_from(m).is_err() {
                self.send_binding_error(m, stream, local, &reply_target, CODE_BAD_REQUEST)
                    .await;
                return;
            }
            if our_tie_breaker >= theirs.0 {
                self.send_binding_error(m, stream, local, &reply_target, CODE_ROLE_CONFLICT)
                    .await;
                return;
            }
            self.switch_role().await;
        } else if !self.is_controlling.load(Ordering::SeqCst) && m.contains(ATTR_ICE_CONTROLLED) {
            let mut theirs = AttrControlled::default();
            if theirs.get_from(m).is_err() {
                self.send_binding_error(m, stream, local, &reply_target, CODE_BAD_REQUEST)
                    .await;
                return;
            }
            // Mirrored comparison: the controlled side with the larger
            // tie-breaker takes the controlling role, the smaller one
            // answers 487 and stays controlled.
            if our_tie_breaker >= theirs.0 {
                self.switch_role().await;
            } else {
                self.send_binding_error(m, stream, local, &reply_target, CODE_ROLE_CONFLICT)
                    .await;
                return;
            }
        }

        if !stream
            .initial_binding_request_seen
            .swap(true, Ordering::SeqCst)
        {
            self.events
                .post(Event::InitialBindingRequestReceived {
                    stream_id: stream.id,
                })
                .await;
        }

        // An unknown source is a new peer-reflexive remote candidate.
        let remote_candidate = match component.find_remote_candidate(remote_addr).await {
            Some(remote) => remote,
            None => {
                match self
                    .create_peer_reflexive_remote(m, component, remote_addr)
                    .await
                {
                    Ok(prflx) => {
                        log::debug!(
                            "[{}]: adding a new peer-reflexive candidate: {}",
                            self.get_name(),
                            remote_addr
                        );
                        self.add_remote_candidate(stream, component, &prflx).await;
                        prflx
                    }
                    Err(err) => {
                        log::error!(
                            "[{}]: failed to create prflx candidate ({})",
                            self.get_name(),
                            err
                        );
                        return;
                    }
                }
            }
        };
        remote_candidate.seen(false);

        self.send_binding_success(m, stream, local, &remote_candidate)
            .await;

        // Triggered-check rule: the pair this request proves reachable is
        // checked ahead of the ordinary schedule.
        let pair = self
            .find_or_add_pair(stream, local, &remote_candidate)
            .await;

        let use_candidate = UseCandidateAttr::is_set(m);
        if use_candidate && !self.is_controlling.load(Ordering::SeqCst) {
            if pair.state() == CandidatePairState::Succeeded {
                if component.selected_pair().is_none() {
                    self.set_selected_pair(stream, component, Arc::clone(&pair))
                        .await;
                }
                return;
            }
            // Nomination completes when our own check of the pair succeeds.
            pair.nominate_on_success.store(true, Ordering::SeqCst);
        }

        match pair.state() {
            CandidatePairState::Frozen | CandidatePairState::Waiting => {
                pair.set_state(CandidatePairState::Waiting);
                let mut triggered = stream.triggered_queue.lock().await;
                triggered.push_back(pair);
            }
            CandidatePairState::Failed => {
                pair.set_state(CandidatePairState::Waiting);
                let mut triggered = stream.triggered_queue.lock().await;
                triggered.push_back(pair);
            }
            _ => {}
        }

        self.start_checks(stream).await;
    }

    async fn remote_for_reply(
        &self,
        component: &Arc<Component>,
        remote_addr: SocketAddr,
    ) -> crate::error::Result<Arc<dyn Candidate + Send + Sync>> {
        if let Some(remote) = component.find_remote_candidate(remote_addr).await {
            return Ok(remote);
        }

        // Not (yet) a known candidate; a bare addressable stand-in is
        // enough to carry the response bytes.
        let config = CandidatePeerReflexiveConfig {
            base_config: CandidateBaseConfig {
                network: UDP.to_owned(),
                address: remote_addr.ip().to_string(),
                port: remote_addr.port(),
                component: component.id,
                ..CandidateBaseConfig::default()
            },
            rel_addr: String::new(),
            rel_port: 0,
        };
        Ok(Arc::new(config.new_candidate_peer_reflexive()?))
    }

    async fn create_peer_reflexive_remote(
        &self,
        m: &Message,
        component: &Arc<Component>,
        remote_addr: SocketAddr,
    ) -> crate::error::Result<Arc<dyn Candidate + Send + Sync>> {
        let mut priority = PriorityAttr::default();
        let _ = priority.get_from(m);

        let mut remote_ufrag = String::new();
        let mut username = Username::new(ATTR_USERNAME, String::new());
        if username.get_from(m).is_ok() {
            if let Some(fragment) = username.to_string().split(':').nth(1) {
                remote_ufrag = fragment.to_owned();
            }
        }

        let config = CandidatePeerReflexiveConfig {
            base_config: CandidateBaseConfig {
                network: UDP.to_owned(),
                address: remote_addr.ip().to_string(),
                port: remote_addr.port(),
                component: component.id,
                priority: priority.0,
                remote_ufrag,
                ..CandidateBaseConfig::default()
            },
            rel_addr: String::new(),
            rel_port: 0,
        };
        let candidate: Arc<dyn Candidate + Send + Sync> =
            Arc::new(config.new_candidate_peer_reflexive()?);
        Ok(candidate)
    }

    async fn find_or_add_pair(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        local: &Arc<dyn Candidate + Send + Sync>,
        remote: &Arc<dyn Candidate + Send + Sync>,
    ) -> Arc<CandidatePair> {
        let controlling = self.is_controlling.load(Ordering::SeqCst);
        let mut checklist = stream.checklist.lock().await;

        if let Some(pair) = checklist
            .iter()
            .find(|p| p.local.equal(&**local) && p.remote.equal(&**remote))
        {
            return Arc::clone(pair);
        }

        let pair = Arc::new(CandidatePair::new(
            Arc::clone(local),
            Arc::clone(remote),
            controlling,
        ));
        pair.set_state(CandidatePairState::Waiting);
        checklist.push(Arc::clone(&pair));
        checklist.sort_by(|a, b| pair_ordering(a, b));
        pair
    }

    /// A success response to one of our checks.
    pub(crate) async fn handle_success_response(
        self: &Arc<Self>,
        m: &mut Message,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        local: &Arc<dyn Candidate + Send + Sync>,
        remote_addr: SocketAddr,
    ) {
        {
            let ufrag_pwd = stream.ufrag_pwd.lock().await;
            if let Err(err) = assert_inbound_message_integrity(m, ufrag_pwd.remote_pwd.as_bytes())
            {
                log::warn!(
                    "[{}]: discard message from ({}), {}",
                    self.get_name(),
                    remote_addr,
                    err
                );
                return;
            }
        }

        let (pair, transaction) = match self.take_pair_transaction(stream, m.transaction_id).await
        {
            Some(found) => found,
            None => {
                log::warn!(
                    "[{}]: discard message from ({}), unknown TransactionID 0x{:?}",
                    self.get_name(),
                    remote_addr,
                    m.transaction_id
                );
                return;
            }
        };

        // Assert that NAT is not symmetric.
        if pair.remote.addr() != remote_addr {
            log::debug!(
                "[{}]: discard message: transaction source does not match, expected({}), actual({})",
                self.get_name(),
                pair.remote.addr(),
                remote_addr
            );
            pair.set_state(CandidatePairState::Failed);
            return;
        }

        self.discover_peer_reflexive_local(m, stream, component, local, &pair)
            .await;

        if pair.state() != CandidatePairState::Cancelled {
            pair.set_state(CandidatePairState::Succeeded);
        }
        log::trace!("[{}]: found valid candidate pair: {}", self.get_name(), pair);

        self.set_component_state(stream, component, ComponentState::Connected)
            .await;

        let nominated_here = transaction.is_use_candidate
            && self.is_controlling.load(Ordering::SeqCst)
            && component.selected_pair().is_none();
        let nominated_by_peer = pair.nominate_on_success.swap(false, Ordering::SeqCst)
            && !self.is_controlling.load(Ordering::SeqCst)
            && component.selected_pair().is_none();

        if nominated_here || nominated_by_peer {
            self.set_selected_pair(stream, component, pair).await;
        }
    }

    /// An error response to one of our checks; 487 drives role convergence.
    pub(crate) async fn handle_error_response(
        self: &Arc<Self>,
        m: &mut Message,
        stream: &Arc<Stream>,
        _component: &Arc<Component>,
        remote_addr: SocketAddr,
    ) {
        let (pair, _transaction) = match self.take_pair_transaction(stream, m.transaction_id).await
        {
            Some(found) => found,
            None => {
                log::trace!(
                    "[{}]: error response with unknown TransactionID from {}",
                    self.get_name(),
                    remote_addr
                );
                return;
            }
        };

        let mut error_code = ErrorCodeAttribute::default();
        if error_code.get_from(m).is_err() {
            pair.set_state(CandidatePairState::Failed);
            return;
        }

        if error_code.code == CODE_ROLE_CONFLICT {
            // Only flip if we still hold the role the check was sent under;
            // an inbound request may already have resolved the conflict.
            let sent_as_controlling = pair.ice_role_controlling.load(Ordering::SeqCst);
            if sent_as_controlling == self.is_controlling.load(Ordering::SeqCst) {
                log::debug!(
                    "[{}]: role conflict response from {}, switching role",
                    self.get_name(),
                    remote_addr
                );
                self.switch_role().await;
            }

            // Repeat the check under the current role.
            pair.set_state(CandidatePairState::Waiting);
            {
                let mut triggered = stream.triggered_queue.lock().await;
                triggered.push_back(pair);
            }
        } else {
            log::warn!(
                "[{}]: check rejected with {} by {}",
                self.get_name(),
                error_code,
                remote_addr
            );
            pair.set_state(CandidatePairState::Failed);
        }
    }

    /// Pops the pair owning a transaction id, clearing the transaction.
    async fn take_pair_transaction(
        &self,
        stream: &Arc<Stream>,
        id: TransactionId,
    ) -> Option<(Arc<CandidatePair>, PairTransaction)> {
        let checklist = stream.checklist.lock().await;
        for pair in checklist.iter() {
            let mut transaction = pair.transaction.lock();
            if transaction
                .as_ref()
                .map_or(false, |txn| txn.transaction_id == id)
            {
                let txn = transaction.take();
                return txn.map(|txn| (Arc::clone(pair), txn));
            }
        }
        None
    }

    /// The mapped address of a response may teach us a peer-reflexive local
    /// candidate; record it and the discovered pair.
    async fn discover_peer_reflexive_local(
        self: &Arc<Self>,
        m: &Message,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        local: &Arc<dyn Candidate + Send + Sync>,
        pair: &Arc<CandidatePair>,
    ) {
        let mut xor_addr = XorMappedAddress::default();
        if xor_addr.get_from(m).is_err() {
            return;
        }
        let mapped = crate::util::create_addr(local.network_type(), xor_addr.ip, xor_addr.port);

        {
            let local_candidates = component.local_candidates.lock().await;
            if local_candidates.iter().any(|c| c.addr() == mapped) {
                return;
            }
        }

        let config = CandidatePeerReflexiveConfig {
            base_config: CandidateBaseConfig {
                network: UDP.to_owned(),
                address: mapped.ip().to_string(),
                port: mapped.port(),
                component: component.id,
                ..CandidateBaseConfig::default()
            },
            rel_addr: pair.local.base_addr().ip().to_string(),
            rel_port: pair.local.base_addr().port(),
        };

        let prflx: Arc<dyn Candidate + Send + Sync> = match config.new_candidate_peer_reflexive() {
            Ok(candidate) => Arc::new(candidate),
            Err(err) => {
                log::warn!(
                    "[{}]: failed to create prflx local candidate: {}",
                    self.get_name(),
                    err
                );
                return;
            }
        };

        log::debug!(
            "[{}]: discovered peer-reflexive local candidate {}",
            self.get_name(),
            mapped
        );
        if self
            .add_local_candidate(stream, component, Arc::clone(&prflx), false)
            .await
            .is_err()
        {
            return;
        }

        let discovered = Arc::new(CandidatePair::new(
            prflx,
            Arc::clone(&pair.remote),
            self.is_controlling.load(Ordering::SeqCst),
        ));
        discovered.set_state(CandidatePairState::Discovered);
        let mut checklist = stream.checklist.lock().await;
        checklist.push(discovered);
        checklist.sort_by(|a, b| pair_ordering(a, b));
    }

    /// Loses a role conflict: flip the role and re-derive every pair
    /// priority under the new ordering.
    pub(crate) async fn switch_role(&self) {
        let was_controlling = self.is_controlling.load(Ordering::SeqCst);
        self.is_controlling.store(!was_controlling, Ordering::SeqCst);
        log::info!(
            "[{}]: switched role after conflict (was {})",
            self.get_name(),
            if was_controlling {
                "controlling"
            } else {
                "controlled"
            }
        );

        let streams = {
            let streams = self.streams.lock().await;
            streams.clone()
        };
        for stream in streams {
            let mut checklist = stream.checklist.lock().await;
            for pair in checklist.iter() {
                pair.set_role(!was_controlling);
            }
            checklist.sort_by(|a, b| pair_ordering(a, b));
        }
    }
}
