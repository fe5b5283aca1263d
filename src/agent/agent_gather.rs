use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use util::Conn;
use waitgroup::WaitGroup;

use super::agent_internal::AgentInternal;
use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_relay::{CandidateRelayConfig, TurnServer};
use crate::candidate::candidate_server_reflexive::CandidateServerReflexiveConfig;
use crate::candidate::*;
use crate::error::*;
use crate::event::Event;
use crate::network_type::UDP;
use crate::state::{ComponentState, GatheringState};
use crate::stream::{Component, Stream};
use crate::url::{ProtoType, SchemeType};
use crate::util::{get_xormapped_addr, listen_udp_in_port_range, local_interfaces};

impl AgentInternal {
    /// Starts gathering for a stream. Host candidates are produced
    /// synchronously so socket-range exhaustion surfaces to the caller;
    /// server-reflexive and relayed discovery continues in the background
    /// and ends with a single gathering-done event.
    pub(crate) async fn gather_candidates(self: &Arc<Self>, stream: &Arc<Stream>) -> Result<()> {
        // Idempotent: a second gather on the same stream is a no-op.
        if stream.gathering_state() != GatheringState::New {
            return Ok(());
        }
        stream
            .gathering_state
            .store(GatheringState::Gathering as u8, Ordering::SeqCst);

        for component in &stream.components {
            self.set_component_state(stream, component, ComponentState::Gathering)
                .await;
        }

        let mut hosts: Vec<(Arc<Component>, Arc<dyn Candidate + Send + Sync>)> = vec![];
        for component in &stream.components {
            let bound = match self.gather_host_candidates(stream, component).await {
                Ok(bound) => bound,
                Err(err) => {
                    // Leave the stream gatherable again after a failed
                    // attempt.
                    stream
                        .gathering_state
                        .store(GatheringState::New as u8, Ordering::SeqCst);
                    return Err(err);
                }
            };
            for candidate in bound {
                hosts.push((Arc::clone(component), candidate));
            }
        }

        let ai = Arc::clone(self);
        let stream = Arc::clone(stream);
        tokio::spawn(async move {
            ai.gather_remote_candidates(&stream, hosts).await;

            stream
                .gathering_state
                .store(GatheringState::Complete as u8, Ordering::SeqCst);
            ai.events
                .post(Event::CandidateGatheringDone { stream_id: stream.id })
                .await;

            // Pairs may already exist from early remote candidates.
            ai.build_check_list(&stream).await;
            ai.start_checks(&stream).await;
        });

        Ok(())
    }

    /// Binds one UDP socket per usable interface address, honoring the
    /// component's port range.
    async fn gather_host_candidates(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
    ) -> Result<Vec<Arc<dyn Candidate + Send + Sync>>> {
        let ips = local_interfaces(
            &self.net,
            &self.interface_filter,
            &self.ip_filter,
            &self.network_types,
            self.include_loopback,
        )
        .await;

        let port_min = component.port_min.load(Ordering::SeqCst);
        let port_max = component.port_max.load(Ordering::SeqCst);
        let range_restricted = port_min != 0 || port_max != 0;

        let mut bound: Vec<Arc<dyn Candidate + Send + Sync>> = vec![];
        let mut attempted = 0_usize;

        for ip in ips {
            attempted += 1;

            let conn: Arc<dyn Conn + Send + Sync> = match listen_udp_in_port_range(
                &self.net,
                port_max,
                port_min,
                SocketAddr::new(ip, 0),
            )
            .await
            {
                Ok(conn) => conn,
                Err(err) => {
                    log::warn!(
                        "[{}]: could not listen {} {}: {}",
                        self.get_name(),
                        UDP,
                        ip,
                        err
                    );
                    continue;
                }
            };

            let port = match conn.local_addr().await {
                Ok(addr) => addr.port(),
                Err(err) => {
                    log::warn!(
                        "[{}]: could not get local addr: {}",
                        self.get_name(),
                        err
                    );
                    continue;
                }
            };

            let host_config = CandidateHostConfig {
                base_config: CandidateBaseConfig {
                    network: UDP.to_owned(),
                    address: ip.to_string(),
                    port,
                    component: component.id,
                    conn: Some(conn),
                    ..CandidateBaseConfig::default()
                },
                ..CandidateHostConfig::default()
            };

            let candidate: Arc<dyn Candidate + Send + Sync> =
                match host_config.new_candidate_host() {
                    Ok(candidate) => Arc::new(candidate),
                    Err(err) => {
                        log::warn!(
                            "[{}]: failed to create host candidate: {} {} {}: {}",
                            self.get_name(),
                            UDP,
                            ip,
                            port,
                            err
                        );
                        continue;
                    }
                };

            // The read loop starts after discovery; STUN exchanges with the
            // server own the socket until then.
            match self
                .add_local_candidate(stream, component, Arc::clone(&candidate), false)
                .await
            {
                Ok(()) => bound.push(candidate),
                Err(err) => {
                    let _ = candidate.close().await;
                    log::warn!(
                        "[{}]: failed to append host candidate: {}",
                        self.get_name(),
                        err
                    );
                }
            }
        }

        if bound.is_empty() && attempted > 0 && range_restricted {
            return Err(Error::ErrSocketCreationFailed);
        }

        Ok(bound)
    }

    /// Server-reflexive and relayed discovery for every (host, server)
    /// combination, paced Ta apart. Entries fail independently.
    async fn gather_remote_candidates(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        hosts: Vec<(Arc<Component>, Arc<dyn Candidate + Send + Sync>)>,
    ) {
        let wg = WaitGroup::new();

        // STUN discovery entries sharing a host socket run sequentially on
        // one task; a socket has a single reader.
        for (component, host) in &hosts {
            let stun_urls: Vec<_> = self
                .urls
                .iter()
                .filter(|url| url.scheme == SchemeType::Stun)
                .cloned()
                .collect();
            if !stun_urls.is_empty() {
                let ai = Arc::clone(self);
                let stream = Arc::clone(stream);
                let component = Arc::clone(component);
                let host = Arc::clone(host);
                let ta = self.ta;
                let w = wg.worker();
                tokio::spawn(async move {
                    let _d = w;
                    let mut first = true;
                    for url in stun_urls {
                        if !first {
                            tokio::time::sleep(ta).await;
                        }
                        first = false;
                        ai.discover_server_reflexive(&stream, &component, &host, &url)
                            .await;
                    }
                });
            }
        }

        // Relay entries bind their own sockets and can run in parallel.
        let mut first = true;
        for component in &stream.components {
            for url in &self.urls {
                if url.scheme != SchemeType::Turn {
                    continue;
                }
                if !first {
                    tokio::time::sleep(self.ta).await;
                }
                first = false;

                let ai = Arc::clone(self);
                let stream = Arc::clone(stream);
                let component = Arc::clone(component);
                let url = url.clone();
                let w = wg.worker();
                tokio::spawn(async move {
                    let _d = w;
                    ai.discover_relay(&stream, &component, &url).await;
                });
            }
        }

        // Gathering is done only when no discovery remains in flight.
        wg.wait().await;

        // Discovery no longer owns the host sockets; start their read loops.
        for (component, host) in &hosts {
            self.start_candidate_io(stream, component, host);
        }
    }

    /// One STUN Binding exchange from the host socket; the mapped address
    /// becomes a server-reflexive candidate based on that host.
    async fn discover_server_reflexive(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        host: &Arc<dyn Candidate + Send + Sync>,
        url: &crate::url::Url,
    ) {
        if url.proto != ProtoType::Udp {
            return;
        }

        let conn = match host.get_conn() {
            Some(conn) => Arc::clone(conn),
            None => return,
        };

        let server_addr = match self
            .net
            .resolve_addr(host.network_type().is_ipv4(), &url.addr())
            .await
        {
            Ok(addr) => addr,
            Err(err) => {
                log::warn!(
                    "[{}]: failed to resolve stun host {}: {}",
                    self.get_name(),
                    url.addr(),
                    err
                );
                return;
            }
        };

        let xoraddr = match get_xormapped_addr(&conn, server_addr).await {
            Ok(xoraddr) => xoraddr,
            Err(err) => {
                log::warn!(
                    "[{}]: could not get server reflexive address {}: {}",
                    self.get_name(),
                    url,
                    err
                );
                return;
            }
        };

        let srflx_config = CandidateServerReflexiveConfig {
            base_config: CandidateBaseConfig {
                network: UDP.to_owned(),
                address: xoraddr.ip.to_string(),
                port: xoraddr.port,
                component: component.id,
                conn: Some(conn),
                ..CandidateBaseConfig::default()
            },
            rel_addr: host.addr().ip().to_string(),
            rel_port: host.port(),
        };

        let candidate: Arc<dyn Candidate + Send + Sync> =
            match srflx_config.new_candidate_server_reflexive() {
                Ok(candidate) => Arc::new(candidate),
                Err(err) => {
                    log::warn!(
                        "[{}]: failed to create server reflexive candidate: {}",
                        self.get_name(),
                        err
                    );
                    return;
                }
            };

        // The socket stays with the host candidate; redundant mappings are
        // dropped here.
        match self
            .add_local_candidate(stream, component, candidate, false)
            .await
        {
            Ok(()) => {}
            Err(Error::ErrRedundantCandidate) => {}
            Err(err) => {
                log::warn!(
                    "[{}]: failed to append srflx candidate: {}",
                    self.get_name(),
                    err
                );
            }
        }
    }

    /// The TURN Allocate exchange; produces a relayed candidate bound to the
    /// server. Allocation refreshes run inside the client.
    async fn discover_relay(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        url: &crate::url::Url,
    ) {
        if url.username.is_empty() {
            log::error!(
                "[{}]: failed to gather relay candidates: {:?}",
                self.get_name(),
                Error::ErrUsernameEmpty
            );
            return;
        }
        if url.password.is_empty() {
            log::error!(
                "[{}]: failed to gather relay candidates: {:?}",
                self.get_name(),
                Error::ErrPasswordEmpty
            );
            return;
        }
        if url.proto != ProtoType::Udp {
            log::warn!(
                "[{}]: unable to handle TURN transport {}",
                self.get_name(),
                url.proto
            );
            return;
        }

        let turn_server_addr = url.addr();

        let bind_addr = match SocketAddr::from_str("0.0.0.0:0") {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let loc_conn = match self.net.bind(bind_addr).await {
            Ok(conn) => conn,
            Err(err) => {
                log::warn!(
                    "[{}]: failed to listen for relay: {}",
                    self.get_name(),
                    err
                );
                return;
            }
        };

        let local_addr = match loc_conn.local_addr().await {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let rel_addr = local_addr.ip().to_string();
        let rel_port = local_addr.port();

        let cfg = turn::client::ClientConfig {
            stun_serv_addr: String::new(),
            turn_serv_addr: turn_server_addr.clone(),
            username: url.username.clone(),
            password: url.password.clone(),
            realm: String::new(),
            software: String::new(),
            rto_in_ms: 0,
            conn: loc_conn,
            vnet: Some(Arc::clone(&self.net)),
        };
        let client = match turn::client::Client::new(cfg).await {
            Ok(client) => Arc::new(client),
            Err(err) => {
                log::warn!(
                    "[{}]: failed to build turn client for {}: {}",
                    self.get_name(),
                    turn_server_addr,
                    err
                );
                return;
            }
        };
        if let Err(err) = client.listen().await {
            let _ = client.close().await;
            log::warn!(
                "[{}]: failed to listen on turn client {}: {}",
                self.get_name(),
                turn_server_addr,
                err
            );
            return;
        }

        let relay_conn: Arc<dyn Conn + Send + Sync> = match client.allocate().await {
            Ok(conn) => Arc::new(conn),
            Err(err) => {
                let _ = client.close().await;
                log::warn!(
                    "[{}]: failed to allocate on turn client {}: {}",
                    self.get_name(),
                    turn_server_addr,
                    err
                );
                return;
            }
        };

        let raddr = match relay_conn.local_addr().await {
            Ok(addr) => addr,
            Err(_) => {
                let _ = client.close().await;
                return;
            }
        };

        let turn_server = self
            .get_or_register_turn_server(&turn_server_addr, &url.username, &url.password)
            .await;

        let relay_config = CandidateRelayConfig {
            base_config: CandidateBaseConfig {
                network: UDP.to_owned(),
                address: raddr.ip().to_string(),
                port: raddr.port(),
                component: component.id,
                conn: Some(Arc::clone(&relay_conn)),
                ..CandidateBaseConfig::default()
            },
            rel_addr,
            rel_port,
            relay_client: Some(Arc::clone(&client)),
            turn_server: Some(turn_server),
        };

        let candidate: Arc<dyn Candidate + Send + Sync> = match relay_config.new_candidate_relay()
        {
            Ok(candidate) => Arc::new(candidate),
            Err(err) => {
                let _ = relay_conn.close().await;
                let _ = client.close().await;
                log::warn!(
                    "[{}]: failed to create relay candidate: {}",
                    self.get_name(),
                    err
                );
                return;
            }
        };

        if let Err(err) = self
            .add_local_candidate(stream, component, candidate, true)
            .await
        {
            log::warn!(
                "[{}]: failed to append relay candidate: {}",
                self.get_name(),
                err
            );
        }
    }

    async fn get_or_register_turn_server(
        &self,
        addr: &str,
        username: &str,
        password: &str,
    ) -> Arc<TurnServer> {
        let mut turn_servers = self.turn_servers.lock().await;
        if let Some(server) = turn_servers
            .iter()
            .find(|s| s.addr == addr && s.username == username)
        {
            return Arc::clone(server);
        }

        let server = Arc::new(TurnServer {
            addr: addr.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        });
        turn_servers.push(Arc::clone(&server));
        server
    }

    /// Drops relayed candidates and the TURN servers backing them.
    pub(crate) async fn forget_relays(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
    ) -> Result<()> {
        let removed: Vec<Arc<dyn Candidate + Send + Sync>> = {
            let mut local_candidates = component.local_candidates.lock().await;
            let mut removed = vec![];
            local_candidates.retain(|candidate| {
                if candidate.candidate_type() == CandidateType::Relay {
                    removed.push(Arc::clone(candidate));
                    false
                } else {
                    true
                }
            });
            removed
        };

        for candidate in &removed {
            // Also drop the pairs built on the relayed candidate.
            {
                let mut checklist = stream.checklist.lock().await;
                checklist.retain(|p| !p.local.equal(&**candidate));
            }
            if let Err(err) = candidate.close().await {
                log::warn!(
                    "[{}]: failed to close relay candidate: {}",
                    self.get_name(),
                    err
                );
            }
        }

        // Entries no candidate references anymore are released.
        let mut turn_servers = self.turn_servers.lock().await;
        turn_servers.retain(|server| Arc::strong_count(server) > 1);

        Ok(())
    }
}
