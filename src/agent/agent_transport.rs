use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::time::Duration;

use super::agent_internal::AgentInternal;
use crate::candidate::RECEIVE_MTU;
use crate::error::*;
use crate::event::Event;
use crate::ptcp::{PseudoTcp, PtcpEvent};
use crate::stream::{Component, Stream};

/// Conversation id for the embedded reliable transport. Both sides of a
/// component share it by construction.
const PTCP_CONV: u32 = 0;

impl AgentInternal {
    /// A non-STUN datagram arrived on a component socket.
    pub(crate) async fn handle_inbound_data(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
        buf: &[u8],
        src_addr: SocketAddr,
    ) {
        // Data from an address that never validated is dropped.
        let remote = component.find_remote_candidate(src_addr).await;
        match &remote {
            Some(remote) => remote.seen(false),
            None => {
                log::warn!(
                    "[{}]: discarded message from {}, not a valid remote candidate",
                    self.get_name(),
                    src_addr
                );
                return;
            }
        }

        if !self.reliable {
            self.deliver_data(component, Bytes::copy_from_slice(buf)).await;
            return;
        }

        if component.selected_pair().is_none() {
            // Too early; replayed into the reliable layer once a pair is
            // selected.
            component
                .enqueue_pending_tcp(Bytes::copy_from_slice(buf))
                .await;
            return;
        }

        self.ensure_ptcp(stream, component).await;
        {
            let mut guard = component.ptcp.lock().await;
            if let Some(ptcp) = guard.as_mut() {
                if let Err(err) = ptcp.notify_packet(buf) {
                    log::debug!("[{}]: ptcp rejected segment: {}", self.get_name(), err);
                }
            }
        }
        self.drive_ptcp(stream, component).await;
    }

    /// Hands buffered application data to the attached receive callback.
    async fn deliver_data(&self, component: &Arc<Component>, data: Bytes) {
        if let Some(handler) = &*component.on_recv.load() {
            let mut f = handler.lock().await;
            f(data).await;
        } else {
            log::trace!(
                "[{}]: no receive callback on {}/{}, dropping {} bytes",
                self.get_name(),
                component.stream_id,
                component.id,
                data.len()
            );
        }
    }

    /// Creates the component's pseudo-TCP socket on first selection
    /// (reliable mode only) and registers its clock timer.
    pub(crate) async fn ensure_ptcp(self: &Arc<Self>, stream: &Arc<Stream>, component: &Arc<Component>) {
        if !self.reliable {
            return;
        }

        let created = {
            let mut guard = component.ptcp.lock().await;
            if guard.is_some() {
                false
            } else {
                let mut ptcp = PseudoTcp::new(PTCP_CONV, self.ptcp_config.clone());
                if self.is_controlling.load(Ordering::SeqCst) {
                    // The side that decides nomination also opens the stream.
                    if let Err(err) = ptcp.connect(self.now_ms()) {
                        log::error!("[{}]: ptcp connect failed: {}", self.get_name(), err);
                    }
                }
                *guard = Some(ptcp);
                true
            }
        };

        if created {
            self.register_tcp_clock(stream, component);
            self.drive_ptcp(stream, component).await;
        }
    }

    fn register_tcp_clock(self: &Arc<Self>, stream: &Arc<Stream>, component: &Arc<Component>) {
        let weak = Arc::downgrade(self);
        let stream = Arc::clone(stream);
        let component_for_cb = Arc::clone(component);

        let id = self.wheel.register(
            Duration::from_millis(100),
            false,
            Box::new(move || {
                let weak = weak.clone();
                let stream = Arc::clone(&stream);
                let component = Arc::clone(&component_for_cb);
                Box::pin(async move {
                    if let Some(ai) = Weak::upgrade(&weak) {
                        ai.on_tcp_clock(&stream, &component).await;
                    }
                })
            }),
        );

        {
            let mut tcp_clock = component.tcp_clock.lock();
            *tcp_clock = Some(id);
        }
        self.wheel.start(id);
    }

    async fn on_tcp_clock(self: &Arc<Self>, stream: &Arc<Stream>, component: &Arc<Component>) {
        {
            let mut guard = component.ptcp.lock().await;
            if let Some(ptcp) = guard.as_mut() {
                ptcp.notify_clock(self.now_ms());
            } else {
                return;
            }
        }
        self.drive_ptcp(stream, component).await;
    }

    /// Flushes everything the reliable engine produced since the last
    /// interaction: segments to the wire, events to the channel, received
    /// bytes to the callback, and the next clock deadline to the wheel.
    pub(crate) async fn drive_ptcp(self: &Arc<Self>, stream: &Arc<Stream>, component: &Arc<Component>) {
        let now = self.now_ms();
        let has_handler = component.on_recv.load().is_some();

        let (transmits, events, received, next_clock) = {
            let mut guard = component.ptcp.lock().await;
            let ptcp = match guard.as_mut() {
                Some(ptcp) => ptcp,
                None => return,
            };

            let mut transmits = vec![];
            while let Some(segment) = ptcp.poll_transmit() {
                transmits.push(segment);
            }

            let mut events = vec![];
            while let Some(event) = ptcp.poll_event() {
                events.push(event);
            }

            // Bytes stay buffered inside the engine until a reader attaches.
            let mut received = vec![];
            if has_handler {
                let mut buf = vec![0_u8; RECEIVE_MTU];
                loop {
                    match ptcp.recv(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => received.push(Bytes::copy_from_slice(&buf[..n])),
                        Err(_) => break,
                    }
                }
            }

            (transmits, events, received, ptcp.next_clock(now))
        };

        if let Some(pair) = component.selected_pair() {
            for segment in transmits {
                // A would-block on the wire is a drop; retransmission covers
                // it.
                if let Err(err) = pair.write(&segment).await {
                    log::trace!("[{}]: failed to send segment: {}", self.get_name(), err);
                }
            }
        }

        for event in events {
            match event {
                PtcpEvent::Opened => {
                    log::debug!(
                        "[{}]: reliable transport open on {}/{}",
                        self.get_name(),
                        stream.id,
                        component.id
                    );
                    self.events
                        .post(Event::ReliableTransportWritable {
                            stream_id: stream.id,
                            component_id: component.id,
                        })
                        .await;
                }
                PtcpEvent::Writable => {
                    self.events
                        .post(Event::ReliableTransportWritable {
                            stream_id: stream.id,
                            component_id: component.id,
                        })
                        .await;
                }
                PtcpEvent::Readable => {}
                PtcpEvent::Closed => {
                    log::debug!(
                        "[{}]: reliable transport closed on {}/{}",
                        self.get_name(),
                        stream.id,
                        component.id
                    );
                }
            }
        }

        for data in received {
            self.deliver_data(component, data).await;
        }

        let tcp_clock = { *component.tcp_clock.lock() };
        if let Some(id) = tcp_clock {
            match next_clock {
                Some(deadline_ms) => {
                    let deadline = self.start_time + Duration::from_millis(deadline_ms);
                    self.wheel.set_next_fire(id, deadline);
                }
                None => {
                    // Closed or stuck; tear the driving timer down.
                    self.wheel.unregister(id);
                    let mut tcp_clock = component.tcp_clock.lock();
                    *tcp_clock = None;
                }
            }
        }
    }

    /// Replays datagrams that arrived before the pair selection, in arrival
    /// order.
    pub(crate) async fn replay_pending_tcp(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        component: &Arc<Component>,
    ) {
        let pending = component.drain_pending_tcp().await;
        if pending.is_empty() {
            return;
        }

        {
            let mut guard = component.ptcp.lock().await;
            if let Some(ptcp) = guard.as_mut() {
                for packet in &pending {
                    if let Err(err) = ptcp.notify_packet(packet) {
                        log::debug!(
                            "[{}]: ptcp rejected replayed segment: {}",
                            self.get_name(),
                            err
                        );
                    }
                }
            }
        }
        self.drive_ptcp(stream, component).await;
    }

    pub(crate) async fn teardown_ptcp(self: &Arc<Self>, component: &Arc<Component>, force: bool) {
        let tcp_clock = { component.tcp_clock.lock().take() };
        if let Some(id) = tcp_clock {
            self.wheel.unregister(id);
        }

        let mut guard = component.ptcp.lock().await;
        if let Some(ptcp) = guard.as_mut() {
            ptcp.close(force);
        }
        *guard = None;
    }

    /// The agent's data path. Never blocks; `ErrWouldBlock` is the -1 of
    /// the non-blocking contract.
    pub(crate) async fn send_data(
        self: &Arc<Self>,
        stream_id: u32,
        component_id: u16,
        buf: &[u8],
    ) -> Result<usize> {
        self.ensure_open()?;
        let stream = self.find_stream(stream_id).await?;
        let component = Arc::clone(stream.component(component_id)?);

        if self.reliable {
            let result = {
                let mut guard = component.ptcp.lock().await;
                match guard.as_mut() {
                    Some(ptcp) => ptcp.send(buf),
                    None => Err(Error::ErrWouldBlock),
                }
            };
            if result.is_ok() {
                self.drive_ptcp(&stream, &component).await;
            }
            return result;
        }

        match component.selected_pair() {
            Some(pair) => pair.write(buf).await,
            None => Err(Error::ErrWouldBlock),
        }
    }
}
