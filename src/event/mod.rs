#[cfg(test)]
mod event_test;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::candidate::Candidate;
use crate::state::ComponentState;

/// Capacity of the agent event channel. Large enough that protocol code
/// posting under the agent locks never waits in practice.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Lifecycle notifications emitted by the agent.
///
/// Events for the same (stream, component) are delivered in posting order;
/// `NewSelectedPair` always precedes the first
/// `ComponentStateChanged(Ready)` of its component.
#[derive(Clone)]
pub enum Event {
    /// Candidate gathering finished for a stream. Emitted exactly once per
    /// gather cycle.
    CandidateGatheringDone { stream_id: u32 },

    /// A new local candidate became usable, foundation form.
    NewCandidate {
        stream_id: u32,
        component_id: u16,
        foundation: String,
    },

    /// A new local candidate became usable, full form.
    NewCandidateFull {
        candidate: Arc<dyn Candidate + Send + Sync>,
    },

    /// A remote candidate was learned (signalled or peer-reflexive).
    NewRemoteCandidate {
        stream_id: u32,
        component_id: u16,
        foundation: String,
    },

    /// A pair was nominated for a component, foundation form.
    NewSelectedPair {
        stream_id: u32,
        component_id: u16,
        local_foundation: String,
        remote_foundation: String,
    },

    /// A pair was nominated for a component, full form.
    NewSelectedPairFull {
        stream_id: u32,
        component_id: u16,
        local: Arc<dyn Candidate + Send + Sync>,
        remote: Arc<dyn Candidate + Send + Sync>,
    },

    /// A component changed connectivity state.
    ComponentStateChanged {
        stream_id: u32,
        component_id: u16,
        state: ComponentState,
    },

    /// The first authenticated Binding request arrived on a stream.
    InitialBindingRequestReceived { stream_id: u32 },

    /// The reliable transport drained a previously full send buffer.
    ReliableTransportWritable { stream_id: u32, component_id: u16 },
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::CandidateGatheringDone { stream_id } => {
                write!(f, "CandidateGatheringDone({stream_id})")
            }
            Event::NewCandidate {
                stream_id,
                component_id,
                foundation,
            } => write!(f, "NewCandidate({stream_id}, {component_id}, {foundation})"),
            Event::NewCandidateFull { candidate } => write!(f, "NewCandidateFull({candidate})"),
            Event::NewRemoteCandidate {
                stream_id,
                component_id,
                foundation,
            } => write!(
                f,
                "NewRemoteCandidate({stream_id}, {component_id}, {foundation})"
            ),
            Event::NewSelectedPair {
                stream_id,
                component_id,
                local_foundation,
                remote_foundation,
            } => write!(
                f,
                "NewSelectedPair({stream_id}, {component_id}, {local_foundation}, {remote_foundation})"
            ),
            Event::NewSelectedPairFull {
                stream_id,
                component_id,
                local,
                remote,
            } => write!(
                f,
                "NewSelectedPairFull({stream_id}, {component_id}, {local}, {remote})"
            ),
            Event::ComponentStateChanged {
                stream_id,
                component_id,
                state,
            } => write!(
                f,
                "ComponentStateChanged({stream_id}, {component_id}, {state})"
            ),
            Event::InitialBindingRequestReceived { stream_id } => {
                write!(f, "InitialBindingRequestReceived({stream_id})")
            }
            Event::ReliableTransportWritable {
                stream_id,
                component_id,
            } => write!(f, "ReliableTransportWritable({stream_id}, {component_id})"),
        }
    }
}

/// The posting half kept inside the agent.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    pub(crate) fn new() -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Posts an event. Blocks only when the subscriber has fallen
    /// EVENT_CHANNEL_CAPACITY events behind; a vanished subscriber drops the
    /// event instead of wedging protocol code.
    pub(crate) async fn post(&self, event: Event) {
        if let Err(err) = self.tx.send(event).await {
            log::trace!("event subscriber gone, dropping {:?}", err.0);
        }
    }
}
