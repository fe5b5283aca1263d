use super::*;

#[tokio::test]
async fn test_event_ordering_per_component() {
    let (sender, mut rx) = EventSender::new();

    sender
        .post(Event::NewSelectedPair {
            stream_id: 1,
            component_id: 1,
            local_foundation: "lf".to_owned(),
            remote_foundation: "rf".to_owned(),
        })
        .await;
    sender
        .post(Event::ComponentStateChanged {
            stream_id: 1,
            component_id: 1,
            state: ComponentState::Ready,
        })
        .await;

    // The selected pair must be observable before Ready.
    match rx.recv().await {
        Some(Event::NewSelectedPair { .. }) => {}
        other => panic!("expected NewSelectedPair, got {other:?}"),
    }
    match rx.recv().await {
        Some(Event::ComponentStateChanged { state, .. }) => {
            assert_eq!(state, ComponentState::Ready);
        }
        other => panic!("expected ComponentStateChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn test_post_without_subscriber_does_not_wedge() {
    let (sender, rx) = EventSender::new();
    drop(rx);

    // Must return, not block or panic.
    sender
        .post(Event::CandidateGatheringDone { stream_id: 7 })
        .await;
}
