use super::*;
use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_host::CandidateHostConfig;

fn host_candidate(address: &str, port: u16) -> Arc<dyn Candidate + Send + Sync> {
    Arc::new(
        CandidateHostConfig {
            base_config: CandidateBaseConfig {
                network: "udp".to_owned(),
                address: address.to_owned(),
                port,
                component: 1,
                ..Default::default()
            },
            ..Default::default()
        }
        .new_candidate_host()
        .unwrap(),
    )
}

#[tokio::test]
async fn test_stream_components() {
    let stream = Stream::new(1, 2);

    assert_eq!(stream.component(1).unwrap().id, 1);
    assert_eq!(stream.component(2).unwrap().id, 2);
    assert!(stream.component(0).is_err());
    assert!(stream.component(3).is_err());
}

#[tokio::test]
async fn test_stream_credentials() {
    let stream = Stream::new(1, 1);

    let (ufrag, pwd) = {
        let ufrag_pwd = stream.ufrag_pwd.lock().await;
        (ufrag_pwd.local_ufrag.clone(), ufrag_pwd.local_pwd.clone())
    };
    assert!(ufrag.len() >= 4);
    assert!(pwd.len() >= 22);

    stream.regenerate_credentials().await;

    let ufrag_pwd = stream.ufrag_pwd.lock().await;
    assert_ne!(ufrag_pwd.local_ufrag, ufrag);
    assert_ne!(ufrag_pwd.local_pwd, pwd);
    assert!(ufrag_pwd.remote_ufrag.is_empty());
}

#[tokio::test]
async fn test_component_state_monotone() {
    let component = Component::new(1, 1);
    assert_eq!(component.state(), ComponentState::Disconnected);

    assert!(component.advance_state(ComponentState::Gathering));
    assert!(component.advance_state(ComponentState::Connecting));
    assert!(component.advance_state(ComponentState::Connected));
    assert!(component.advance_state(ComponentState::Ready));

    // No going back.
    assert!(!component.advance_state(ComponentState::Connecting));
    assert_eq!(component.state(), ComponentState::Ready);

    // Failed is always reachable, and terminal.
    assert!(component.advance_state(ComponentState::Failed));
    assert!(!component.advance_state(ComponentState::Connected));
    assert_eq!(component.state(), ComponentState::Failed);

    // Restart forces the state back.
    component.reset_state(ComponentState::Connecting);
    assert_eq!(component.state(), ComponentState::Connecting);
}

#[tokio::test]
async fn test_add_local_candidate_unique_priorities() -> Result<()> {
    let component = Component::new(1, 1);

    // Same computed priority; insertion must keep them distinct.
    let a = host_candidate("10.0.0.1", 1000);
    let b = host_candidate("10.0.0.2", 1001);
    assert_eq!(a.priority(), b.priority());

    component.add_local_candidate(&a).await?;
    component.add_local_candidate(&b).await?;

    assert_ne!(a.priority(), b.priority());

    Ok(())
}

#[tokio::test]
async fn test_add_local_candidate_redundant() -> Result<()> {
    let component = Component::new(1, 1);

    let a = host_candidate("10.0.0.1", 1000);
    let dup = host_candidate("10.0.0.1", 1000);

    component.add_local_candidate(&a).await?;
    assert_eq!(
        component.add_local_candidate(&dup).await,
        Err(Error::ErrRedundantCandidate)
    );

    Ok(())
}

#[tokio::test]
async fn test_add_remote_candidate_dedupe() {
    let component = Component::new(1, 1);

    let a = host_candidate("10.0.0.1", 1000);
    let dup = host_candidate("10.0.0.1", 1000);

    assert!(component.add_remote_candidate(&a).await);
    assert!(!component.add_remote_candidate(&dup).await);
}

#[tokio::test]
async fn test_pending_tcp_queue_bounded() {
    let component = Component::new(1, 1);

    for i in 0..(MAX_PENDING_TCP_PACKETS + 10) {
        component
            .enqueue_pending_tcp(Bytes::from(vec![i as u8]))
            .await;
    }

    let drained = component.drain_pending_tcp().await;
    assert_eq!(drained.len(), MAX_PENDING_TCP_PACKETS);
    // The oldest packets were discarded.
    assert_eq!(drained[0][0], 10_u8);
}
