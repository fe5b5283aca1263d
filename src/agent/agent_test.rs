use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use super::agent_config::AgentConfig;
use super::Agent;
use crate::error::Result;
use crate::event::Event;
use crate::state::ComponentState;

fn loopback_config(is_controlling: bool, reliable: bool) -> AgentConfig {
    let ip_filter: super::agent_config::IpFilterFn =
        Box::new(|ip: std::net::IpAddr| ip.is_loopback());
    AgentConfig {
        is_controlling,
        reliable,
        include_loopback: true,
        ip_filter: Arc::new(Some(ip_filter)),
        ..Default::default()
    }
}

async fn gathered_agent(config: AgentConfig) -> Result<(Agent, mpsc::Receiver<Event>, u32)> {
    let agent = Agent::new(config).await?;
    let events = agent.take_event_receiver().unwrap();
    let stream_id = agent.add_stream(1).await?;
    agent.gather_candidates(stream_id).await?;

    let mut events = events;
    wait_for_gathering_done(&mut events, stream_id).await;

    Ok((agent, events, stream_id))
}

async fn wait_for_gathering_done(events: &mut mpsc::Receiver<Event>, stream_id: u32) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let Event::CandidateGatheringDone { stream_id: id } = event {
                if id == stream_id {
                    return;
                }
            }
        }
        panic!("event channel closed before gathering finished");
    };
    timeout(Duration::from_secs(5), wait)
        .await
        .expect("gathering never finished");
}

async fn wait_for_component_state(
    events: &mut mpsc::Receiver<Event>,
    stream_id: u32,
    state: ComponentState,
) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let Event::ComponentStateChanged {
                stream_id: id,
                state: seen,
                ..
            } = event
            {
                if id == stream_id && seen == state {
                    return;
                }
            }
        }
        panic!("event channel closed before component reached {state}");
    };
    timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("component never reached {state}"));
}

async fn exchange_lines(a: &Agent, a_stream: u32, b: &Agent, b_stream: u32) -> Result<()> {
    let a_line = a.local_exchange_line(a_stream, 1).await?;
    let b_line = b.local_exchange_line(b_stream, 1).await?;

    a.apply_remote_exchange_line(a_stream, 1, &b_line).await?;
    b.apply_remote_exchange_line(b_stream, 1, &a_line).await?;
    Ok(())
}

fn collecting_recv(tx: mpsc::Sender<Bytes>) -> crate::stream::OnRecvHdlrFn {
    Box::new(move |data: Bytes| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(data).await;
        })
    })
}

#[tokio::test]
async fn test_two_agents_reach_ready_and_exchange_data() -> Result<()> {
    let (a, mut a_events, a_stream) = gathered_agent(loopback_config(true, false)).await?;
    let (b, mut b_events, b_stream) = gathered_agent(loopback_config(false, false)).await?;

    let (b_rx_tx, mut b_rx) = mpsc::channel(16);
    b.attach_recv(b_stream, 1, Some(collecting_recv(b_rx_tx)))
        .await?;
    let (a_rx_tx, mut a_rx) = mpsc::channel(16);
    a.attach_recv(a_stream, 1, Some(collecting_recv(a_rx_tx)))
        .await?;

    exchange_lines(&a, a_stream, &b, b_stream).await?;

    wait_for_component_state(&mut a_events, a_stream, ComponentState::Ready).await;
    wait_for_component_state(&mut b_events, b_stream, ComponentState::Ready).await;

    let a_pair = a.get_selected_pair(a_stream, 1).await?.unwrap();
    assert!(a_pair.is_nominated());

    // Byte-for-byte round trip in both directions.
    a.send(a_stream, 1, b"hello from a").await?;
    let received = timeout(Duration::from_secs(5), b_rx.recv())
        .await
        .expect("b never received data")
        .unwrap();
    assert_eq!(&received[..], b"hello from a");

    b.send(b_stream, 1, b"hello from b").await?;
    let received = timeout(Duration::from_secs(5), a_rx.recv())
        .await
        .expect("a never received data")
        .unwrap();
    assert_eq!(&received[..], b"hello from b");

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_gather_is_idempotent() -> Result<()> {
    let agent = Agent::new(loopback_config(true, false)).await?;
    let mut events = agent.take_event_receiver().unwrap();
    let stream_id = agent.add_stream(1).await?;

    agent.gather_candidates(stream_id).await?;
    // A second gather must be an accepted no-op.
    agent.gather_candidates(stream_id).await?;

    wait_for_gathering_done(&mut events, stream_id).await;
    agent.gather_candidates(stream_id).await?;

    let candidates = agent.get_local_candidates(stream_id, 1).await?;
    assert!(!candidates.is_empty());

    // No duplicate gathering-done, no duplicate candidates: every address
    // appears once.
    let mut addrs: Vec<_> = candidates.iter().map(|c| c.addr()).collect();
    addrs.sort();
    addrs.dedup();
    assert_eq!(addrs.len(), candidates.len());

    agent.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_both_controlling_converges() -> Result<()> {
    let (a, mut a_events, a_stream) = gathered_agent(loopback_config(true, false)).await?;
    let (b, mut b_events, b_stream) = gathered_agent(loopback_config(true, false)).await?;

    exchange_lines(&a, a_stream, &b, b_stream).await?;

    wait_for_component_state(&mut a_events, a_stream, ComponentState::Ready).await;
    wait_for_component_state(&mut b_events, b_stream, ComponentState::Ready).await;

    // Exactly one side ends controlling, decided by the tie-breakers.
    assert_ne!(a.role(), b.role());
    let expected_controlling_is_a = a.tie_breaker() > b.tie_breaker();
    assert_eq!(
        a.role() == crate::control::Role::Controlling,
        expected_controlling_is_a
    );

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_restart_regains_ready() -> Result<()> {
    let (a, mut a_events, a_stream) = gathered_agent(loopback_config(true, false)).await?;
    let (b, mut b_events, b_stream) = gathered_agent(loopback_config(false, false)).await?;

    exchange_lines(&a, a_stream, &b, b_stream).await?;
    wait_for_component_state(&mut a_events, a_stream, ComponentState::Ready).await;
    wait_for_component_state(&mut b_events, b_stream, ComponentState::Ready).await;

    let (a_ufrag_before, a_pwd_before) = a.get_local_credentials(a_stream).await?;

    a.restart_stream(a_stream).await?;
    b.restart_stream(b_stream).await?;

    // Credentials changed and the components went back to Connecting.
    let (a_ufrag_after, a_pwd_after) = a.get_local_credentials(a_stream).await?;
    assert_ne!(a_ufrag_before, a_ufrag_after);
    assert_ne!(a_pwd_before, a_pwd_after);
    assert!(a.get_selected_pair(a_stream, 1).await?.is_none());

    // A fresh exchange drives a new check cycle to Ready.
    exchange_lines(&a, a_stream, &b, b_stream).await?;
    wait_for_component_state(&mut a_events, a_stream, ComponentState::Ready).await;
    wait_for_component_state(&mut b_events, b_stream, ComponentState::Ready).await;

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_reliable_transfer() -> Result<()> {
    let (a, mut a_events, a_stream) = gathered_agent(loopback_config(true, true)).await?;
    let (b, mut b_events, b_stream) = gathered_agent(loopback_config(false, true)).await?;

    let (b_rx_tx, mut b_rx) = mpsc::channel(1024);
    b.attach_recv(b_stream, 1, Some(collecting_recv(b_rx_tx)))
        .await?;

    exchange_lines(&a, a_stream, &b, b_stream).await?;
    wait_for_component_state(&mut a_events, a_stream, ComponentState::Ready).await;
    wait_for_component_state(&mut b_events, b_stream, ComponentState::Ready).await;

    let payload: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
    let mut sent = 0;
    while sent < payload.len() {
        match a.send(a_stream, 1, &payload[sent..]).await {
            Ok(n) => sent += n,
            Err(crate::Error::ErrWouldBlock) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(err) => return Err(err),
        }
    }

    let collect = async {
        let mut received = Vec::with_capacity(payload.len());
        while received.len() < payload.len() {
            match b_rx.recv().await {
                Some(chunk) => received.extend_from_slice(&chunk),
                None => break,
            }
        }
        received
    };
    let received = timeout(Duration::from_secs(30), collect)
        .await
        .expect("reliable transfer timed out");

    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload, "reliable stream corrupted in transit");

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_handles() -> Result<()> {
    let agent = Agent::new(loopback_config(true, false)).await?;

    assert_eq!(
        agent.gather_candidates(42).await,
        Err(crate::Error::ErrUnknownStream)
    );
    assert_eq!(
        agent.get_local_credentials(42).await.err(),
        Some(crate::Error::ErrUnknownStream)
    );

    let stream_id = agent.add_stream(1).await?;
    assert_eq!(
        agent.get_local_candidates(stream_id, 9).await.err(),
        Some(crate::Error::ErrUnknownComponent)
    );

    agent.close().await?;

    assert_eq!(agent.add_stream(1).await.err(), Some(crate::Error::ErrClosed));
    Ok(())
}
