use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use super::agent_config::AgentConfig;
use super::Agent;
use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::*;
use crate::error::Result;

fn host(address: &str, port: u16) -> Arc<dyn Candidate + Send + Sync> {
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

async fn agent_with_candidates(
    locals: Vec<Arc<dyn Candidate + Send + Sync>>,
    remotes: Vec<Arc<dyn Candidate + Send + Sync>>,
) -> Result<(Agent, u32)> {
    let agent = Agent::new(AgentConfig {
        is_controlling: true,
        ..Default::default()
    })
    .await?;
    let stream_id = agent.add_stream(1).await?;

    let stream = agent.internal.find_stream(stream_id).await?;
    let component = stream.component(1)?;
    for local in &locals {
        component.add_local_candidate(local).await?;
    }
    for remote in &remotes {
        component.add_remote_candidate(remote).await;
    }

    agent.internal.build_check_list(&stream).await;
    Ok((agent, stream_id))
}

#[tokio::test]
async fn test_check_list_uniqueness() -> Result<()> {
    let locals = vec![host("10.0.0.1", 1000), host("10.0.0.2", 1000)];
    let remotes = vec![host("10.1.0.1", 2000), host("10.1.0.2", 2000)];

    let (agent, stream_id) = agent_with_candidates(locals, remotes).await?;
    let stream = agent.internal.find_stream(stream_id).await?;

    // Re-running the build must not duplicate pairs.
    agent.internal.build_check_list(&stream).await;

    let checklist = stream.checklist.lock().await;
    assert_eq!(checklist.len(), 4);

    let mut seen = HashSet::new();
    for pair in checklist.iter() {
        let key = (pair.local.addr(), pair.remote.addr());
        assert!(seen.insert(key), "duplicate pair in check list: {pair}");
    }

    Ok(())
}

#[tokio::test]
async fn test_check_list_sorted_by_priority() -> Result<()> {
    let locals = vec![host("10.0.0.1", 1000), host("10.0.0.2", 1000)];
    let remotes = vec![host("10.1.0.1", 2000), host("10.1.0.2", 2000)];

    let (agent, stream_id) = agent_with_candidates(locals, remotes).await?;
    let stream = agent.internal.find_stream(stream_id).await?;

    let checklist = stream.checklist.lock().await;
    for window in checklist.windows(2) {
        assert!(window[0].priority() >= window[1].priority());
    }

    Ok(())
}

#[tokio::test]
async fn test_foundation_freeze() -> Result<()> {
    // Two locals with distinct bases and four remotes: several pairs share
    // a foundation.
    let locals = vec![host("10.0.0.1", 1000), host("10.0.0.2", 1000)];
    let remotes = vec![
        host("10.1.0.1", 2000),
        host("10.1.0.1", 2001),
        host("10.1.0.2", 2000),
        host("10.1.0.2", 2001),
    ];

    let (agent, stream_id) = agent_with_candidates(locals, remotes).await?;
    let stream = agent.internal.find_stream(stream_id).await?;

    let checklist = stream.checklist.lock().await;
    let mut per_foundation: HashMap<String, usize> = HashMap::new();
    for pair in checklist.iter() {
        match pair.state() {
            CandidatePairState::Waiting | CandidatePairState::InProgress => {
                *per_foundation.entry(pair.foundation()).or_insert(0) += 1;
            }
            CandidatePairState::Frozen => {}
            other => panic!("unexpected initial pair state {other}"),
        }
    }

    assert!(!per_foundation.is_empty(), "nothing was unfrozen");
    for (foundation, count) in per_foundation {
        assert_eq!(count, 1, "foundation {foundation} has {count} active pairs");
    }

    Ok(())
}

#[tokio::test]
async fn test_check_list_capped() -> Result<()> {
    let agent = Agent::new(AgentConfig {
        is_controlling: true,
        max_connectivity_checks: Some(10),
        ..Default::default()
    })
    .await?;
    let stream_id = agent.add_stream(1).await?;

    let stream = agent.internal.find_stream(stream_id).await?;
    let component = stream.component(1)?;
    for i in 0..4_u16 {
        component
            .add_local_candidate(&host(&format!("10.0.0.{}", i + 1), 1000))
            .await?;
    }
    for i in 0..5_u16 {
        component
            .add_remote_candidate(&host(&format!("10.1.0.{}", i + 1), 2000))
            .await;
    }

    agent.internal.build_check_list(&stream).await;

    let checklist = stream.checklist.lock().await;
    assert_eq!(checklist.len(), 10, "check list exceeded the cap");

    Ok(())
}

#[tokio::test]
async fn test_switch_role_recomputes_pair_priorities() -> Result<()> {
    let locals = vec![host("10.0.0.1", 1000)];
    // A lower remote priority makes G and D distinct, so the G/D swap is
    // observable.
    let remote = host("10.1.0.1", 2000);
    remote.set_priority(12345);
    let remotes = vec![remote];

    let (agent, stream_id) = agent_with_candidates(locals, remotes).await?;
    let stream = agent.internal.find_stream(stream_id).await?;

    let before = {
        let checklist = stream.checklist.lock().await;
        checklist[0].priority()
    };

    agent.internal.switch_role().await;

    let after = {
        let checklist = stream.checklist.lock().await;
        checklist[0].priority()
    };

    assert_ne!(before, after);

    Ok(())
}

#[tokio::test]
async fn test_prflx_priority_formula() -> Result<()> {
    let agent = Agent::new(AgentConfig::default()).await?;

    // 2^24*110 + 2^8*65535 + (256 - component)
    assert_eq!(agent.internal.prflx_priority(1), 1862270975);
    assert_eq!(
        agent.internal.prflx_priority(1) - 1,
        agent.internal.prflx_priority(2)
    );

    Ok(())
}
