use super::*;
use crate::candidate::candidate_base::unmarshal_candidate;
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_relay::{CandidateRelayConfig, TurnServer};
use crate::candidate::candidate_server_reflexive::CandidateServerReflexiveConfig;

#[test]
fn test_candidate_priority() -> Result<()> {
    let host = CandidateHostConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "10.0.0.1".to_owned(),
            port: 1234,
            component: 1,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_host()?;

    // 2^24*126 + 2^8*65535 + (256 - 1)
    assert_eq!(host.priority(), 2130706431);

    let srflx = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "1.2.3.4".to_owned(),
            port: 1234,
            component: 1,
            ..Default::default()
        },
        rel_addr: "10.0.0.1".to_owned(),
        rel_port: 4321,
    }
    .new_candidate_server_reflexive()?;

    assert_eq!(srflx.priority(), 1694498815);

    Ok(())
}

#[test]
fn test_candidate_priority_unique_per_component() -> Result<()> {
    let make = |component: u16| -> Result<CandidateBase> {
        CandidateHostConfig {
            base_config: CandidateBaseConfig {
                network: "udp".to_owned(),
                address: "10.0.0.1".to_owned(),
                port: 1234,
                component,
                ..Default::default()
            },
            ..Default::default()
        }
        .new_candidate_host()
    };

    assert_ne!(make(1)?.priority(), make(2)?.priority());

    Ok(())
}

#[test]
fn test_candidate_foundation() -> Result<()> {
    let make = |address: &str| -> Result<CandidateBase> {
        CandidateHostConfig {
            base_config: CandidateBaseConfig {
                network: "udp".to_owned(),
                address: address.to_owned(),
                port: 1234,
                component: 1,
                ..Default::default()
            },
            ..Default::default()
        }
        .new_candidate_host()
    };

    // Same type and base address produce the same foundation, regardless of
    // the port.
    assert_eq!(make("10.0.0.1")?.foundation(), make("10.0.0.1")?.foundation());
    assert_ne!(make("10.0.0.1")?.foundation(), make("10.0.0.2")?.foundation());

    // A different type on the same base differs.
    let srflx = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "10.0.0.1".to_owned(),
            port: 1234,
            component: 1,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_server_reflexive()?;
    assert_ne!(make("10.0.0.1")?.foundation(), srflx.foundation());

    Ok(())
}

#[test]
fn test_relay_foundation_includes_server() -> Result<()> {
    let make = |server: &str| -> Result<CandidateBase> {
        CandidateRelayConfig {
            base_config: CandidateBaseConfig {
                network: "udp".to_owned(),
                address: "1.2.3.4".to_owned(),
                port: 2222,
                component: 1,
                ..Default::default()
            },
            rel_addr: "10.0.0.1".to_owned(),
            rel_port: 5000,
            turn_server: Some(Arc::new(TurnServer {
                addr: server.to_owned(),
                username: "user".to_owned(),
                password: "pass".to_owned(),
            })),
            ..Default::default()
        }
        .new_candidate_relay()
    };

    assert_eq!(
        make("turn1.example.org:3478")?.foundation(),
        make("turn1.example.org:3478")?.foundation()
    );
    assert_ne!(
        make("turn1.example.org:3478")?.foundation(),
        make("turn2.example.org:3478")?.foundation()
    );

    Ok(())
}

#[test]
fn test_candidate_marshal_roundtrip() -> Result<()> {
    let host = CandidateHostConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "192.168.0.196".to_owned(),
            port: 53987,
            component: 1,
            ..Default::default()
        },
        ..Default::default()
    }
    .new_candidate_host()?;

    let parsed = unmarshal_candidate(&host.marshal())?;
    assert!(parsed.equal(&host));

    let srflx = CandidateServerReflexiveConfig {
        base_config: CandidateBaseConfig {
            network: "udp".to_owned(),
            address: "1.2.3.4".to_owned(),
            port: 5000,
            component: 1,
            ..Default::default()
        },
        rel_addr: "192.168.0.196".to_owned(),
        rel_port: 53987,
    }
    .new_candidate_server_reflexive()?;

    let parsed = unmarshal_candidate(&srflx.marshal())?;
    assert!(parsed.equal(&srflx));

    Ok(())
}

#[test]
fn test_unmarshal_candidate_errors() {
    for raw in ["", "a b c", "foundation 1 udp notapriority 1.2.3.4 5000 typ host"] {
        assert!(unmarshal_candidate(raw).is_err(), "expected error for {raw}");
    }
}
