use super::exchange::*;
use super::*;
use crate::error::Result;

#[test]
fn test_exchange_line_roundtrip() -> Result<()> {
    let line = ExchangeLine {
        ufrag: "FVOxiSuV".to_owned(),
        pwd: "AOQpWTxoHTFLMDaObKaCgStg".to_owned(),
        candidates: vec![
            ExchangeCandidate {
                foundation: "2706108017".to_owned(),
                priority: 2130706431,
                ip: "192.168.0.196".parse().unwrap(),
                port: 53987,
                candidate_type: CandidateType::Host,
            },
            ExchangeCandidate {
                foundation: "1052353102".to_owned(),
                priority: 1694498815,
                ip: "1.2.3.4".parse().unwrap(),
                port: 5000,
                candidate_type: CandidateType::ServerReflexive,
            },
        ],
    };

    let raw = line.marshal();
    assert_eq!(
        raw,
        "FVOxiSuV AOQpWTxoHTFLMDaObKaCgStg \
         <2706108017,2130706431,192.168.0.196,53987,host> \
         <1052353102,1694498815,1.2.3.4,5000,srflx>"
    );

    let parsed = ExchangeLine::parse(&raw)?;
    assert_eq!(parsed, line);

    Ok(())
}

#[test]
fn test_exchange_line_type_tokens() -> Result<()> {
    let raw = "u p <f,1,10.0.0.1,1000,host> <f,2,10.0.0.2,1001,srflx> \
               <f,3,10.0.0.3,1002,prflx> <f,4,10.0.0.4,1003,relay>";
    let parsed = ExchangeLine::parse(raw)?;
    assert_eq!(
        parsed
            .candidates
            .iter()
            .map(|c| c.candidate_type)
            .collect::<Vec<_>>(),
        vec![
            CandidateType::Host,
            CandidateType::ServerReflexive,
            CandidateType::PeerReflexive,
            CandidateType::Relay,
        ]
    );
    Ok(())
}

#[test]
fn test_exchange_line_parse_errors() {
    for raw in [
        "",
        "onlyufrag",
        "u p <missing,fields>",
        "u p <f,notanumber,10.0.0.1,1000,host>",
        "u p <f,1,10.0.0.1,1000,bogus>",
        "u p f,1,10.0.0.1,1000,host",
    ] {
        assert!(ExchangeLine::parse(raw).is_err(), "expected error for {raw}");
    }
}

#[test]
fn test_exchange_candidate_into_candidate() -> Result<()> {
    let cand = ExchangeCandidate {
        foundation: "f1".to_owned(),
        priority: 1234,
        ip: "10.0.0.9".parse().unwrap(),
        port: 4242,
        candidate_type: CandidateType::Host,
    };

    let built = cand.into_candidate(1)?;
    assert_eq!(built.candidate_type(), CandidateType::Host);
    assert_eq!(built.priority(), 1234);
    assert_eq!(built.port(), 4242);
    assert_eq!(built.foundation(), "f1");

    Ok(())
}
