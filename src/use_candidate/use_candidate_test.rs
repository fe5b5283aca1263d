use super::*;
use crate::error::Result;

#[test]
fn test_use_candidate_attr_roundtrip() -> Result<()> {
    let mut m = Message::new();
    assert!(!UseCandidateAttr::is_set(&m), "should not be set");

    m.build(&[Box::new(BINDING_REQUEST), Box::<UseCandidateAttr>::default()])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;
    assert!(UseCandidateAttr::is_set(&m1), "should be set");

    Ok(())
}

#[test]
fn test_plain_request_is_not_a_nomination() -> Result<()> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST)])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;
    assert!(!UseCandidateAttr::is_set(&m1));

    Ok(())
}
