use super::*;
use crate::error::Result;

#[test]
fn test_controlled_getter_setter() -> Result<()> {
    let mut m = Message::new();
    let mut c = AttrControlled(4321);
    let result = c.get_from(&m);
    if let Err(err) = result {
        assert_eq!(stun::Error::ErrAttributeNotFound, err);
    } else {
        panic!("expected error, but got ok");
    }

    m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    let mut c1 = AttrControlled::default();
    c1.get_from(&m1)?;

    assert_eq!(c1, c);

    Ok(())
}

#[test]
fn test_controlling_getter_setter() -> Result<()> {
    let mut m = Message::new();
    let mut c = AttrControlling(1234);
    let result = c.get_from(&m);
    if let Err(err) = result {
        assert_eq!(stun::Error::ErrAttributeNotFound, err);
    } else {
        panic!("expected error, but got ok");
    }

    m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    let mut c1 = AttrControlling::default();
    c1.get_from(&m1)?;

    assert_eq!(c1, c);

    Ok(())
}

#[test]
fn test_control_getter_setter() -> Result<()> {
    let mut m = Message::new();
    let mut c = AttrControl {
        role: Role::Controlled,
        tie_breaker: TieBreaker(4321),
    };
    let result = c.get_from(&m);
    if let Err(err) = result {
        assert_eq!(stun::Error::ErrAttributeNotFound, err);
    } else {
        panic!("expected error, but got ok");
    }

    m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    let mut c1 = AttrControl::default();
    c1.get_from(&m1)?;

    assert_eq!(c1, c);

    Ok(())
}

#[test]
fn test_role_other() {
    assert_eq!(Role::Controlling.other(), Role::Controlled);
    assert_eq!(Role::Controlled.other(), Role::Controlling);
}
