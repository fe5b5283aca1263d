use super::*;

#[test]
fn test_tcp_type_from_str() {
    assert_eq!(TcpType::from("active"), TcpType::Active);
    assert_eq!(TcpType::from("passive"), TcpType::Passive);
    assert_eq!(TcpType::from("so"), TcpType::SimultaneousOpen);
    assert_eq!(TcpType::from("something else"), TcpType::Unspecified);
}

#[test]
fn test_tcp_type_compatibility() {
    assert!(TcpType::Active.compatible(TcpType::Passive));
    assert!(TcpType::Passive.compatible(TcpType::Active));
    assert!(TcpType::SimultaneousOpen.compatible(TcpType::SimultaneousOpen));
    assert!(!TcpType::Active.compatible(TcpType::Active));
    assert!(!TcpType::Passive.compatible(TcpType::SimultaneousOpen));
}
