use super::*;

#[test]
fn test_network_type_is_udp() {
    assert!(NetworkType::Udp4.is_udp());
    assert!(NetworkType::Udp6.is_udp());
    assert!(!NetworkType::Udp4.is_tcp());
    assert!(!NetworkType::Udp6.is_tcp());
}

#[test]
fn test_network_type_is_tcp() {
    assert!(NetworkType::Tcp4.is_tcp());
    assert!(NetworkType::Tcp6.is_tcp());
    assert!(!NetworkType::Tcp4.is_udp());
    assert!(!NetworkType::Tcp6.is_udp());
}

#[test]
fn test_determine_network_type() -> Result<()> {
    let ipv4: IpAddr = "192.168.0.1".parse()?;
    let ipv6: IpAddr = "fe80::a3:6ff:fec4:5454".parse()?;

    assert_eq!(determine_network_type("udp", &ipv4)?, NetworkType::Udp4);
    assert_eq!(determine_network_type("udp", &ipv6)?, NetworkType::Udp6);
    assert_eq!(determine_network_type("tcp", &ipv4)?, NetworkType::Tcp4);
    assert_eq!(determine_network_type("tcp", &ipv6)?, NetworkType::Tcp6);
    assert!(determine_network_type("sctp", &ipv4).is_err());

    Ok(())
}
