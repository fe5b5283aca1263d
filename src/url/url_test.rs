use super::*;

#[test]
fn test_parse_url_success() -> Result<()> {
    let tests = vec![
        (
            "stun:google.de",
            "stun:google.de:3478",
            SchemeType::Stun,
            "google.de",
            3478,
            ProtoType::Udp,
        ),
        (
            "stun:google.de:1234",
            "stun:google.de:1234",
            SchemeType::Stun,
            "google.de",
            1234,
            ProtoType::Udp,
        ),
        (
            "stun:[::1]:123",
            "stun:[::1]:123",
            SchemeType::Stun,
            "::1",
            123,
            ProtoType::Udp,
        ),
        (
            "turn:google.de",
            "turn:google.de:3478?transport=udp",
            SchemeType::Turn,
            "google.de",
            3478,
            ProtoType::Udp,
        ),
        (
            "turn:google.de?transport=udp",
            "turn:google.de:3478?transport=udp",
            SchemeType::Turn,
            "google.de",
            3478,
            ProtoType::Udp,
        ),
        (
            "turn:google.de:1234?transport=tcp",
            "turn:google.de:1234?transport=tcp",
            SchemeType::Turn,
            "google.de",
            1234,
            ProtoType::Tcp,
        ),
    ];

    for (raw, expected_url_string, expected_scheme, expected_host, expected_port, expected_proto) in
        tests
    {
        let url = Url::parse_url(raw)?;
        assert_eq!(url.scheme, expected_scheme, "{raw}");
        assert_eq!(url.to_string(), expected_url_string, "{raw}");
        assert_eq!(url.host, expected_host, "{raw}");
        assert_eq!(url.port, expected_port, "{raw}");
        assert_eq!(url.proto, expected_proto, "{raw}");
    }

    Ok(())
}

#[test]
fn test_parse_url_failure() {
    let tests = vec![
        "",
        "stun:google.de?transport=udp",
        "google.de",
        "turn:google.de?trans=udp",
        "turn:google.de?transport=ip",
    ];

    for raw in tests {
        let result = Url::parse_url(raw);
        assert!(result.is_err(), "expected error for {raw}");
    }
}
