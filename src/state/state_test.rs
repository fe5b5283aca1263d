use super::*;

#[test]
fn test_component_state_roundtrip() {
    let states = vec![
        ComponentState::Disconnected,
        ComponentState::Gathering,
        ComponentState::Connecting,
        ComponentState::Connected,
        ComponentState::Ready,
        ComponentState::Failed,
    ];

    for state in states {
        assert_eq!(ComponentState::from(state as u8), state);
    }
}

#[test]
fn test_component_state_ordering() {
    // Ordinary progress is strictly increasing, which lets the component
    // reject backwards transitions with a plain comparison.
    assert!(ComponentState::Disconnected < ComponentState::Gathering);
    assert!(ComponentState::Gathering < ComponentState::Connecting);
    assert!(ComponentState::Connecting < ComponentState::Connected);
    assert!(ComponentState::Connected < ComponentState::Ready);
}

#[test]
fn test_gathering_state_roundtrip() {
    for state in [
        GatheringState::New,
        GatheringState::Gathering,
        GatheringState::Complete,
    ] {
        assert_eq!(GatheringState::from(state as u8), state);
    }
}
