use wa_gateway::types::{DeviceStatus, MessageStatus, QrFormat, ServerStatus};

#[test]
fn test_message_status_strings() {
    for status in MessageStatus::ALL {
        assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
    }
    assert_eq!("queued".parse::<MessageStatus>().unwrap(), MessageStatus::Queued);
    assert!("DELIVERED".parse::<MessageStatus>().is_err());
}

#[test]
fn test_message_status_serde() {
    let json = serde_json::to_string(&MessageStatus::Cancelled).unwrap();
    assert_eq!(json, "\"CANCELLED\"");
}

#[test]
fn test_message_terminal_states() {
    let terminal: Vec<_> = MessageStatus::ALL.into_iter().filter(|s| s.is_terminal()).collect();
    assert_eq!(
        terminal,
        vec![MessageStatus::Sent, MessageStatus::Failed, MessageStatus::Cancelled]
    );
    for status in MessageStatus::ACTIVE {
        assert!(status.is_active());
    }
}

#[test]
fn test_message_transitions() {
    assert!(MessageStatus::Queued.can_transition_to(MessageStatus::Processing));
    assert!(MessageStatus::Scheduled.can_transition_to(MessageStatus::Cancelled));
    assert!(MessageStatus::Processing.can_transition_to(MessageStatus::Pending));
    assert!(!MessageStatus::Processing.can_transition_to(MessageStatus::Cancelled));
    for next in MessageStatus::ALL {
        assert!(!MessageStatus::Sent.can_transition_to(next));
    }
}

#[test]
fn test_device_pairing_path() {
    assert!(DeviceStatus::Authenticating.can_transition_to(DeviceStatus::Connecting));
    assert!(DeviceStatus::Connecting.can_transition_to(DeviceStatus::Connected));
}

#[test]
fn test_device_never_skips_to_disconnected_while_authenticating() {
    assert!(!DeviceStatus::Authenticating.can_transition_to(DeviceStatus::Disconnected));
    assert!(!DeviceStatus::Authenticating.can_transition_to(DeviceStatus::Connected));
}

#[test]
fn test_device_failures_and_relink() {
    for status in DeviceStatus::ALL {
        if status != DeviceStatus::Error {
            assert!(status.can_transition_to(DeviceStatus::Error));
        }
    }
    assert!(DeviceStatus::Connected.can_transition_to(DeviceStatus::Disconnected));
    assert!(DeviceStatus::Disconnected.can_transition_to(DeviceStatus::Connecting));
    assert!(DeviceStatus::Error.can_transition_to(DeviceStatus::Authenticating));
    assert!(!DeviceStatus::Disconnected.can_transition_to(DeviceStatus::Connected));
}

#[test]
fn test_server_status_lowercase() {
    assert_eq!(serde_json::to_string(&ServerStatus::Maintenance).unwrap(), "\"maintenance\"");
    assert_eq!("Active".parse::<ServerStatus>().unwrap(), ServerStatus::Active);
}

#[test]
fn test_qr_format_parse() {
    assert_eq!(QrFormat::default(), QrFormat::Json);
    assert_eq!("IMAGE".parse::<QrFormat>().unwrap(), QrFormat::Image);
    assert_eq!("base64".parse::<QrFormat>().unwrap(), QrFormat::Base64);
    assert!("svg".parse::<QrFormat>().is_err());
}
