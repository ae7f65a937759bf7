use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Queued,
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
    Scheduled,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 7] = [
        MessageStatus::Queued,
        MessageStatus::Pending,
        MessageStatus::Processing,
        MessageStatus::Sent,
        MessageStatus::Failed,
        MessageStatus::Cancelled,
        MessageStatus::Scheduled,
    ];

    pub const ACTIVE: [MessageStatus; 4] = [
        MessageStatus::Queued,
        MessageStatus::Pending,
        MessageStatus::Scheduled,
        MessageStatus::Processing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Pending => "PENDING",
            MessageStatus::Processing => "PROCESSING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Cancelled => "CANCELLED",
            MessageStatus::Scheduled => "SCHEDULED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Failed | MessageStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Waiting in the queue and not yet claimed by a worker.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            MessageStatus::Queued | MessageStatus::Pending | MessageStatus::Scheduled
        )
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        match self {
            MessageStatus::Queued | MessageStatus::Pending | MessageStatus::Scheduled => matches!(
                next,
                MessageStatus::Processing | MessageStatus::Cancelled
            ),
            MessageStatus::Processing => matches!(
                next,
                MessageStatus::Sent | MessageStatus::Failed | MessageStatus::Pending
            ),
            MessageStatus::Sent | MessageStatus::Failed | MessageStatus::Cancelled => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseStatusError {
                kind: "message status",
                value: s.to_string(),
            })
    }
}

/// Lifecycle of a WhatsApp session bound to a device.
///
/// `AUTHENTICATING -> CONNECTING -> CONNECTED` is the pairing path. Any state
/// may fall to `ERROR`; established or establishing sessions may drop to
/// `DISCONNECTED`, from where a relink goes back through `CONNECTING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Authenticating,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl DeviceStatus {
    pub const ALL: [DeviceStatus; 5] = [
        DeviceStatus::Authenticating,
        DeviceStatus::Connecting,
        DeviceStatus::Connected,
        DeviceStatus::Disconnected,
        DeviceStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Authenticating => "AUTHENTICATING",
            DeviceStatus::Connecting => "CONNECTING",
            DeviceStatus::Connected => "CONNECTED",
            DeviceStatus::Disconnected => "DISCONNECTED",
            DeviceStatus::Error => "ERROR",
        }
    }

    /// Same-state updates are accepted as no-ops by callers; this only
    /// answers for real moves.
    pub fn can_transition_to(&self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        match (self, next) {
            (_, Error) => *self != Error,
            (Authenticating, Connecting) => true,
            (Connecting, Connected) | (Connecting, Disconnected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Error, Authenticating) | (Error, Connecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseStatusError {
                kind: "device status",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Inactive,
    Maintenance,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Active => "active",
            ServerStatus::Inactive => "inactive",
            ServerStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ServerStatus::Active),
            "inactive" => Ok(ServerStatus::Inactive),
            "maintenance" => Ok(ServerStatus::Maintenance),
            _ => Err(ParseStatusError {
                kind: "server status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrFormat {
    #[default]
    Json,
    Image,
    Base64,
}

impl FromStr for QrFormat {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(QrFormat::Json),
            "image" => Ok(QrFormat::Image),
            "base64" => Ok(QrFormat::Base64),
            _ => Err(ParseStatusError {
                kind: "qr format",
                value: s.to_string(),
            }),
        }
    }
}
