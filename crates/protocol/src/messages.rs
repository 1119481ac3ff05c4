use crate::input::{KeyboardInput, MouseInput, SpecialAction};
use crate::monitor::MonitorDescriptor;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A password travelling over the wire or IPC. Redacted in Debug output so
/// accidental logging never leaks it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Password(pub String);

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Outcome of an `auth` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Ok,
    Invalid,
    Locked,
}

/// Every JSON message exchanged over signaling and the control data channel.
///
/// Both transports carry the same envelope; the host picks the open one per
/// message (control channel preferred, signaling as fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Operator requests a session.
    OperatorHello { session_id: Uuid },
    /// Host accepts: identity plus current display inventory.
    HostHello {
        host_id: String,
        monitors: Vec<MonitorDescriptor>,
        active_monitor_id: String,
    },
    /// Operator asks for a fresh display inventory.
    MonitorListRequest { session_id: Uuid },
    MonitorList {
        monitors: Vec<MonitorDescriptor>,
        active_monitor_id: String,
    },
    /// Operator selects the monitor to stream and drive.
    MonitorSwitch { id: String },
    MonitorSwitchResult { active_monitor_id: String },
    Auth {
        password: Password,
    },
    AuthResult {
        status: AuthStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    Input {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mouse: Option<MouseInput>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keyboard: Option<KeyboardInput>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        special: Option<SpecialAction>,
    },
    /// Lease is held by another session.
    HostBusy { reason: String },
    /// ICE connection state surfaced for the operator UI.
    IceState { state: String },
    SdpOffer {
        sdp: String,
        sdp_type: String,
    },
    SdpAnswer {
        sdp: String,
        sdp_type: String,
    },
    IceCandidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
    /// Last-resort frame delivery over a text transport, base64 payload.
    Frame {
        width: u32,
        height: u32,
        format: String,
        data: String,
    },
}

impl WireMessage {
    pub fn host_busy_active_session() -> Self {
        WireMessage::HostBusy {
            reason: "active_session".to_string(),
        }
    }
}

/// Message sent by the relay immediately after a successful upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Welcome { role: String },
}
