use serde::{Deserialize, Serialize};

/// Pointer portion of an `input` message.
///
/// Every field is optional so a single message can carry any combination of
/// movement, button transitions, and wheel deltas. Button fields are
/// tri-state: `Some(true)` = press, `Some(false)` = release, `None` =
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MouseInput {
    /// Normalized x within the active monitor, clamped to [0,1] on the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// Normalized y within the active monitor, clamped to [0,1] on the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x1: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x2: Option<bool>,
    /// Vertical wheel delta in notches; multiplied by 120 for the native unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wheel_y: Option<f64>,
    /// Horizontal wheel delta in notches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wheel_x: Option<f64>,
}

/// Keyboard portion of an `input` message. Carries a hardware scancode, not a
/// virtual key, so the host keyboard layout never remaps operator input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardInput {
    pub scancode: u16,
    /// Extended-key flag (E0 prefix: arrows, right ctrl/alt, nav cluster).
    #[serde(default)]
    pub extended: bool,
    pub down: bool,
}

/// Out-of-band actions that do not map to a synthesized input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialAction {
    /// Invoke the platform secure-attention sequence.
    CtrlAltDel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_skips_absent_fields() {
        let msg = MouseInput {
            x: Some(0.5),
            y: Some(0.25),
            ..Default::default()
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""x":0.5"#));
        assert!(!json.contains("left"));
        assert!(!json.contains("wheel_y"));
    }

    #[test]
    fn button_tristate_from_operator() {
        let msg: MouseInput = serde_json::from_str(r#"{"left":true,"right":false}"#).unwrap();
        assert_eq!(msg.left, Some(true));
        assert_eq!(msg.right, Some(false));
        assert_eq!(msg.middle, None);
        assert_eq!(msg.x, None);
    }

    #[test]
    fn keyboard_extended_defaults_false() {
        let msg: KeyboardInput = serde_json::from_str(r#"{"scancode":30,"down":true}"#).unwrap();
        assert_eq!(msg.scancode, 30);
        assert!(!msg.extended);
        assert!(msg.down);
    }

    #[test]
    fn special_action_snake_case() {
        let json = serde_json::to_string(&SpecialAction::CtrlAltDel).unwrap();
        assert_eq!(json, r#""ctrl_alt_del""#);
        let parsed: SpecialAction = serde_json::from_str(r#""ctrl_alt_del""#).unwrap();
        assert_eq!(parsed, SpecialAction::CtrlAltDel);
    }
}
