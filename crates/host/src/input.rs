//! Input injection: normalized operator events onto the local desktop.
//!
//! Coordinate mapping and message decomposition live here; the actual
//! synthesis sits behind [`InputBackend`] (SendInput on Windows, a logging
//! no-op elsewhere). Every call runs under an input-desktop guard so
//! injection follows session switches onto the secure desktop.

use crate::desktop::DesktopSwitcher;
use anyhow::Result;
use p2prd_protocol::{KeyboardInput, MouseInput, MonitorDescriptor, SpecialAction};
use std::sync::Arc;
use tracing::{debug, warn};

/// One native wheel detent per operator "notch".
pub const WHEEL_DELTA: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    X1,
    X2,
}

pub trait InputBackend: Send + Sync {
    fn mouse_move(&self, px: i32, py: i32) -> Result<()>;
    fn mouse_button(&self, button: MouseButton, down: bool) -> Result<()>;
    /// Wheel deltas in native units (already scaled by [`WHEEL_DELTA`]).
    fn mouse_wheel(&self, vertical: i32, horizontal: i32) -> Result<()>;
    fn key_scancode(&self, scancode: u16, extended: bool, down: bool) -> Result<()>;
    fn secure_attention(&self) -> Result<()>;
}

/// Backend for platforms without an injection primitive: every operation is
/// a logged no-op.
pub struct NullInputBackend;

impl InputBackend for NullInputBackend {
    fn mouse_move(&self, px: i32, py: i32) -> Result<()> {
        debug!(px, py, "Input backend unavailable, mouse move dropped");
        Ok(())
    }
    fn mouse_button(&self, button: MouseButton, down: bool) -> Result<()> {
        debug!(?button, down, "Input backend unavailable, button dropped");
        Ok(())
    }
    fn mouse_wheel(&self, vertical: i32, horizontal: i32) -> Result<()> {
        debug!(vertical, horizontal, "Input backend unavailable, wheel dropped");
        Ok(())
    }
    fn key_scancode(&self, scancode: u16, extended: bool, down: bool) -> Result<()> {
        debug!(scancode, extended, down, "Input backend unavailable, key dropped");
        Ok(())
    }
    fn secure_attention(&self) -> Result<()> {
        debug!("Secure attention unavailable on this platform");
        Ok(())
    }
}

pub fn platform_backend() -> Arc<dyn InputBackend> {
    #[cfg(windows)]
    {
        Arc::new(crate::platform::WinInputBackend)
    }
    #[cfg(not(windows))]
    {
        Arc::new(NullInputBackend)
    }
}

pub struct InputInjector {
    backend: Arc<dyn InputBackend>,
    desktop: Arc<dyn DesktopSwitcher>,
}

impl InputInjector {
    pub fn new(backend: Arc<dyn InputBackend>, desktop: Arc<dyn DesktopSwitcher>) -> Self {
        Self { backend, desktop }
    }

    /// Apply one `input` message against the active monitor. Individual
    /// synthesis failures are logged, never fatal.
    pub fn handle(
        &self,
        mouse: Option<&MouseInput>,
        keyboard: Option<&KeyboardInput>,
        special: Option<SpecialAction>,
        monitor: &MonitorDescriptor,
    ) {
        let _desktop = self.desktop.enter();

        if let Some(mouse) = mouse {
            self.handle_mouse(mouse, monitor);
        }
        if let Some(key) = keyboard
            && let Err(e) = self
                .backend
                .key_scancode(key.scancode, key.extended, key.down)
        {
            warn!("Key injection failed: {e:#}");
        }
        if let Some(SpecialAction::CtrlAltDel) = special
            && let Err(e) = self.backend.secure_attention()
        {
            warn!("Secure attention failed: {e:#}");
        }
    }

    fn handle_mouse(&self, mouse: &MouseInput, monitor: &MonitorDescriptor) {
        if let (Some(x), Some(y)) = (mouse.x, mouse.y) {
            let (px, py) = monitor.to_physical(x, y);
            if let Err(e) = self.backend.mouse_move(px, py) {
                warn!("Mouse move failed: {e:#}");
            }
        }

        let transitions = [
            (MouseButton::Left, mouse.left),
            (MouseButton::Right, mouse.right),
            (MouseButton::Middle, mouse.middle),
            (MouseButton::X1, mouse.x1),
            (MouseButton::X2, mouse.x2),
        ];
        for (button, state) in transitions {
            if let Some(down) = state
                && let Err(e) = self.backend.mouse_button(button, down)
            {
                warn!(?button, "Button injection failed: {e:#}");
            }
        }

        let vertical = mouse.wheel_y.map(to_wheel_units).unwrap_or(0);
        let horizontal = mouse.wheel_x.map(to_wheel_units).unwrap_or(0);
        if (vertical != 0 || horizontal != 0)
            && let Err(e) = self.backend.mouse_wheel(vertical, horizontal)
        {
            warn!("Wheel injection failed: {e:#}");
        }
    }
}

fn to_wheel_units(notches: f64) -> i32 {
    (notches * WHEEL_DELTA).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2prd_protocol::Rect;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    enum Call {
        Move(i32, i32),
        Button(MouseButton, bool),
        Wheel(i32, i32),
        Key(u16, bool, bool),
        Sas,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
    }

    impl InputBackend for Recorder {
        fn mouse_move(&self, px: i32, py: i32) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Move(px, py));
            Ok(())
        }
        fn mouse_button(&self, button: MouseButton, down: bool) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Button(button, down));
            Ok(())
        }
        fn mouse_wheel(&self, vertical: i32, horizontal: i32) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Wheel(vertical, horizontal));
            Ok(())
        }
        fn key_scancode(&self, scancode: u16, extended: bool, down: bool) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Key(scancode, extended, down));
            Ok(())
        }
        fn secure_attention(&self) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Sas);
            Ok(())
        }
    }

    fn monitor() -> MonitorDescriptor {
        MonitorDescriptor {
            id: "0".to_string(),
            name: "Test".to_string(),
            bounds: Rect::new(1920, 0, 2560, 1440),
            effective_dpi_scale: 1.5,
        }
    }

    fn injector() -> (Arc<Recorder>, InputInjector) {
        let recorder = Arc::new(Recorder::default());
        let injector = InputInjector::new(
            Arc::clone(&recorder) as Arc<dyn InputBackend>,
            Arc::new(crate::desktop::NullDesktopSwitcher),
        );
        (recorder, injector)
    }

    #[test]
    fn mouse_position_maps_through_bounds_and_dpi() {
        let (rec, inj) = injector();
        let mouse = MouseInput {
            x: Some(0.0),
            y: Some(0.0),
            ..Default::default()
        };
        inj.handle(Some(&mouse), None, None, &monitor());
        assert_eq!(rec.calls.lock().unwrap()[0], Call::Move(2880, 0));
    }

    #[test]
    fn out_of_range_position_clamps() {
        let (rec, inj) = injector();
        let mouse = MouseInput {
            x: Some(5.0),
            y: Some(-1.0),
            ..Default::default()
        };
        inj.handle(Some(&mouse), None, None, &monitor());
        assert_eq!(rec.calls.lock().unwrap()[0], Call::Move(2880 + 3840, 0));
    }

    #[test]
    fn tristate_buttons_skip_none() {
        let (rec, inj) = injector();
        let mouse = MouseInput {
            left: Some(true),
            middle: Some(false),
            x2: Some(true),
            ..Default::default()
        };
        inj.handle(Some(&mouse), None, None, &monitor());
        let calls = rec.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                Call::Button(MouseButton::Left, true),
                Call::Button(MouseButton::Middle, false),
                Call::Button(MouseButton::X2, true),
            ]
        );
    }

    #[test]
    fn wheel_notches_scale_to_native_units() {
        let (rec, inj) = injector();
        let mouse = MouseInput {
            wheel_y: Some(-1.5),
            wheel_x: Some(0.25),
            ..Default::default()
        };
        inj.handle(Some(&mouse), None, None, &monitor());
        assert_eq!(rec.calls.lock().unwrap()[0], Call::Wheel(-180, 30));
    }

    #[test]
    fn zero_wheel_is_not_injected() {
        let (rec, inj) = injector();
        let mouse = MouseInput::default();
        inj.handle(Some(&mouse), None, None, &monitor());
        assert!(rec.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn keyboard_passes_scancode_flags() {
        let (rec, inj) = injector();
        let key = KeyboardInput {
            scancode: 0x1D,
            extended: true,
            down: true,
        };
        inj.handle(None, Some(&key), None, &monitor());
        assert_eq!(rec.calls.lock().unwrap()[0], Call::Key(0x1D, true, true));
    }

    #[test]
    fn ctrl_alt_del_invokes_secure_attention() {
        let (rec, inj) = injector();
        inj.handle(None, None, Some(SpecialAction::CtrlAltDel), &monitor());
        assert_eq!(rec.calls.lock().unwrap()[0], Call::Sas);
    }

    #[test]
    fn combined_message_applies_everything() {
        let (rec, inj) = injector();
        let mouse = MouseInput {
            x: Some(0.5),
            y: Some(0.5),
            left: Some(true),
            wheel_y: Some(1.0),
            ..Default::default()
        };
        let key = KeyboardInput {
            scancode: 30,
            extended: false,
            down: false,
        };
        inj.handle(Some(&mouse), Some(&key), None, &monitor());
        assert_eq!(rec.calls.lock().unwrap().len(), 4);
    }
}
