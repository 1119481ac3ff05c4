use serde::{Deserialize, Serialize};

/// Rectangle in virtual-desktop pixels. `left`/`top` may be negative for
/// monitors positioned left of or above the primary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// A display as advertised to the operator.
///
/// `id` is stable for the lifetime of the host process but may change across
/// reboots (display ids are assigned by the OS enumeration order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorDescriptor {
    pub id: String,
    pub name: String,
    pub bounds: Rect,
    /// Effective DPI scale, 1.0 = 96 dpi. Always >= 1.0.
    pub effective_dpi_scale: f64,
}

impl MonitorDescriptor {
    /// Map normalized operator coordinates (each in [0,1], clamped) to a
    /// physical cursor position on this monitor. The bounds are in
    /// virtual-desktop pixels; the DPI scale converts them to physical.
    pub fn to_physical(&self, x: f64, y: f64) -> (i32, i32) {
        let s = self.effective_dpi_scale;
        let x = x.clamp(0.0, 1.0);
        let y = y.clamp(0.0, 1.0);
        let px = self.bounds.left as f64 * s + x * self.bounds.width as f64 * s;
        let py = self.bounds.top as f64 * s + y * self.bounds.height as f64 * s;
        (px.round() as i32, py.round() as i32)
    }

    /// Inverse of [`to_physical`]: recover normalized coordinates from a
    /// physical cursor position. Used by tests and the cursor readback path.
    pub fn normalize(&self, px: i32, py: i32) -> (f64, f64) {
        let s = self.effective_dpi_scale;
        let w = self.bounds.width as f64 * s;
        let h = self.bounds.height as f64 * s;
        if w <= 0.0 || h <= 0.0 {
            return (0.0, 0.0);
        }
        let x = (px as f64 - self.bounds.left as f64 * s) / w;
        let y = (py as f64 - self.bounds.top as f64 * s) / h;
        (x.clamp(0.0, 1.0), y.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(left: i32, top: i32, w: u32, h: u32, scale: f64) -> MonitorDescriptor {
        MonitorDescriptor {
            id: "m0".to_string(),
            name: "Test".to_string(),
            bounds: Rect::new(left, top, w, h),
            effective_dpi_scale: scale,
        }
    }

    #[test]
    fn corners_map_to_bounds() {
        let m = monitor(0, 0, 1920, 1080, 1.0);
        assert_eq!(m.to_physical(0.0, 0.0), (0, 0));
        assert_eq!(m.to_physical(1.0, 1.0), (1920, 1080));
        assert_eq!(m.to_physical(0.5, 0.5), (960, 540));
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        let m = monitor(0, 0, 1920, 1080, 1.0);
        assert_eq!(m.to_physical(-0.5, 2.0), (0, 1080));
        assert_eq!(m.to_physical(7.0, -7.0), (1920, 0));
    }

    #[test]
    fn offset_monitor_with_dpi_scale() {
        let m = monitor(1920, 0, 2560, 1440, 1.5);
        let (px, py) = m.to_physical(0.0, 0.0);
        assert_eq!((px, py), (2880, 0));
        let (px, py) = m.to_physical(1.0, 1.0);
        assert_eq!((px, py), (2880 + 3840, 2160));
    }

    #[test]
    fn negative_origin_monitor() {
        let m = monitor(-1920, -200, 1920, 1080, 1.0);
        assert_eq!(m.to_physical(0.0, 0.0), (-1920, -200));
        assert_eq!(m.to_physical(1.0, 1.0), (0, 880));
    }

    #[test]
    fn mapping_roundtrip_within_one_pixel() {
        // Mapping normalized coords into bounds and back recovers the input
        // up to one physical pixel of rounding error.
        let monitors = [
            monitor(0, 0, 1920, 1080, 1.0),
            monitor(1920, 0, 2560, 1440, 1.25),
            monitor(-3840, 100, 3840, 2160, 2.0),
        ];
        for m in &monitors {
            for i in 0..=20 {
                for j in 0..=20 {
                    let x = i as f64 / 20.0;
                    let y = j as f64 / 20.0;
                    let (px, py) = m.to_physical(x, y);
                    let (rx, ry) = m.normalize(px, py);
                    let tol_x = 1.0 / (m.bounds.width as f64 * m.effective_dpi_scale);
                    let tol_y = 1.0 / (m.bounds.height as f64 * m.effective_dpi_scale);
                    assert!((rx - x).abs() <= tol_x, "x {x} -> {rx} on {:?}", m.bounds);
                    assert!((ry - y).abs() <= tol_y, "y {y} -> {ry} on {:?}", m.bounds);
                }
            }
        }
    }

    #[test]
    fn descriptor_serializes_with_snake_case_fields() {
        let m = monitor(0, 0, 800, 600, 1.0);
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains(r#""effective_dpi_scale":1.0"#));
        assert!(json.contains(r#""bounds""#));
        let parsed: MonitorDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, m);
    }
}
