use crate::monitors::MonitorSource;
use p2prd_protocol::{MonitorDescriptor, Rect};
use tracing::warn;
use windows::Win32::Foundation::{BOOL, LPARAM, RECT, TRUE};
use windows::Win32::Graphics::Gdi::{
    EnumDisplayMonitors, GetMonitorInfoW, HDC, HMONITOR, MONITORINFO, MONITORINFOEXW,
    MONITORINFOF_PRIMARY,
};
use windows::Win32::UI::HiDpi::{GetDpiForMonitor, MDT_EFFECTIVE_DPI};

/// Enumerates displays via EnumDisplayMonitors. Ids are the GDI device names
/// (`\\.\DISPLAY1`…), which also key the DXGI output lookup.
pub struct WinMonitorSource;

unsafe extern "system" fn collect_monitor(
    monitor: HMONITOR,
    _hdc: HDC,
    _clip: *mut RECT,
    lparam: LPARAM,
) -> BOOL {
    let handles = unsafe { &mut *(lparam.0 as *mut Vec<HMONITOR>) };
    handles.push(monitor);
    TRUE
}

fn effective_scale(monitor: HMONITOR) -> f64 {
    let (mut dpi_x, mut dpi_y) = (96u32, 96u32);
    if unsafe { GetDpiForMonitor(monitor, MDT_EFFECTIVE_DPI, &mut dpi_x, &mut dpi_y) }.is_err() {
        return 1.0;
    }
    (dpi_x as f64 / 96.0).max(1.0)
}

impl MonitorSource for WinMonitorSource {
    fn enumerate(&self) -> Vec<MonitorDescriptor> {
        let mut handles: Vec<HMONITOR> = Vec::new();
        let ok = unsafe {
            EnumDisplayMonitors(
                None,
                None,
                Some(collect_monitor),
                LPARAM(&mut handles as *mut _ as isize),
            )
        };
        if !ok.as_bool() {
            warn!("EnumDisplayMonitors failed");
            return Vec::new();
        }

        let mut monitors = Vec::new();
        for handle in handles {
            let mut info = MONITORINFOEXW::default();
            info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;
            let ok = unsafe {
                GetMonitorInfoW(handle, &mut info.monitorInfo as *mut MONITORINFO)
            };
            if !ok.as_bool() {
                continue;
            }
            let device = String::from_utf16_lossy(
                &info.szDevice[..info
                    .szDevice
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(info.szDevice.len())],
            );
            let bounds = info.monitorInfo.rcMonitor;
            let primary = info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY != 0;
            let descriptor = MonitorDescriptor {
                id: device.clone(),
                name: device,
                bounds: Rect::new(
                    bounds.left,
                    bounds.top,
                    (bounds.right - bounds.left).max(0) as u32,
                    (bounds.bottom - bounds.top).max(0) as u32,
                ),
                effective_dpi_scale: effective_scale(handle),
            };
            if primary {
                monitors.insert(0, descriptor);
            } else {
                monitors.push(descriptor);
            }
        }
        monitors
    }
}
