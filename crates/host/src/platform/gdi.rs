//! GDI screen grab, the capture fallback when duplication is unavailable
//! (older GPUs, some RDP and secure-desktop configurations).

use crate::capture::{CapturedFrame, GrabBackend};
use anyhow::{Context, Result, bail};
use p2prd_protocol::MonitorDescriptor;
use windows::Win32::Graphics::Gdi::{
    BI_RGB, BITMAPINFO, BITMAPINFOHEADER, BitBlt, CAPTUREBLT, CreateCompatibleBitmap,
    CreateCompatibleDC, DIB_RGB_COLORS, DeleteDC, DeleteObject, GetDC, GetDIBits, ROP_CODE,
    ReleaseDC, SRCCOPY, SelectObject,
};

pub struct GdiGrab;

impl GdiGrab {
    pub fn new() -> Self {
        Self
    }
}

// GDI handles are created and destroyed within each call.
unsafe impl Send for GdiGrab {}

impl GrabBackend for GdiGrab {
    fn grab(&mut self, monitor: &MonitorDescriptor) -> Result<CapturedFrame> {
        let s = monitor.effective_dpi_scale;
        let x = (monitor.bounds.left as f64 * s).round() as i32;
        let y = (monitor.bounds.top as f64 * s).round() as i32;
        let width = (monitor.bounds.width as f64 * s).round() as i32;
        let height = (monitor.bounds.height as f64 * s).round() as i32;
        if width <= 0 || height <= 0 {
            bail!("Monitor {} has empty bounds", monitor.id);
        }

        unsafe {
            let screen = GetDC(None);
            if screen.is_invalid() {
                bail!("GetDC failed");
            }
            let mem = CreateCompatibleDC(Some(screen));
            let bitmap = CreateCompatibleBitmap(screen, width, height);
            let previous = SelectObject(mem, bitmap.into());

            let result = (|| {
                let rop = ROP_CODE(SRCCOPY.0 | CAPTUREBLT.0);
                BitBlt(mem, 0, 0, width, height, Some(screen), x, y, rop)
                    .context("BitBlt failed")?;

                let mut info = BITMAPINFO {
                    bmiHeader: BITMAPINFOHEADER {
                        biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                        biWidth: width,
                        // Negative height requests a top-down DIB.
                        biHeight: -height,
                        biPlanes: 1,
                        biBitCount: 32,
                        biCompression: BI_RGB.0,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let mut pixels = vec![0u8; (width * height * 4) as usize];
                let copied = GetDIBits(
                    mem,
                    bitmap,
                    0,
                    height as u32,
                    Some(pixels.as_mut_ptr() as *mut _),
                    &mut info,
                    DIB_RGB_COLORS,
                );
                if copied == 0 {
                    bail!("GetDIBits failed");
                }
                // GDI leaves the pad byte undefined; make it opaque alpha.
                for px in pixels.chunks_exact_mut(4) {
                    px[3] = 0xFF;
                }
                Ok(CapturedFrame {
                    width: width as u32,
                    height: height as u32,
                    pixels,
                })
            })();

            SelectObject(mem, previous);
            let _ = DeleteObject(bitmap.into());
            let _ = DeleteDC(mem);
            ReleaseDC(None, screen);
            result
        }
    }
}
