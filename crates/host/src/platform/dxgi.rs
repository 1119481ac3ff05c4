//! Desktop duplication capture (DXGI).
//!
//! One duplication session per monitor, created lazily by the pipeline. The
//! acquire path copies the duplicated surface into a CPU-readable staging
//! texture and materializes BGRA honoring the mapped row pitch.

use crate::capture::{ACQUIRE_TIMEOUT_MS, Acquire, CapturedFrame, DuplicationBackend};
use anyhow::{Context, Result, bail};
use p2prd_protocol::MonitorDescriptor;
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_FLAG, D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE,
    D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING, D3D11CreateDevice, ID3D11Device,
    ID3D11DeviceContext, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_FRAME_INFO, DXGI_OUTPUT_DESC, IDXGIDevice,
    IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
};
use windows::core::Interface;

pub struct DxgiDuplication {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
}

// COM interface pointers move with the session; the pipeline serializes all
// access behind its own lock.
unsafe impl Send for DxgiDuplication {}

/// Factory handed to the capture pipeline.
pub fn new_duplication(
    monitor: &MonitorDescriptor,
) -> Result<Box<dyn DuplicationBackend>> {
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;
    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            windows::Win32::Foundation::HMODULE::default(),
            D3D11_CREATE_DEVICE_FLAG(0),
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .context("D3D11 device creation failed")?;
    }
    let device = device.context("D3D11 device missing")?;
    let context = context.context("D3D11 context missing")?;

    let dxgi_device: IDXGIDevice = device.cast().context("IDXGIDevice unavailable")?;
    let adapter = unsafe { dxgi_device.GetAdapter() }.context("No DXGI adapter")?;

    let target: Vec<u16> = monitor.id.encode_utf16().collect();
    let mut index = 0u32;
    let duplication = loop {
        let output = match unsafe { adapter.EnumOutputs(index) } {
            Ok(output) => output,
            Err(_) => bail!("No DXGI output matches monitor {}", monitor.id),
        };
        index += 1;

        let mut desc = DXGI_OUTPUT_DESC::default();
        if unsafe { output.GetDesc(&mut desc) }.is_err() {
            continue;
        }
        let name_len = desc
            .DeviceName
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(desc.DeviceName.len());
        if desc.DeviceName[..name_len] != target[..] {
            continue;
        }

        let output1: IDXGIOutput1 = output.cast().context("IDXGIOutput1 unavailable")?;
        break unsafe { output1.DuplicateOutput(&device) }
            .context("DuplicateOutput failed (protected content or RDP session?)")?;
    };

    Ok(Box::new(DxgiDuplication {
        device,
        context,
        duplication,
    }))
}

impl DuplicationBackend for DxgiDuplication {
    fn acquire(&mut self) -> Result<Acquire> {
        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        match unsafe {
            self.duplication
                .AcquireNextFrame(ACQUIRE_TIMEOUT_MS, &mut info, &mut resource)
        } {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(Acquire::Timeout),
            Err(e) => return Err(e).context("AcquireNextFrame failed"),
        }

        let result = (|| {
            let resource = resource.context("Duplication returned no resource")?;
            let texture: ID3D11Texture2D =
                resource.cast().context("Duplicated resource is not a texture")?;

            let mut desc = D3D11_TEXTURE2D_DESC::default();
            unsafe { texture.GetDesc(&mut desc) };
            let mut staging_desc = desc;
            staging_desc.Usage = D3D11_USAGE_STAGING;
            staging_desc.BindFlags = 0;
            staging_desc.CPUAccessFlags = D3D11_CPU_ACCESS_READ.0 as u32;
            staging_desc.MiscFlags = 0;

            let mut staging: Option<ID3D11Texture2D> = None;
            unsafe {
                self.device
                    .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                    .context("Staging texture creation failed")?;
            }
            let staging = staging.context("Staging texture missing")?;
            unsafe { self.context.CopyResource(&staging, &texture) };

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            unsafe {
                self.context
                    .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                    .context("Staging map failed")?;
            }

            let width = desc.Width;
            let height = desc.Height;
            let row_bytes = (width * 4) as usize;
            let mut pixels = vec![0u8; row_bytes * height as usize];
            let src = mapped.pData as *const u8;
            for row in 0..height as usize {
                let src_row = unsafe { src.add(row * mapped.RowPitch as usize) };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src_row,
                        pixels[row * row_bytes..].as_mut_ptr(),
                        row_bytes,
                    );
                }
            }
            unsafe { self.context.Unmap(&staging, 0) };

            Ok(Acquire::Frame(CapturedFrame {
                width,
                height,
                pixels,
            }))
        })();

        unsafe {
            let _ = self.duplication.ReleaseFrame();
        }
        result
    }
}
