//! Per-frame screen acquisition for the active monitor.
//!
//! Tiers, attempted in order on every call:
//!   1. GPU desktop duplication (lazy per-monitor session, 10 ms acquire)
//!   2. screen-grab primitive over the monitor bounds
//!   3. the previous frame (duplication timeout only)
//!   4. a synthetic placeholder carrying a UTC timestamp
//!
//! Duplication initialization failure poisons that tier until an explicit
//! [`CapturePipeline::reset`], which the console-session watcher issues when
//! the active session changes.

use crate::desktop::DesktopSwitcher;
use crate::monitors::MonitorRegistry;
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use p2prd_protocol::MonitorDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const ACQUIRE_TIMEOUT_MS: u32 = 10;

/// One captured frame, BGRA8, owned for the duration of a single encode+send
/// cycle.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl CapturedFrame {
    /// Encode the frame as PNG for the frames-channel fallback path.
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        use image::{ExtendedColorType, ImageEncoder, codecs::png::PngEncoder};

        let mut rgba = self.pixels.clone();
        for px in rgba.chunks_exact_mut(4) {
            px.swap(0, 2);
            px[3] = 0xFF;
        }
        let mut bytes = Vec::with_capacity(self.pixels.len() / 8);
        PngEncoder::new(&mut bytes).write_image(
            &rgba,
            self.width,
            self.height,
            ExtendedColorType::Rgba8,
        )?;
        Ok(bytes)
    }
}

/// Outcome of a duplication acquire: frames arrive only when the desktop
/// changed, so a timeout is an expected idle result.
pub enum Acquire {
    Frame(CapturedFrame),
    Timeout,
}

/// GPU desktop-duplication session for a single monitor.
pub trait DuplicationBackend: Send {
    fn acquire(&mut self) -> Result<Acquire>;
}

/// CPU screen-grab covering a monitor's bounds.
pub trait GrabBackend: Send {
    fn grab(&mut self, monitor: &MonitorDescriptor) -> Result<CapturedFrame>;
}

pub type DuplicationFactory =
    Box<dyn Fn(&MonitorDescriptor) -> Result<Box<dyn DuplicationBackend>> + Send>;

pub struct CapturePipeline {
    desktop: Arc<dyn DesktopSwitcher>,
    registry: Arc<Mutex<MonitorRegistry>>,
    dup_factory: Option<DuplicationFactory>,
    sessions: HashMap<String, Box<dyn DuplicationBackend>>,
    dup_poisoned: bool,
    grab: Option<Box<dyn GrabBackend>>,
    last: Option<CapturedFrame>,
}

impl CapturePipeline {
    pub fn new(
        desktop: Arc<dyn DesktopSwitcher>,
        registry: Arc<Mutex<MonitorRegistry>>,
        dup_factory: Option<DuplicationFactory>,
        grab: Option<Box<dyn GrabBackend>>,
    ) -> Self {
        Self {
            desktop,
            registry,
            dup_factory,
            sessions: HashMap::new(),
            dup_poisoned: false,
            grab,
            last: None,
        }
    }

    /// The platform pipeline: DXGI duplication + GDI grab on Windows, the
    /// placeholder generator elsewhere.
    pub fn platform(
        desktop: Arc<dyn DesktopSwitcher>,
        registry: Arc<Mutex<MonitorRegistry>>,
    ) -> Self {
        #[cfg(windows)]
        {
            Self::new(
                desktop,
                registry,
                Some(Box::new(crate::platform::dxgi::new_duplication)),
                Some(Box::new(crate::platform::gdi::GdiGrab::new())),
            )
        }
        #[cfg(not(windows))]
        {
            Self::new(desktop, registry, None, None)
        }
    }

    /// Capture one frame for `monitor_id`, resolving unknown ids to the
    /// primary monitor. Never fails: the placeholder tier always produces.
    pub fn capture(&mut self, monitor_id: &str) -> CapturedFrame {
        let monitor = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.resolve(monitor_id).clone()
        };

        let _desktop = self.desktop.enter();

        if let Some(frame) = self.try_duplication(&monitor) {
            self.last = Some(frame.clone());
            return frame;
        }

        if let Some(grab) = self.grab.as_mut() {
            match grab.grab(&monitor) {
                Ok(frame) => {
                    self.last = Some(frame.clone());
                    return frame;
                }
                Err(e) => warn!("Screen grab failed: {e:#}"),
            }
        }

        debug!("No capture backend produced a frame, emitting placeholder");
        placeholder_frame(Utc::now())
    }

    /// Duplication tier. Returns the previous frame on an acquire timeout so
    /// an idle desktop keeps streaming.
    fn try_duplication(&mut self, monitor: &MonitorDescriptor) -> Option<CapturedFrame> {
        if self.dup_poisoned {
            return None;
        }
        let factory = self.dup_factory.as_ref()?;

        if !self.sessions.contains_key(&monitor.id) {
            match factory(monitor) {
                Ok(session) => {
                    self.sessions.insert(monitor.id.clone(), session);
                }
                Err(e) => {
                    warn!(
                        monitor = %monitor.id,
                        "Desktop duplication init failed, disabling until reset: {e:#}"
                    );
                    self.dup_poisoned = true;
                    return None;
                }
            }
        }

        let session = self.sessions.get_mut(&monitor.id)?;
        match session.acquire() {
            Ok(Acquire::Frame(frame)) => Some(frame),
            Ok(Acquire::Timeout) => self.last.clone(),
            Err(e) => {
                warn!(monitor = %monitor.id, "Duplication acquire failed: {e:#}");
                self.sessions.remove(&monitor.id);
                None
            }
        }
    }

    /// Drop all duplication sessions and clear the poison flag. Called on
    /// console-session transitions, when the duplication interface goes stale.
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.dup_poisoned = false;
        self.last = None;
        debug!("Capture pipeline reset");
    }

    #[cfg(test)]
    fn poisoned(&self) -> bool {
        self.dup_poisoned
    }
}

/// A frame that keeps the pipeline observably alive when nothing can capture:
/// flat dark background with the UTC timestamp stamped into the first pixel
/// row, so consecutive placeholders differ second to second.
pub fn placeholder_frame(now: DateTime<Utc>) -> CapturedFrame {
    const W: u32 = 640;
    const H: u32 = 360;
    let mut pixels = vec![0u8; (W * H * 4) as usize];
    for px in pixels.chunks_exact_mut(4) {
        px[0] = 0x20;
        px[1] = 0x20;
        px[2] = 0x20;
        px[3] = 0xFF;
    }
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    for (i, b) in stamp.bytes().enumerate().take(W as usize) {
        let off = i * 4;
        pixels[off] = b;
        pixels[off + 1] = b;
        pixels[off + 2] = b;
    }
    CapturedFrame {
        width: W,
        height: H,
        pixels,
    }
}
