//! Input-desktop attachment for the capture/injection worker threads.

use crate::desktop::{DesktopGuard, DesktopSwitcher};
use tracing::debug;
use windows::Win32::System::StationsAndDesktops::{
    CloseDesktop, DESKTOP_ACCESS_FLAGS, DF_ALLOWOTHERACCOUNTHOOK, GetThreadDesktop, HDESK,
    OpenInputDesktop, SetThreadDesktop,
};
use windows::Win32::System::Threading::GetCurrentThreadId;

const GENERIC_ALL: u32 = 0x1000_0000;

pub struct WinDesktopSwitcher;

struct WinDesktopGuard {
    previous: Option<HDESK>,
    entered: HDESK,
}

// HDESK values are plain handles; the guard stays on the thread that
// created it for its whole scope.
unsafe impl Send for WinDesktopGuard {}

impl DesktopGuard for WinDesktopGuard {}

impl Drop for WinDesktopGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(previous) = self.previous {
                let _ = SetThreadDesktop(previous);
            }
            let _ = CloseDesktop(self.entered);
        }
    }
}

struct NoopGuard;
impl DesktopGuard for NoopGuard {}

impl DesktopSwitcher for WinDesktopSwitcher {
    fn enter(&self) -> Box<dyn DesktopGuard> {
        unsafe {
            let previous = GetThreadDesktop(GetCurrentThreadId()).ok();
            let input = match OpenInputDesktop(
                DF_ALLOWOTHERACCOUNTHOOK,
                false,
                DESKTOP_ACCESS_FLAGS(GENERIC_ALL),
            ) {
                Ok(desktop) => desktop,
                Err(e) => {
                    debug!("OpenInputDesktop failed: {e}");
                    return Box::new(NoopGuard);
                }
            };
            if SetThreadDesktop(input).is_err() {
                debug!("SetThreadDesktop failed, staying on current desktop");
                let _ = CloseDesktop(input);
                return Box::new(NoopGuard);
            }
            Box::new(WinDesktopGuard {
                previous,
                entered: input,
            })
        }
    }
}
