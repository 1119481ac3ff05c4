//! Scoped switching onto the active input desktop.
//!
//! Capture and input injection must run on whichever desktop currently
//! receives input (the logon or UAC secure desktop included). The switch is
//! modelled as an RAII guard: the previous desktop is restored when the guard
//! drops, on every exit path. A missed restore would strand the worker thread
//! on the secure desktop.

use tracing::debug;

/// Restores the prior desktop on drop.
pub trait DesktopGuard: Send {}

pub trait DesktopSwitcher: Send + Sync {
    /// Attach the calling thread to the active input desktop for the lifetime
    /// of the returned guard. Failures degrade to a no-op guard; the callers
    /// (capture, input) proceed on the current desktop.
    fn enter(&self) -> Box<dyn DesktopGuard>;
}

/// No-op switcher for platforms without desktop stations.
pub struct NullDesktopSwitcher;

struct NullGuard;
impl DesktopGuard for NullGuard {}

impl DesktopSwitcher for NullDesktopSwitcher {
    fn enter(&self) -> Box<dyn DesktopGuard> {
        debug!("Desktop switching unavailable on this platform");
        Box::new(NullGuard)
    }
}

/// The platform switcher: real input-desktop attachment on Windows, the
/// no-op elsewhere.
pub fn platform_switcher() -> Box<dyn DesktopSwitcher> {
    #[cfg(windows)]
    {
        Box::new(crate::platform::WinDesktopSwitcher)
    }
    #[cfg(not(windows))]
    {
        Box::new(NullDesktopSwitcher)
    }
}
