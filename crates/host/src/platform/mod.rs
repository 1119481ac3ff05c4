//! Windows implementations of the platform capability traits.
//!
//! Everything here is `#[cfg(windows)]`; other platforms run the synthetic
//! capture and no-op input backends wired up by the trait modules.

#![cfg(windows)]

pub mod dxgi;
pub mod gdi;
mod desktop;
mod input;
mod monitors;

pub use desktop::WinDesktopSwitcher;
pub use input::WinInputBackend;
pub use monitors::WinMonitorSource;
