//! Active console session watcher.
//!
//! Polls the OS for the session currently attached to the physical console
//! (session 0 isolation means the service never owns it) and publishes
//! transitions on a watch channel. The capture pipeline resets its desktop
//! duplication on every transition, since duplication interfaces go stale
//! across fast-user-switch and logon boundaries.

use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[cfg(windows)]
fn active_console_session() -> u32 {
    unsafe { windows::Win32::System::RemoteDesktop::WTSGetActiveConsoleSessionId() }
}

#[cfg(not(windows))]
fn active_console_session() -> u32 {
    0
}

pub struct ConsoleWatcher {
    cancel: CancellationToken,
    tx: watch::Sender<u32>,
}

impl ConsoleWatcher {
    pub fn new(cancel: CancellationToken) -> (Self, watch::Receiver<u32>) {
        let (tx, rx) = watch::channel(active_console_session());
        (Self { cancel, tx }, rx)
    }

    pub async fn run(self) {
        let mut current = *self.tx.borrow();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            let session = active_console_session();
            if session != current {
                info!(from = current, to = session, "Console session changed");
                current = session;
                let _ = self.tx.send(session);
            }
        }
    }
}
