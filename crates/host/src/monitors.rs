//! Display enumeration and active-monitor tracking.
//!
//! Enumeration sits behind [`MonitorSource`] so the Windows implementation
//! (EnumDisplayMonitors + per-monitor DPI) and the synthetic single-display
//! source used on other platforms and in tests share one registry.

use p2prd_protocol::{MonitorDescriptor, Rect};
use tracing::{debug, warn};

pub trait MonitorSource: Send + Sync {
    /// Enumerate attached displays, primary first.
    fn enumerate(&self) -> Vec<MonitorDescriptor>;
}

/// Single fixed 1920x1080 display at scale 1.0. The production fallback when
/// no platform enumerator exists, and the deterministic source for tests.
pub struct SyntheticMonitorSource;

impl MonitorSource for SyntheticMonitorSource {
    fn enumerate(&self) -> Vec<MonitorDescriptor> {
        vec![MonitorDescriptor {
            id: "0".to_string(),
            name: "Synthetic Display".to_string(),
            bounds: Rect::new(0, 0, 1920, 1080),
            effective_dpi_scale: 1.0,
        }]
    }
}

pub struct MonitorRegistry {
    source: Box<dyn MonitorSource>,
    monitors: Vec<MonitorDescriptor>,
    active_id: String,
}

impl MonitorRegistry {
    pub fn new(source: Box<dyn MonitorSource>) -> Self {
        let mut registry = Self {
            source,
            monitors: Vec::new(),
            active_id: String::new(),
        };
        registry.refresh();
        registry
    }

    /// Re-enumerate displays, keeping the active selection when it survives
    /// and falling back to the primary when it does not (unplugged monitor).
    pub fn refresh(&mut self) {
        let mut monitors = self.source.enumerate();
        if monitors.is_empty() {
            warn!("Display enumeration returned nothing, using synthetic display");
            monitors = SyntheticMonitorSource.enumerate();
        }
        if !monitors.iter().any(|m| m.id == self.active_id) {
            self.active_id = monitors[0].id.clone();
        }
        debug!(count = monitors.len(), active = %self.active_id, "Monitors refreshed");
        self.monitors = monitors;
    }

    pub fn list(&self) -> &[MonitorDescriptor] {
        &self.monitors
    }

    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    /// The active descriptor; the primary when the active id has gone stale.
    pub fn active(&self) -> &MonitorDescriptor {
        self.resolve(&self.active_id)
    }

    /// Resolve an id to a descriptor, falling back to the primary on a miss
    /// rather than erroring.
    pub fn resolve(&self, id: &str) -> &MonitorDescriptor {
        self.monitors
            .iter()
            .find(|m| m.id == id)
            .unwrap_or(&self.monitors[0])
    }

    /// Switch the active monitor. An unknown id falls back to the primary;
    /// the returned id is always the one actually selected.
    pub fn switch(&mut self, id: &str) -> &str {
        if self.monitors.iter().any(|m| m.id == id) {
            self.active_id = id.to_string();
        } else {
            warn!(requested = id, "Unknown monitor id, falling back to primary");
            self.active_id = self.monitors[0].id.clone();
        }
        &self.active_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeSource {
        sets: Mutex<Vec<Vec<MonitorDescriptor>>>,
    }

    fn monitor(id: &str) -> MonitorDescriptor {
        MonitorDescriptor {
            id: id.to_string(),
            name: format!("Display {id}"),
            bounds: Rect::new(0, 0, 1920, 1080),
            effective_dpi_scale: 1.0,
        }
    }

    impl MonitorSource for FakeSource {
        fn enumerate(&self) -> Vec<MonitorDescriptor> {
            let mut sets = self.sets.lock().unwrap();
            if sets.len() > 1 {
                sets.remove(0)
            } else {
                sets[0].clone()
            }
        }
    }

    fn registry_with(sets: Vec<Vec<MonitorDescriptor>>) -> MonitorRegistry {
        MonitorRegistry::new(Box::new(FakeSource {
            sets: Mutex::new(sets),
        }))
    }

    #[test]
    fn primary_is_active_by_default() {
        let reg = registry_with(vec![vec![monitor("a"), monitor("b")]]);
        assert_eq!(reg.active_id(), "a");
        assert_eq!(reg.list().len(), 2);
    }

    #[test]
    fn switch_to_known_monitor() {
        let mut reg = registry_with(vec![vec![monitor("a"), monitor("b")]]);
        assert_eq!(reg.switch("b"), "b");
        assert_eq!(reg.active().id, "b");
    }

    #[test]
    fn switch_to_unknown_falls_back_to_primary() {
        let mut reg = registry_with(vec![vec![monitor("a"), monitor("b")]]);
        reg.switch("b");
        assert_eq!(reg.switch("zz"), "a");
    }

    #[test]
    fn resolve_miss_returns_primary() {
        let reg = registry_with(vec![vec![monitor("a"), monitor("b")]]);
        assert_eq!(reg.resolve("gone").id, "a");
    }

    #[test]
    fn refresh_keeps_active_when_it_survives() {
        let mut reg = registry_with(vec![
            vec![monitor("a"), monitor("b")],
            vec![monitor("a"), monitor("b"), monitor("c")],
        ]);
        reg.switch("b");
        reg.refresh();
        assert_eq!(reg.active_id(), "b");
        assert_eq!(reg.list().len(), 3);
    }

    #[test]
    fn refresh_falls_back_when_active_unplugged() {
        let mut reg = registry_with(vec![
            vec![monitor("a"), monitor("b")],
            vec![monitor("a")],
        ]);
        reg.switch("b");
        reg.refresh();
        assert_eq!(reg.active_id(), "a");
    }

    #[test]
    fn empty_enumeration_yields_synthetic_display() {
        let reg = registry_with(vec![vec![]]);
        assert_eq!(reg.list().len(), 1);
        assert_eq!(reg.active().name, "Synthetic Display");
    }
}
