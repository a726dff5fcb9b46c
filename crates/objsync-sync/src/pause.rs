//! Pause gate for the local watch source
//!
//! The sync manager pauses the watch source for the duration of a full
//! reconciliation so that files it writes locally are not reported back as
//! local changes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use objsync_core::ports::IWatchControl;
use tracing::{debug, error};

/// Reference-counted pause switch shared between the watcher and the manager
///
/// Clones share the same counter. Events are suppressed while the count is
/// above zero.
#[derive(Debug, Clone, Default)]
pub struct PauseGate {
    depth: Arc<AtomicUsize>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    /// Current pause depth
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl IWatchControl for PauseGate {
    fn pause(&self) {
        let previous = self.depth.fetch_add(1, Ordering::AcqRel);
        debug!(depth = previous + 1, "Watch source paused");
    }

    fn resume(&self) {
        let result = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
        match result {
            Ok(previous) => debug!(depth = previous - 1, "Watch source resumed"),
            Err(_) => {
                error!("Watch source resumed without a matching pause");
                debug_assert!(false, "resume() without matching pause()");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_is_reference_counted() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());

        gate.pause();
        gate.pause();
        assert_eq!(gate.depth(), 2);

        gate.resume();
        assert!(gate.is_paused());
        gate.resume();
        assert!(!gate.is_paused());
    }

    #[test]
    fn test_clones_share_state() {
        let gate = PauseGate::new();
        let watcher_side = gate.clone();
        gate.pause();
        assert!(watcher_side.is_paused());
        gate.resume();
        assert!(!watcher_side.is_paused());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "without matching pause"))]
    fn test_resume_without_pause() {
        let gate = PauseGate::new();
        gate.resume();
        assert_eq!(gate.depth(), 0);
    }
}
