use std::time::{Duration, Instant};

/// One-shot deadline for a running task.
///
/// The guard is a plain deadline polled by the task's pump, so disarming it
/// is enough to guarantee it never fires afterwards. Arming replaces any
/// previous deadline; only one is live at a time.
#[derive(Debug, Default)]
pub(crate) struct TimeoutGuard {
    deadline: Option<Instant>,
}

impl TimeoutGuard {
    pub(crate) fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the deadline if it has passed. Returns `true` exactly once.
    pub(crate) fn fire_if_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if now >= at => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_after_deadline() {
        let mut guard = TimeoutGuard::default();
        guard.arm(Duration::from_millis(50));
        let start = Instant::now();
        assert!(!guard.fire_if_expired(start));
        let later = start + Duration::from_millis(60);
        assert!(guard.fire_if_expired(later));
        assert!(!guard.fire_if_expired(later));
        assert!(guard.deadline().is_none());
    }

    #[test]
    fn disarmed_guard_never_fires() {
        let mut guard = TimeoutGuard::default();
        guard.arm(Duration::ZERO);
        guard.disarm();
        assert!(!guard.fire_if_expired(Instant::now() + Duration::from_secs(1)));
    }

    #[test]
    fn rearming_replaces_deadline() {
        let mut guard = TimeoutGuard::default();
        guard.arm(Duration::from_secs(60));
        let first = guard.deadline().unwrap();
        guard.arm(Duration::ZERO);
        assert!(guard.deadline().unwrap() < first);
    }
}
