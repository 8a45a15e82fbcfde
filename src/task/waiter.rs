//! Blocking wait that keeps draining the host's pending callbacks.

use std::time::Duration;

/// Something that can run its ready callbacks for a bounded slice of time.
pub(crate) trait Pump {
    /// Process pending work, returning no later than `budget` from now.
    fn pump(&mut self, budget: Duration);
}

/// Repeatedly pumps a host in fixed slices until a predicate holds.
///
/// Has no timeout of its own: callers arrange for the predicate to become
/// true on cancellation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CooperativeWaiter {
    slice: Duration,
}

impl CooperativeWaiter {
    pub(crate) const SLICE: Duration = Duration::from_millis(100);

    pub(crate) fn new() -> Self {
        Self { slice: Self::SLICE }
    }

    pub(crate) fn wait_until<P, F>(&self, host: &mut P, mut done: F)
    where
        P: Pump,
        F: FnMut(&P) -> bool,
    {
        while !done(host) {
            host.pump(self.slice);
            log::trace!(".");
        }
    }
}

impl Default for CooperativeWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        ticks: u32,
        budgets: Vec<Duration>,
    }

    impl Pump for Counter {
        fn pump(&mut self, budget: Duration) {
            self.ticks += 1;
            self.budgets.push(budget);
        }
    }

    #[test]
    fn pumps_until_predicate_holds() {
        let mut host = Counter { ticks: 0, budgets: Vec::new() };
        CooperativeWaiter::new().wait_until(&mut host, |h| h.ticks == 3);
        assert_eq!(host.ticks, 3);
        assert!(host.budgets.iter().all(|b| *b == CooperativeWaiter::SLICE));
    }

    #[test]
    fn satisfied_predicate_never_pumps() {
        let mut host = Counter { ticks: 0, budgets: Vec::new() };
        CooperativeWaiter::new().wait_until(&mut host, |_| true);
        assert_eq!(host.ticks, 0);
    }
}
