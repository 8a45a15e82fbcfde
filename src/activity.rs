/// Busy indicator shown while a task's navigation is in flight.
///
/// Hosts with a real activity spinner implement this; the defaults below log
/// or do nothing.
pub trait ActivityIndicator: Send + Sync {
    fn set_visible(&self, visible: bool);
}

/// Reports indicator changes through the `log` facade
#[derive(Debug, Default)]
pub struct LogActivity;

impl ActivityIndicator for LogActivity {
    fn set_visible(&self, visible: bool) {
        if visible {
            log::debug!("network activity started");
        } else {
            log::debug!("network activity stopped");
        }
    }
}

/// Ignores indicator changes
#[derive(Debug, Default)]
pub struct NoopActivity;

impl ActivityIndicator for NoopActivity {
    fn set_visible(&self, _visible: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<bool>>);

    impl ActivityIndicator for Recording {
        fn set_visible(&self, visible: bool) {
            self.0.lock().unwrap().push(visible);
        }
    }

    #[test]
    fn indicators_are_object_safe() {
        let rec = Recording(Mutex::new(Vec::new()));
        let indicators: Vec<&dyn ActivityIndicator> = vec![&LogActivity, &NoopActivity, &rec];
        for i in &indicators {
            i.set_visible(true);
            i.set_visible(false);
        }
        assert_eq!(*rec.0.lock().unwrap(), vec![true, false]);
    }
}
