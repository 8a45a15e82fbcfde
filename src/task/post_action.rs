//! What happens between the engine reporting "finished" and extraction.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::{Error, SCRAPING_SCRIPT};

use super::RenderTask;

/// Delay between two evaluations of a [`PostAction::Validate`] condition
pub const VALIDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Policy applied once after navigation finishes, before extraction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PostAction {
    /// Extract immediately
    #[default]
    None,
    /// Wait a fixed duration, then extract
    Wait(Duration),
    /// Evaluate a boolean script expression every [`VALIDATE_INTERVAL`]
    /// until it yields `true`, then extract
    Validate(String),
}

/// Timer state of a post-action that is in flight
#[derive(Debug, Default)]
pub(super) enum PolicyState {
    #[default]
    Idle,
    Waiting {
        until: Instant,
    },
    Validating {
        condition: String,
        next_check: Instant,
    },
}

impl PolicyState {
    pub(super) fn due(&self) -> Option<Instant> {
        match self {
            PolicyState::Idle => None,
            PolicyState::Waiting { until } => Some(*until),
            PolicyState::Validating { next_check, .. } => Some(*next_check),
        }
    }

    fn is_pending(&self) -> bool {
        !matches!(self, PolicyState::Idle)
    }
}

impl RenderTask {
    pub(super) fn on_finished(&mut self) {
        if self.policy.is_pending() {
            log::debug!("Post-action already running - {}", self.name());
            return;
        }
        // Taking the policy guarantees it runs at most once per task.
        match std::mem::take(&mut self.post_action) {
            PostAction::None => self.finished_loading(),
            PostAction::Wait(delay) => {
                log::debug!("Waiting {:?} before extraction", delay);
                self.policy = PolicyState::Waiting {
                    until: Instant::now() + delay,
                };
            }
            PostAction::Validate(condition) => self.validate(condition),
        }
    }

    pub(super) fn on_policy_timer(&mut self) {
        match std::mem::take(&mut self.policy) {
            PolicyState::Idle => {}
            PolicyState::Waiting { .. } => self.finished_loading(),
            PolicyState::Validating { condition, .. } => self.validate(condition),
        }
    }

    fn validate(&mut self, condition: String) {
        if self.stop {
            return;
        }
        let Some(engine) = self.engine() else {
            self.complete_rendering(None, Some(Error::EngineGone));
            return;
        };
        let passed = match engine.evaluate_script(&condition) {
            Ok(Value::Bool(value)) => value,
            Ok(_) => false,
            Err(err) => {
                log::debug!("Validation script failed: {}", err);
                false
            }
        };
        drop(engine);

        if passed {
            self.finished_loading();
        } else {
            self.policy = PolicyState::Validating {
                condition,
                next_check: Instant::now() + VALIDATE_INTERVAL,
            };
        }
    }

    /// Run the scraping script and complete with its string value.
    ///
    /// Anything other than a string (including a script error) leaves the
    /// result empty; the task still completes.
    pub(super) fn finished_loading(&mut self) {
        let Some(engine) = self.engine() else {
            self.complete_rendering(None, Some(Error::EngineGone));
            return;
        };
        let payload = match engine.evaluate_script(SCRAPING_SCRIPT) {
            Ok(Value::String(text)) => Some(text.into_bytes()),
            Ok(other) => {
                log::warn!("Extraction returned a non-string value: {}", other);
                None
            }
            Err(err) => {
                log::warn!("Extraction failed: {}", err);
                None
            }
        };
        drop(engine);

        {
            let mut state = self.shared.lock();
            if state.is_live() {
                state.result = payload;
            }
        }
        self.complete_rendering(None, None);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::scripted::{ScriptedEngine, ScriptedEvent, Step};
    use crate::RenderOptions;

    fn finishing_engine() -> ScriptedEngine {
        ScriptedEngine::new(vec![
            Step::Emit(ScriptedEvent::Response { status: 200 }),
            Step::Emit(ScriptedEvent::Finished),
        ])
    }

    #[test]
    fn policy_state_due_times() {
        assert!(PolicyState::Idle.due().is_none());
        let at = Instant::now();
        assert_eq!(PolicyState::Waiting { until: at }.due(), Some(at));
        let validating = PolicyState::Validating {
            condition: "true".into(),
            next_check: at,
        };
        assert!(validating.is_pending());
        assert_eq!(validating.due(), Some(at));
    }

    #[test]
    fn wait_delays_extraction() {
        let engine = Arc::new(finishing_engine().with_script_result(SCRAPING_SCRIPT, json!("x")));
        let mut task = RenderTask::new("wait", &engine, RenderOptions::default())
            .with_navigation("https://example.test/")
            .with_post_action(PostAction::Wait(Duration::from_millis(300)));
        let started = Instant::now();
        task.start();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(task.result(), Some(b"x".to_vec()));
    }

    #[test]
    fn second_finish_does_not_short_circuit_wait() {
        let engine = Arc::new(
            ScriptedEngine::new(vec![
                Step::Emit(ScriptedEvent::Finished),
                Step::Emit(ScriptedEvent::Finished),
            ])
            .with_script_result(SCRAPING_SCRIPT, json!("x")),
        );
        let mut task = RenderTask::new("double-finish", &engine, RenderOptions::default())
            .with_navigation("https://example.test/")
            .with_post_action(PostAction::Wait(Duration::from_millis(250)));
        let started = Instant::now();
        task.start();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(engine.evaluations(SCRAPING_SCRIPT).len(), 1);
    }

    #[test]
    fn non_string_extraction_leaves_result_empty() {
        let engine = Arc::new(finishing_engine().with_script_result(SCRAPING_SCRIPT, json!(42)));
        let mut task = RenderTask::new("number", &engine, RenderOptions::default())
            .with_navigation("https://example.test/");
        task.start();
        assert!(task.is_finished());
        assert!(!task.is_cancelled());
        assert!(task.result().is_none());
        assert!(task.error().is_none());
    }

    #[test]
    fn extraction_script_error_is_not_a_task_error() {
        // No scripted result: evaluation fails.
        let engine = Arc::new(finishing_engine());
        let mut task = RenderTask::new("script-error", &engine, RenderOptions::default())
            .with_navigation("https://example.test/");
        task.start();
        assert!(task.is_finished());
        assert!(task.result().is_none());
        assert!(task.error().is_none());
    }

    #[test]
    fn validate_treats_non_boolean_as_false() {
        let engine = Arc::new(
            finishing_engine()
                .with_script_results("window.ready", vec![json!("yes"), json!(true)])
                .with_script_result(SCRAPING_SCRIPT, json!("done")),
        );
        let mut task = RenderTask::new("validate", &engine, RenderOptions::default())
            .with_navigation("https://example.test/")
            .with_post_action(PostAction::Validate("window.ready".into()));
        task.start();
        assert_eq!(engine.evaluations("window.ready").len(), 2);
        assert_eq!(task.result(), Some(b"done".to_vec()));
    }
}
