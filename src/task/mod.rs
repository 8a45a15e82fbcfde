//! Render tasks.
//!
//! A [`RenderTask`] turns a callback-driven engine into one unit of work with
//! a deterministic lifecycle:
//!
//! ```text
//! Pending -> Executing -> Finished
//!                      \-> Cancelled (finished and cancelled)
//! ```
//!
//! `start()` blocks its thread for the whole render. Everything that can end
//! the task (engine callbacks, the timeout, post-action timers and external
//! cancellation) arrives through the task's mailbox and is handled on that
//! thread, so every lifecycle transition has a single writer.

mod post_action;
mod sink;
mod timeout;
mod waiter;

pub use post_action::{PostAction, VALIDATE_INTERVAL};

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::activity::{ActivityIndicator, LogActivity};
use crate::engine::{
    AuthChallenge, AuthHandler, ChallengeDisposition, EventSink, NavigationEvent, RenderEngine,
    EARLY_SIGNAL_CHANNEL,
};
use crate::{Error, NavigationResponse, RenderOptions, RenderOutcome, Result};

use post_action::PolicyState;
use timeout::TimeoutGuard;
use waiter::{CooperativeWaiter, Pump};

/// Action invoked exactly once when the task starts executing, to perform
/// the navigation.
pub type RequestAction = Box<dyn FnOnce(&dyn RenderEngine) -> Result<()> + Send>;

/// Why a task was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    /// The task's timeout elapsed before it completed
    Timeout,
    /// Cancellation was requested by the caller
    Requested,
}

/// Observable lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Executing,
    Finished,
    Cancelled,
}

pub(crate) enum TaskMessage {
    Navigation(NavigationEvent),
    Cancel(CancelCause),
}

#[derive(Debug, Default)]
struct TaskState {
    executing: bool,
    finished: bool,
    cancelled: bool,
    cause: Option<CancelCause>,
    result: Option<Vec<u8>>,
    response: Option<NavigationResponse>,
    error: Option<Error>,
}

impl TaskState {
    fn is_live(&self) -> bool {
        self.executing && !self.finished
    }

    fn mark_cancelled(&mut self, cause: CancelCause) {
        if self.finished {
            return;
        }
        self.executing = false;
        self.finished = true;
        self.cancelled = true;
        self.cause = Some(cause);
    }

    fn phase(&self) -> Phase {
        match (self.executing, self.finished, self.cancelled) {
            (_, true, true) => Phase::Cancelled,
            (_, true, false) => Phase::Finished,
            (true, false, _) => Phase::Executing,
            _ => Phase::Pending,
        }
    }
}

struct Shared {
    name: String,
    state: Mutex<TaskState>,
    tx: Sender<TaskMessage>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable, thread-safe view of a task for schedulers and observers.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Request cancellation.
    ///
    /// A pending task is cancelled immediately and its `start()` becomes a
    /// no-op. An executing task is cancelled at its next mailbox check, on
    /// its own thread. Finished tasks are unaffected.
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        if state.finished {
            return;
        }
        if state.executing {
            drop(state);
            let _ = self.shared.tx.send(TaskMessage::Cancel(CancelCause::Requested));
        } else {
            log::debug!("Cancelling pending render - {}", self.shared.name);
            state.mark_cancelled(CancelCause::Requested);
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase()
    }

    pub fn is_executing(&self) -> bool {
        self.shared.lock().executing
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    pub fn cancel_cause(&self) -> Option<CancelCause> {
        self.shared.lock().cause
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .field("phase", &self.phase())
            .finish()
    }
}

/// One navigation-plus-extraction cycle against a rendering engine.
///
/// The task holds only a weak reference to the engine; it never keeps the
/// engine alive and drops the reference as soon as it terminates.
pub struct RenderTask {
    options: RenderOptions,
    post_action: PostAction,
    request: Option<RequestAction>,
    auth_handler: Option<AuthHandler>,
    activity: Arc<dyn ActivityIndicator>,
    engine: Option<Weak<dyn RenderEngine>>,
    registered: bool,
    stop: bool,
    guard: TimeoutGuard,
    policy: PolicyState,
    shared: Arc<Shared>,
    mailbox: Receiver<TaskMessage>,
}

impl RenderTask {
    /// Create a pending task bound to `engine`.
    pub fn new<E>(name: impl Into<String>, engine: &Arc<E>, options: RenderOptions) -> Self
    where
        E: RenderEngine + 'static,
    {
        let weak: Weak<dyn RenderEngine> = Arc::downgrade(engine) as Weak<E>;
        Self::from_weak(name, weak, options)
    }

    /// Create a pending task from an already type-erased engine reference.
    pub fn from_weak(
        name: impl Into<String>,
        engine: Weak<dyn RenderEngine>,
        options: RenderOptions,
    ) -> Self {
        let (tx, mailbox) = mpsc::channel();
        Self {
            options,
            post_action: PostAction::None,
            request: None,
            auth_handler: None,
            activity: Arc::new(LogActivity),
            engine: Some(engine),
            registered: false,
            stop: false,
            guard: TimeoutGuard::default(),
            policy: PolicyState::default(),
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(TaskState::default()),
                tx,
            }),
            mailbox,
        }
    }

    /// Set the action that performs the navigation once execution begins
    pub fn with_request<F>(mut self, request: F) -> Self
    where
        F: FnOnce(&dyn RenderEngine) -> Result<()> + Send + 'static,
    {
        self.request = Some(Box::new(request));
        self
    }

    /// Convenience request: load `url` in the engine
    pub fn with_navigation(self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.with_request(move |engine| engine.load_url(&url))
    }

    pub fn with_post_action(mut self, post_action: PostAction) -> Self {
        self.post_action = post_action;
        self
    }

    /// Answer credential challenges with `handler` instead of the engine's
    /// default handling
    pub fn with_auth_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AuthChallenge) -> ChallengeDisposition + Send + Sync + 'static,
    {
        self.auth_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_activity_indicator(mut self, activity: Arc<dyn ActivityIndicator>) -> Self {
        self.activity = activity;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase()
    }

    pub fn is_executing(&self) -> bool {
        self.shared.lock().executing
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    pub fn cancel_cause(&self) -> Option<CancelCause> {
        self.shared.lock().cause
    }

    /// Extracted payload, once the task has finished
    pub fn result(&self) -> Option<Vec<u8>> {
        self.shared.lock().result.clone()
    }

    pub fn response(&self) -> Option<NavigationResponse> {
        self.shared.lock().response.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.shared.lock().error.clone()
    }

    /// Snapshot of the task's terminal state
    pub fn outcome(&self) -> RenderOutcome {
        let state = self.shared.lock();
        RenderOutcome {
            name: self.shared.name.clone(),
            result: state.result.clone(),
            response: state.response.clone(),
            error: state.error.clone(),
            cancelled: state.cancelled,
            cancel_cause: state.cause,
        }
    }

    /// Run the task to completion on the calling thread.
    ///
    /// Waits for the engine to go idle, installs the task's callback
    /// registrations, invokes the request action and then blocks until the
    /// task finishes or is cancelled. A no-op for tasks that were cancelled
    /// (or already ran).
    pub fn start(&mut self) {
        {
            let mut state = self.shared.lock();
            if state.cancelled || state.finished {
                return;
            }
            state.executing = true;
        }
        log::debug!("Render started - {}", self.shared.name);
        self.stop = false;
        self.guard.arm(self.options.timeout);

        let waiter = CooperativeWaiter::new();
        waiter.wait_until(self, |task| task.stop || task.engine_idle());
        if self.stop {
            return;
        }

        let Some(engine) = self.engine() else {
            self.complete_rendering(None, Some(Error::EngineGone));
            return;
        };
        if let Err(err) = engine.attach(EventSink::new(self.shared.tx.clone())) {
            drop(engine);
            self.complete_rendering(None, Some(err));
            return;
        }
        self.registered = true;
        engine.add_message_channel(EARLY_SIGNAL_CHANNEL);

        if let Some(request) = self.request.take() {
            if let Err(err) = request(engine.as_ref()) {
                drop(engine);
                log::warn!("Request action failed - {}: {}", self.shared.name, err);
                self.complete_rendering(None, Some(err));
                return;
            }
        }
        drop(engine);

        waiter.wait_until(self, |task| task.stop);
        log::debug!("Render done - {} ({:?})", self.shared.name, self.phase());
    }

    /// Cancel from the owning thread. Same semantics as [`TaskHandle::cancel`]
    /// except that teardown runs immediately.
    pub fn cancel(&mut self) {
        self.cancel_with(CancelCause::Requested);
    }

    /// Finish the task, merging `result` and `error` into the slots.
    ///
    /// A provided value replaces the slot, `None` keeps what is there. Only
    /// the first call on an executing task has any effect.
    pub(crate) fn complete_rendering(&mut self, result: Option<Vec<u8>>, error: Option<Error>) {
        self.guard.disarm();
        self.stop = true;
        if !self.is_live() {
            return;
        }
        self.policy = PolicyState::Idle;
        self.teardown();

        let mut state = self.shared.lock();
        if result.is_some() {
            state.result = result;
        }
        if error.is_some() {
            state.error = error;
        }
        state.executing = false;
        state.finished = true;
    }

    pub(crate) fn cancel_with(&mut self, cause: CancelCause) {
        if self.shared.lock().finished {
            return;
        }
        log::debug!("Cancelling render - {} ({:?})", self.shared.name, cause);
        self.guard.disarm();
        self.stop = true;
        self.policy = PolicyState::Idle;
        self.teardown();
        self.shared.lock().mark_cancelled(cause);
    }

    fn teardown(&mut self) {
        if let Some(engine) = self.engine.take().and_then(|weak| weak.upgrade()) {
            if self.registered {
                engine.detach();
                engine.remove_message_channel(EARLY_SIGNAL_CHANNEL);
            }
        }
        self.registered = false;
        self.auth_handler = None;
    }

    fn engine(&self) -> Option<Arc<dyn RenderEngine>> {
        self.engine.as_ref().and_then(Weak::upgrade)
    }

    fn engine_idle(&self) -> bool {
        // A vanished engine counts as idle; start() then reports it.
        self.engine().map_or(true, |engine| !engine.is_loading())
    }

    fn is_live(&self) -> bool {
        self.shared.lock().is_live()
    }

    fn next_wakeup(&self) -> Option<Instant> {
        match (self.guard.deadline(), self.policy.due()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dispatch(&mut self, message: TaskMessage) {
        match message {
            TaskMessage::Cancel(cause) => self.cancel_with(cause),
            TaskMessage::Navigation(event) => self.on_navigation_event(event),
        }
    }

    fn fire_due_timers(&mut self, now: Instant) {
        let policy_due = self.policy.due().filter(|due| *due <= now);
        let guard_first = match (self.guard.deadline(), policy_due) {
            (Some(deadline), Some(due)) => deadline <= due,
            _ => true,
        };
        if guard_first && self.guard.fire_if_expired(now) {
            self.cancel_with(CancelCause::Timeout);
            return;
        }
        if policy_due.is_some() {
            self.on_policy_timer();
        }
        if self.guard.fire_if_expired(now) {
            self.cancel_with(CancelCause::Timeout);
        }
    }
}

impl Pump for RenderTask {
    fn pump(&mut self, budget: Duration) {
        let now = Instant::now();
        let wait = self
            .next_wakeup()
            .map_or(budget, |at| at.saturating_duration_since(now).min(budget));

        match self.mailbox.recv_timeout(wait) {
            Ok(message) => {
                self.dispatch(message);
                while !self.stop {
                    match self.mailbox.try_recv() {
                        Ok(message) => self.dispatch(message),
                        Err(_) => break,
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }

        if !self.stop {
            self.fire_due_timers(Instant::now());
        }
    }
}

impl fmt::Debug for RenderTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTask")
            .field("name", &self.shared.name)
            .field("phase", &self.phase())
            .field("post_action", &self.post_action)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedEngine, ScriptedEvent, Step};
    use crate::SCRAPING_SCRIPT;
    use serde_json::json;

    fn page_engine(html: &str) -> Arc<ScriptedEngine> {
        Arc::new(ScriptedEngine::page(html))
    }

    #[test]
    fn phases_follow_lifecycle() {
        let engine = page_engine("<html>ok</html>");
        let mut task = RenderTask::new("lifecycle", &engine, RenderOptions::default())
            .with_navigation("https://example.test/");
        assert_eq!(task.phase(), Phase::Pending);
        task.start();
        assert_eq!(task.phase(), Phase::Finished);
        assert!(!task.is_executing());
        assert!(!engine.is_attached());
        assert!(!engine.has_channel(EARLY_SIGNAL_CHANNEL));
    }

    #[test]
    fn cancelled_before_start_never_touches_engine() {
        let engine = page_engine("<html></html>");
        let mut task = RenderTask::new("pending", &engine, RenderOptions::default())
            .with_navigation("https://example.test/");
        task.handle().cancel();
        task.start();
        assert_eq!(task.phase(), Phase::Cancelled);
        assert_eq!(task.cancel_cause(), Some(CancelCause::Requested));
        assert_eq!(engine.attach_count(), 0);
        assert!(engine.loads().is_empty());
    }

    #[test]
    fn start_twice_is_a_noop() {
        let engine = page_engine("<p>once</p>");
        let mut task = RenderTask::new("twice", &engine, RenderOptions::default())
            .with_navigation("https://example.test/");
        task.start();
        task.start();
        assert_eq!(engine.loads().len(), 1);
        assert_eq!(engine.evaluations(SCRAPING_SCRIPT).len(), 1);
    }

    #[test]
    fn completion_after_finish_changes_nothing() {
        let engine = page_engine("<p>first</p>");
        let mut task = RenderTask::new("idempotent", &engine, RenderOptions::default())
            .with_navigation("https://example.test/");
        task.start();
        let before = task.outcome();

        task.complete_rendering(Some(b"second".to_vec()), Some(Error::Other("late".into())));
        task.cancel();
        task.cancel_with(CancelCause::Timeout);
        task.handle().cancel();

        assert_eq!(task.outcome(), before);
        assert_eq!(task.phase(), Phase::Finished);
    }

    #[test]
    fn request_failure_completes_with_error() {
        let engine = page_engine("<p></p>");
        let mut task = RenderTask::new("bad-request", &engine, RenderOptions::default())
            .with_request(|_| Err(Error::LoadError("bad url".into())));
        task.start();
        assert_eq!(task.error(), Some(Error::LoadError("bad url".into())));
        assert!(!task.is_cancelled());
        assert!(!engine.is_attached());
    }

    #[test]
    fn stale_events_after_completion_are_ignored() {
        let engine = Arc::new(
            ScriptedEngine::new(vec![
                Step::Emit(ScriptedEvent::Response { status: 200 }),
                Step::Emit(ScriptedEvent::Finished),
                Step::Emit(ScriptedEvent::ProvisionalFailed(Error::NavigationError(
                    "too late".into(),
                ))),
            ])
            .with_script_result(SCRAPING_SCRIPT, json!("<html></html>")),
        );
        let mut task = RenderTask::new("stale", &engine, RenderOptions::default())
            .with_navigation("https://example.test/");
        task.start();
        assert!(task.error().is_none());
        assert_eq!(task.result(), Some(b"<html></html>".to_vec()));
    }
}
