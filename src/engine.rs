//! The boundary between render tasks and a rendering engine.
//!
//! A backend implements [`RenderEngine`]; the task installs an [`EventSink`]
//! into the engine's single callback slot for the duration of its execution
//! and receives every navigation callback as one [`NavigationEvent`].

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;

use crate::task::TaskMessage;
use crate::{Error, NavigationResponse, Result};

/// Name of the out-of-band channel a page uses to declare it has loaded
/// everything a scripted interaction needs.
pub const EARLY_SIGNAL_CHANNEL: &str = "doneLoading";

/// Core trait for rendering engine backends.
///
/// Implementations are shared between the caller and the task that drives
/// them, so they must be `Send + Sync`; tasks only ever hold a weak reference.
pub trait RenderEngine: Send + Sync {
    /// Whether a navigation is currently in progress
    fn is_loading(&self) -> bool;

    /// Begin navigating to `url`. Must not block until the load completes;
    /// progress is reported through the attached [`EventSink`].
    fn load_url(&self, url: &str) -> Result<()>;

    /// URL of the current document, if any
    fn current_url(&self) -> Option<String> {
        None
    }

    /// Install the navigation callback handler. The engine holds at most one
    /// registrant and must reject a second with [`Error::HandlerSlotOccupied`].
    fn attach(&self, sink: EventSink) -> Result<()>;

    /// Remove the navigation callback handler, if any
    fn detach(&self);

    /// Expose a named message channel the page content can post to
    fn add_message_channel(&self, name: &str);

    /// Remove a previously exposed message channel
    fn remove_message_channel(&self, name: &str);

    /// Evaluate JavaScript against the current document
    fn evaluate_script(&self, script: &str) -> Result<serde_json::Value>;

    /// Abandon any in-flight loading
    fn stop_loading(&self);
}

/// Decision returned for a navigation response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePolicy {
    Allow,
    Cancel,
}

/// A username/password pair supplied in answer to a credential challenge
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the engine should proceed with a credential challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDisposition {
    /// Retry the request with the given credential
    UseCredential(Credential),
    /// Let the engine apply its default behaviour
    PerformDefaultHandling,
    /// Abort the navigation
    CancelAuthenticationChallenge,
    /// Ignore this protection space and continue without credentials
    RejectProtectionSpace,
}

/// An authentication challenge raised while loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// URL that issued the challenge
    pub url: String,
    /// Authentication scheme, e.g. `Basic`
    pub scheme: String,
    /// Protection space realm, if advertised
    pub realm: Option<String>,
    /// Number of credentials already rejected for this request
    pub previous_failure_count: u32,
}

/// Callback deciding how a credential challenge is answered
pub type AuthHandler = Arc<dyn Fn(&AuthChallenge) -> ChallengeDisposition + Send + Sync>;

/// One-shot answer channel for events the engine waits on.
///
/// Dropping a `Reply` without sending tells the engine to fall back to its
/// default handling.
pub struct Reply<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Reply<T> {
    /// Create a reply and the receiver the engine waits on
    pub fn channel() -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Answer the engine. A receiver that already gave up is ignored.
    pub fn send(self, value: T) {
        let _ = self.tx.send(value);
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reply")
    }
}

/// Navigation lifecycle callbacks, delivered as a single tagged type
#[derive(Debug)]
pub enum NavigationEvent {
    /// A provisional navigation started
    Started,
    /// The main document response arrived and awaits a policy decision
    ResponseReceived {
        response: NavigationResponse,
        decision: Reply<ResponsePolicy>,
    },
    /// Navigation failed before any content was committed
    ProvisionalFailed(Error),
    /// Navigation failed after content was committed
    Failed(Error),
    /// Navigation finished
    Finished,
    /// The server demands credentials
    Challenge {
        challenge: AuthChallenge,
        reply: Reply<ChallengeDisposition>,
    },
    /// The page posted on a named message channel
    ScriptMessage {
        name: String,
        body: serde_json::Value,
    },
}

/// Engine-facing handle that forwards callbacks into a task's mailbox.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TaskMessage>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<TaskMessage>) -> Self {
        Self { tx }
    }

    /// Deliver an event. Returns `false` when the receiving task is gone.
    pub fn emit(&self, event: NavigationEvent) -> bool {
        self.tx.send(TaskMessage::Navigation(event)).is_ok()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_reply_disconnects_receiver() {
        let (reply, rx) = Reply::<ResponsePolicy>::channel();
        drop(reply);
        assert!(rx.recv().is_err());

        let (reply, rx) = Reply::channel();
        reply.send(ResponsePolicy::Allow);
        assert_eq!(rx.recv().unwrap(), ResponsePolicy::Allow);
    }

    #[test]
    fn credential_debug_hides_password() {
        let cred = Credential::new("user", "passwd");
        let shown = format!("{:?}", cred);
        assert!(shown.contains("user"));
        assert!(!shown.contains("passwd"));
    }

    #[test]
    fn sink_reports_closed_mailbox() {
        let (tx, rx) = mpsc::channel();
        let sink = EventSink::new(tx);
        assert!(sink.emit(NavigationEvent::Started));
        drop(rx);
        assert!(!sink.emit(NavigationEvent::Finished));
    }
}
