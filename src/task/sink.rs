//! Handling of engine navigation callbacks.

use crate::engine::{ChallengeDisposition, NavigationEvent, ResponsePolicy, EARLY_SIGNAL_CHANNEL};
use crate::{Error, NavigationResponse};

use super::RenderTask;

impl RenderTask {
    pub(super) fn on_navigation_event(&mut self, event: NavigationEvent) {
        // Replies carried by ignored events are dropped, which tells the
        // engine to fall back to its default handling.
        if self.stop || !self.registered {
            log::trace!("Ignoring stale navigation event - {}", self.name());
            return;
        }

        match event {
            NavigationEvent::Started => {
                if self.options.show_activity {
                    self.activity.set_visible(true);
                }
            }
            NavigationEvent::ResponseReceived { response, decision } => {
                log::debug!("Response {} from {}", response.status, response.url);
                self.shared.lock().response = Some(response);
                decision.send(ResponsePolicy::Allow);
            }
            NavigationEvent::ProvisionalFailed(error) => {
                self.hide_activity();
                log::warn!("{}", error);
                self.complete_rendering(None, Some(error));
            }
            NavigationEvent::Failed(error) => {
                self.hide_activity();
                let status = self.shared.lock().response.as_ref().map(|r| r.status);
                match status {
                    Some(status) if !(200..300).contains(&status) => {
                        log::warn!("{} (status {})", error, status);
                        self.complete_rendering(None, Some(error));
                    }
                    _ => log::warn!("{}", error),
                }
            }
            NavigationEvent::Finished => {
                self.hide_activity();
                self.on_finished();
            }
            NavigationEvent::Challenge { challenge, reply } => {
                let disposition = match &self.auth_handler {
                    Some(handler) => handler(&challenge),
                    None => ChallengeDisposition::PerformDefaultHandling,
                };
                log::debug!("Answering {} challenge for {}", challenge.scheme, challenge.url);
                reply.send(disposition);
            }
            NavigationEvent::ScriptMessage { name, .. } => self.on_script_message(&name),
        }
    }

    /// The page declared it has loaded enough. Only honoured when the task
    /// skips non-essential resources.
    fn on_script_message(&mut self, name: &str) {
        if name != EARLY_SIGNAL_CHANNEL {
            log::debug!("Ignoring message on channel '{}'", name);
            return;
        }
        if self.options.load_media_content {
            return;
        }

        let Some(engine) = self.engine() else {
            self.complete_rendering(None, Some(Error::EngineGone));
            return;
        };
        {
            let mut state = self.shared.lock();
            if state.response.is_none() {
                if let Some(url) = engine.current_url() {
                    state.response = Some(NavigationResponse::synthesized(url));
                }
            }
        }
        engine.stop_loading();
        drop(engine);

        self.hide_activity();
        self.on_finished();
    }

    fn hide_activity(&self) {
        if self.options.show_activity {
            self.activity.set_visible(false);
        }
    }
}
