//! A deterministic, in-process engine.
//!
//! `ScriptedEngine` replays a fixed list of [`Step`]s on a background thread
//! each time a navigation starts, answers scripts from canned values and
//! records how it was driven. It backs the crate's tests and benchmarks and
//! is handy for exercising task policies without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::engine::{
    AuthChallenge, ChallengeDisposition, EventSink, NavigationEvent, RenderEngine, Reply,
    ResponsePolicy,
};
use crate::{Error, NavigationResponse, Result, SCRAPING_SCRIPT};

/// How long playback waits for the task to answer a reply-carrying event
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Event template emitted during playback
#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    Started,
    /// Main document response for the URL being loaded
    Response { status: u16 },
    ProvisionalFailed(Error),
    Failed(Error),
    Finished,
    Challenge(AuthChallenge),
    /// Page post on a named channel
    Message { name: String, body: Value },
}

/// One playback step
#[derive(Debug, Clone)]
pub enum Step {
    Emit(ScriptedEvent),
    Sleep(Duration),
}

#[derive(Default)]
struct ScriptedState {
    loading: bool,
    generation: u64,
    stopped: bool,
    url: Option<String>,
    sink: Option<EventSink>,
    channels: HashSet<String>,
    scripts: HashMap<String, VecDeque<Value>>,
    evaluations: Vec<(String, Instant)>,
    loads: Vec<String>,
    attach_count: usize,
    stop_count: usize,
    challenge_answers: Vec<ChallengeDisposition>,
    policy_answers: Vec<ResponsePolicy>,
}

/// Engine that replays scripted navigation events
pub struct ScriptedEngine {
    steps: Vec<Step>,
    honor_stop: bool,
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            honor_stop: true,
            state: Arc::new(Mutex::new(ScriptedState::default())),
        }
    }

    /// A page that loads successfully and extracts to `html`
    pub fn page(html: &str) -> Self {
        Self::new(vec![
            Step::Emit(ScriptedEvent::Started),
            Step::Emit(ScriptedEvent::Response { status: 200 }),
            Step::Emit(ScriptedEvent::Finished),
        ])
        .with_script_result(SCRAPING_SCRIPT, Value::String(html.to_string()))
    }

    /// Answer `script` with `value` on every evaluation
    pub fn with_script_result(self, script: &str, value: Value) -> Self {
        self.with_script_results(script, vec![value])
    }

    /// Answer `script` with `values` in order; the last value repeats
    pub fn with_script_results(self, script: &str, values: Vec<Value>) -> Self {
        self.lock().scripts.insert(script.to_string(), values.into());
        self
    }

    /// Keep replaying events after `stop_loading`, as an engine that loses
    /// the race against its own in-flight callbacks would
    pub fn ignoring_stop(mut self) -> Self {
        self.honor_stop = false;
        self
    }

    pub fn set_loading(&self, loading: bool) {
        self.lock().loading = loading;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().sink.is_some()
    }

    pub fn attach_count(&self) -> usize {
        self.lock().attach_count
    }

    pub fn stop_count(&self) -> usize {
        self.lock().stop_count
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.lock().channels.contains(name)
    }

    /// URLs passed to `load_url`, in order
    pub fn loads(&self) -> Vec<String> {
        self.lock().loads.clone()
    }

    /// When each evaluation of `script` happened
    pub fn evaluations(&self, script: &str) -> Vec<Instant> {
        self.lock()
            .evaluations
            .iter()
            .filter(|(s, _)| s == script)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn challenge_answers(&self) -> Vec<ChallengeDisposition> {
        self.lock().challenge_answers.clone()
    }

    pub fn policy_answers(&self) -> Vec<ResponsePolicy> {
        self.lock().policy_answers.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<ScriptedState>) -> MutexGuard<'_, ScriptedState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RenderEngine for ScriptedEngine {
    fn is_loading(&self) -> bool {
        self.lock().loading
    }

    fn load_url(&self, url: &str) -> Result<()> {
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.loading = true;
            state.stopped = false;
            state.url = Some(url.to_string());
            state.loads.push(url.to_string());
            state.generation
        };

        let playback = Playback {
            state: self.state.clone(),
            steps: self.steps.clone(),
            generation,
            honor_stop: self.honor_stop,
        };
        thread::Builder::new()
            .name("scripted-engine".into())
            .spawn(move || playback.run())
            .map_err(|e| Error::LoadError(format!("Failed to start playback: {}", e)))?;
        Ok(())
    }

    fn current_url(&self) -> Option<String> {
        self.lock().url.clone()
    }

    fn attach(&self, sink: EventSink) -> Result<()> {
        let mut state = self.lock();
        if state.sink.is_some() {
            return Err(Error::HandlerSlotOccupied);
        }
        state.sink = Some(sink);
        state.attach_count += 1;
        Ok(())
    }

    fn detach(&self) {
        self.lock().sink = None;
    }

    fn add_message_channel(&self, name: &str) {
        self.lock().channels.insert(name.to_string());
    }

    fn remove_message_channel(&self, name: &str) {
        self.lock().channels.remove(name);
    }

    fn evaluate_script(&self, script: &str) -> Result<Value> {
        let mut state = self.lock();
        state.evaluations.push((script.to_string(), Instant::now()));
        let values = state
            .scripts
            .get_mut(script)
            .ok_or_else(|| Error::ScriptError(format!("No scripted result for `{}`", script)))?;
        let value = if values.len() > 1 {
            values.pop_front()
        } else {
            values.front().cloned()
        };
        Ok(value.unwrap_or(Value::Null))
    }

    fn stop_loading(&self) {
        let mut state = self.lock();
        state.stop_count += 1;
        state.stopped = true;
        state.loading = false;
    }
}

struct Playback {
    state: Arc<Mutex<ScriptedState>>,
    steps: Vec<Step>,
    generation: u64,
    honor_stop: bool,
}

impl Playback {
    fn run(self) {
        for step in &self.steps {
            match step {
                Step::Sleep(duration) => thread::sleep(*duration),
                Step::Emit(event) => {
                    let (sink, url) = {
                        let state = lock(&self.state);
                        if state.generation != self.generation || (self.honor_stop && state.stopped)
                        {
                            break;
                        }
                        (state.sink.clone(), state.url.clone().unwrap_or_default())
                    };
                    if let Some(sink) = sink {
                        self.emit(&sink, event.clone(), url);
                    }
                }
            }
        }

        let mut state = lock(&self.state);
        if state.generation == self.generation {
            state.loading = false;
        }
    }

    fn emit(&self, sink: &EventSink, event: ScriptedEvent, url: String) {
        match event {
            ScriptedEvent::Started => {
                sink.emit(NavigationEvent::Started);
            }
            ScriptedEvent::Response { status } => {
                let (decision, rx) = Reply::channel();
                let response = NavigationResponse::new(url, status);
                if sink.emit(NavigationEvent::ResponseReceived { response, decision }) {
                    let answer = rx.recv_timeout(REPLY_TIMEOUT).unwrap_or(ResponsePolicy::Allow);
                    lock(&self.state).policy_answers.push(answer);
                }
            }
            ScriptedEvent::ProvisionalFailed(error) => {
                sink.emit(NavigationEvent::ProvisionalFailed(error));
            }
            ScriptedEvent::Failed(error) => {
                sink.emit(NavigationEvent::Failed(error));
            }
            ScriptedEvent::Finished => {
                sink.emit(NavigationEvent::Finished);
            }
            ScriptedEvent::Challenge(challenge) => {
                let (reply, rx) = Reply::channel();
                if sink.emit(NavigationEvent::Challenge { challenge, reply }) {
                    let answer = rx
                        .recv_timeout(REPLY_TIMEOUT)
                        .unwrap_or(ChallengeDisposition::PerformDefaultHandling);
                    lock(&self.state).challenge_answers.push(answer);
                }
            }
            ScriptedEvent::Message { name, body } => {
                sink.emit(NavigationEvent::ScriptMessage { name, body });
            }
        }
    }
}
