//! HTTP engine backend.
//!
//! Fetches the main document with a blocking `reqwest` client on a navigation
//! thread, parses it with `scraper` and evaluates scripts with Boa against a
//! minimal `document`/`window` model. Inline `<script>` elements run once per
//! navigation and may post to registered channels through
//! `rfrender.postMessage(name, body)`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use boa_engine::{Context, JsValue, Source};
use reqwest::blocking::{Client, Response};
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::engine::{
    AuthChallenge, ChallengeDisposition, EventSink, NavigationEvent, RenderEngine, Reply,
    ResponsePolicy,
};
use crate::{EngineConfig, Error, NavigationResponse, Result};

/// A committed document
#[derive(Debug, Clone)]
struct Document {
    url: String,
    html: String,
}

#[derive(Default)]
struct HttpState {
    loading: bool,
    generation: u64,
    url: Option<String>,
    sink: Option<EventSink>,
    channels: HashSet<String>,
    document: Option<Document>,
}

type SharedState = Arc<Mutex<HttpState>>;

fn lock(state: &Mutex<HttpState>) -> MutexGuard<'_, HttpState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Engine backed by plain HTTP fetches and Boa script evaluation
pub struct HttpEngine {
    client: Client,
    config: EngineConfig,
    state: SharedState,
}

impl HttpEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            state: Arc::new(Mutex::new(HttpState::default())),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HttpState> {
        lock(&self.state)
    }
}

impl RenderEngine for HttpEngine {
    fn is_loading(&self) -> bool {
        self.lock().loading
    }

    fn load_url(&self, url: &str) -> Result<()> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::LoadError(format!("Invalid URL {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::LoadError(format!(
                "Unsupported scheme '{}' in {}",
                parsed.scheme(),
                url
            )));
        }

        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.loading = true;
            state.url = Some(parsed.to_string());
            state.generation
        };

        let navigation = Navigation {
            client: self.client.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            generation,
            url: parsed.to_string(),
        };
        thread::Builder::new()
            .name("rfrender-navigation".into())
            .spawn(move || navigation.run())
            .map_err(|e| Error::LoadError(format!("Failed to start navigation: {}", e)))?;
        Ok(())
    }

    fn current_url(&self) -> Option<String> {
        let state = self.lock();
        state
            .document
            .as_ref()
            .map(|doc| doc.url.clone())
            .or_else(|| state.url.clone())
    }

    fn attach(&self, sink: EventSink) -> Result<()> {
        let mut state = self.lock();
        if state.sink.is_some() {
            return Err(Error::HandlerSlotOccupied);
        }
        state.sink = Some(sink);
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
        let document = self
            .lock()
            .document
            .clone()
            .ok_or_else(|| Error::ScriptError("No document loaded".into()))?;

        let page = PageScope::new(&document, &self.config)?;
        let mut ctx = page.context(&self.config);
        if self.config.enable_javascript {
            page.run_inline_scripts(&mut ctx);
        }
        let value = ctx
            .eval(Source::from_bytes(script.as_bytes()))
            .map_err(|e| Error::ScriptError(format!("Script thrown: {}", e)))?;
        js_to_json(&value, &mut ctx)
    }

    fn stop_loading(&self) {
        let mut state = self.lock();
        if state.loading {
            log::debug!("Stopping navigation to {:?}", state.url);
        }
        // Outstanding navigation threads see a stale generation and go quiet.
        state.generation += 1;
        state.loading = false;
    }
}

struct Navigation {
    client: Client,
    config: EngineConfig,
    state: SharedState,
    generation: u64,
    url: String,
}

impl Navigation {
    fn run(self) {
        self.emit(NavigationEvent::Started);

        match self.fetch() {
            Ok(html) => self.commit(html),
            Err(event) => {
                if self.settle() {
                    self.emit(event);
                }
            }
        }
    }

    fn fetch(&self) -> std::result::Result<String, NavigationEvent> {
        let mut resp = self.send(None)?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            if let Some(challenge) = self.challenge(&resp) {
                match self.ask(challenge) {
                    ChallengeDisposition::UseCredential(credential) => {
                        resp = self.send(Some((credential.user, credential.password)))?;
                    }
                    ChallengeDisposition::CancelAuthenticationChallenge => {
                        return Err(NavigationEvent::ProvisionalFailed(Error::NavigationError(
                            format!("Authentication cancelled for {}", self.url),
                        )));
                    }
                    ChallengeDisposition::PerformDefaultHandling
                    | ChallengeDisposition::RejectProtectionSpace => {}
                }
            }
        }

        let response = to_navigation_response(&resp);
        let (decision, rx) = Reply::channel();
        let policy = if self.emit(NavigationEvent::ResponseReceived { response, decision }) {
            rx.recv_timeout(self.reply_timeout())
                .unwrap_or(ResponsePolicy::Allow)
        } else {
            ResponsePolicy::Allow
        };
        if policy == ResponsePolicy::Cancel {
            return Err(NavigationEvent::ProvisionalFailed(Error::NavigationError(
                format!("Navigation to {} cancelled by response policy", self.url),
            )));
        }

        match resp.text() {
            Ok(body) => Ok(body),
            Err(e) => Err(NavigationEvent::Failed(Error::NetworkError(format!(
                "Failed to read response body: {}",
                e
            )))),
        }
    }

    fn send(
        &self,
        credential: Option<(String, String)>,
    ) -> std::result::Result<Response, NavigationEvent> {
        let mut request = self.client.get(&self.url);
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some((user, password)) = credential {
            request = request.basic_auth(user, Some(password));
        }
        request.send().map_err(|e| {
            NavigationEvent::ProvisionalFailed(Error::NavigationError(format!(
                "Failed to fetch {}: {}",
                self.url, e
            )))
        })
    }

    fn challenge(&self, resp: &Response) -> Option<AuthChallenge> {
        let header = resp.headers().get(WWW_AUTHENTICATE)?.to_str().ok()?;
        let (scheme, realm) = parse_www_authenticate(header);
        Some(AuthChallenge {
            url: self.url.clone(),
            scheme,
            realm,
            previous_failure_count: 0,
        })
    }

    fn ask(&self, challenge: AuthChallenge) -> ChallengeDisposition {
        let (reply, rx) = Reply::channel();
        if !self.emit(NavigationEvent::Challenge { challenge, reply }) {
            return ChallengeDisposition::PerformDefaultHandling;
        }
        rx.recv_timeout(self.reply_timeout())
            .unwrap_or(ChallengeDisposition::PerformDefaultHandling)
    }

    fn commit(self, html: String) {
        let document = Document {
            url: self.url.clone(),
            html,
        };
        {
            let mut state = lock(&self.state);
            if state.generation != self.generation {
                return;
            }
            state.document = Some(document.clone());
        }

        if self.config.enable_javascript {
            for (name, body) in self.run_page_scripts(&document) {
                let registered = lock(&self.state).channels.contains(&name);
                if registered {
                    self.emit(NavigationEvent::ScriptMessage { name, body });
                } else {
                    log::trace!("Dropping post to unregistered channel '{}'", name);
                }
            }
        }

        if self.settle() {
            self.emit(NavigationEvent::Finished);
        }
    }

    fn run_page_scripts(&self, document: &Document) -> Vec<(String, Value)> {
        let page = match PageScope::new(document, &self.config) {
            Ok(page) => page,
            Err(err) => {
                log::warn!("{}", err);
                return Vec::new();
            }
        };
        let mut ctx = page.context(&self.config);
        page.run_inline_scripts(&mut ctx);
        page.take_posts(&mut ctx)
    }

    /// Mark loading done. Returns `false` if the navigation went stale.
    fn settle(&self) -> bool {
        let mut state = lock(&self.state);
        if state.generation != self.generation {
            return false;
        }
        state.loading = false;
        true
    }

    /// Deliver an event if this navigation is still current and someone is
    /// listening
    fn emit(&self, event: NavigationEvent) -> bool {
        let sink = {
            let state = lock(&self.state);
            if state.generation != self.generation {
                return false;
            }
            state.sink.clone()
        };
        sink.map_or(false, |sink| sink.emit(event))
    }

    fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }
}

fn to_navigation_response(resp: &Response) -> NavigationResponse {
    let mut response = NavigationResponse::new(resp.url().to_string(), resp.status().as_u16());
    response.headers = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect::<HashMap<_, _>>();
    response
}

/// Split a `WWW-Authenticate` header into its scheme and realm
fn parse_www_authenticate(header: &str) -> (String, Option<String>) {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
    let realm = params.split(',').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("realm")
            .then(|| value.trim().trim_matches('"').to_string())
    });
    (scheme.to_string(), realm)
}

/// Everything a script context needs to know about a committed document
struct PageScope {
    prelude: String,
    scripts: Vec<String>,
}

impl PageScope {
    fn new(document: &Document, config: &EngineConfig) -> Result<Self> {
        let html = Html::parse_document(&document.html);
        let title = select_text(&html, "title")?;
        let body = select_text(&html, "body")?;
        let outer_html = html.root_element().html();

        let scripts = if config.enable_javascript {
            let selector = parse_selector("script:not([src])")?;
            html.select(&selector)
                .map(|node| node.text().collect::<String>())
                .filter(|code| !code.trim().is_empty())
                .collect()
        } else {
            Vec::new()
        };

        let prelude = format!(
            r#"var __rfrender_posts = [];
var document = {{ title: {title}, documentElement: {{ outerHTML: {outer} }}, body: {{ innerText: {body} }} }};
var window = {{ location: {{ href: {href} }}, document: document }};
var rfrender = {{
  postMessage: function (name, body) {{
    __rfrender_posts.push([String(name), JSON.stringify(body === undefined ? null : body)]);
  }}
}};
window.rfrender = rfrender;"#,
            title = js_string(&title),
            outer = js_string(&outer_html),
            body = js_string(&body),
            href = js_string(&document.url),
        );

        Ok(Self { prelude, scripts })
    }

    fn context(&self, config: &EngineConfig) -> Context {
        let mut ctx = Context::default();
        if config.script_loop_iteration_limit > 0 {
            ctx.runtime_limits_mut()
                .set_loop_iteration_limit(config.script_loop_iteration_limit);
        }
        if config.script_recursion_limit < usize::MAX {
            ctx.runtime_limits_mut()
                .set_recursion_limit(config.script_recursion_limit);
        }
        if let Err(e) = ctx.eval(Source::from_bytes(self.prelude.as_bytes())) {
            log::warn!("Failed to install page prelude: {}", e);
        }
        ctx
    }

    fn run_inline_scripts(&self, ctx: &mut Context) {
        for code in &self.scripts {
            if let Err(e) = ctx.eval(Source::from_bytes(code.as_bytes())) {
                log::warn!("Inline script thrown: {}", e);
            }
        }
    }

    fn take_posts(&self, ctx: &mut Context) -> Vec<(String, Value)> {
        let raw = match ctx.eval(Source::from_bytes(
            "JSON.stringify(__rfrender_posts)".as_bytes(),
        )) {
            Ok(value) => value
                .as_string()
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default(),
            Err(e) => {
                log::warn!("Failed to read page posts: {}", e);
                return Vec::new();
            }
        };
        let posts: Vec<(String, String)> = serde_json::from_str(&raw).unwrap_or_default();
        posts
            .into_iter()
            .map(|(name, body)| (name, serde_json::from_str(&body).unwrap_or(Value::Null)))
            .collect()
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| Error::ScriptError(format!("Invalid selector {}: {:?}", selector, e)))
}

fn select_text(html: &Html, selector: &str) -> Result<String> {
    let selector = parse_selector(selector)?;
    Ok(html
        .select(&selector)
        .next()
        .map(|node| node.text().collect::<String>())
        .unwrap_or_default())
}

fn js_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

/// Convert a Boa value into JSON. `undefined` maps to `null`.
fn js_to_json(value: &JsValue, ctx: &mut Context) -> Result<Value> {
    if value.is_undefined() || value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(b) = value.as_boolean() {
        return Ok(Value::Bool(b));
    }
    if let Some(s) = value.as_string() {
        return Ok(Value::String(s.to_std_string_escaped()));
    }
    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            return Ok(Value::from(n as i64));
        }
        return Ok(serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number));
    }
    value
        .to_json(ctx)
        .map_err(|e| Error::ScriptError(format!("Result is not JSON-convertible: {}", e)))
}
