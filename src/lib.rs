//! RFox Render
//!
//! Render tasks for headless page engines. A [`RenderTask`] issues one
//! navigation, waits for the engine to settle, optionally applies a
//! [`PostAction`] (fixed delay or a repeated script condition) and finally
//! extracts the page through [`SCRAPING_SCRIPT`]. Tasks have a deterministic
//! lifecycle (pending, executing, then finished or cancelled), are bounded by
//! a timeout and can be queued, awaited and cancelled as if they were
//! synchronous.
//!
//! # Features
//!
//! - **Engine-agnostic core**: any backend implementing [`RenderEngine`]
//! - **HTTP backend** (default, `http` feature): `reqwest` + `scraper` + Boa
//! - **Scripted backend**: deterministic in-process engine for tests
//! - **Serial queue**: [`RenderQueue`] runs tasks one after another on a
//!   worker thread and hands outcomes back to sync or async callers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rfrender::{EngineConfig, HttpEngine, PostAction, RenderOptions, RenderQueue, RenderTask};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(HttpEngine::new(EngineConfig::default())?);
//! let queue = RenderQueue::new()?;
//!
//! let task = RenderTask::new("example", &engine, RenderOptions::default())
//!     .with_navigation("https://example.com")
//!     .with_post_action(PostAction::Wait(Duration::from_millis(500)));
//!
//! let outcome = queue.render_blocking(task)?;
//! println!("{}", outcome.text().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

pub mod activity;
pub mod engine;
pub mod error;
pub mod outcome;
pub mod queue;
pub mod scripted;
pub mod task;

// HTTP engine: reqwest fetch + scraper document model + Boa script evaluation
#[cfg(feature = "http")]
pub mod http;

pub use activity::{ActivityIndicator, LogActivity, NoopActivity};
pub use engine::{
    AuthChallenge, AuthHandler, ChallengeDisposition, Credential, EventSink, NavigationEvent,
    RenderEngine, Reply, ResponsePolicy, EARLY_SIGNAL_CHANNEL,
};
pub use error::{Error, Result};
pub use outcome::RenderOutcome;
pub use queue::{PendingRender, RenderQueue};
pub use scripted::{ScriptedEngine, ScriptedEvent, Step};
pub use task::{
    CancelCause, Phase, PostAction, RenderTask, RequestAction, TaskHandle, VALIDATE_INTERVAL,
};

#[cfg(feature = "http")]
pub use http::HttpEngine;

/// Script evaluated against the engine to produce a task's result payload
pub const SCRAPING_SCRIPT: &str = "document.documentElement.outerHTML";

/// Per-task configuration
///
/// Set once when the task is built; the task never changes it while running.
///
/// # Examples
///
/// ```
/// let opts = rfrender::RenderOptions::default();
/// assert_eq!(opts.timeout.as_secs(), 30);
/// assert!(opts.load_media_content);
/// ```
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Time after which a running task is cancelled
    pub timeout: Duration,
    /// Load every resource. When `false` the page may short-circuit loading
    /// through the early-signal channel.
    pub load_media_content: bool,
    /// Drive the activity indicator while navigating
    pub show_activity: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            load_media_content: true,
            show_activity: true,
        }
    }
}

/// Configuration for engine backends
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// User agent string to send with requests
    pub user_agent: String,
    /// Timeout for network requests and engine replies in milliseconds
    pub timeout_ms: u64,
    /// Custom HTTP headers
    pub headers: HashMap<String, String>,
    /// Whether to enable JavaScript execution
    pub enable_javascript: bool,
    /// Maximum loop iterations before Boa throws an error (0 => disabled)
    pub script_loop_iteration_limit: u64,
    /// Maximum recursion depth before Boa throws (usize::MAX => disabled)
    pub script_recursion_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/115.0 RFOX/0.3"
                .to_string(),
            timeout_ms: 30000,
            headers: HashMap::new(),
            enable_javascript: true,
            script_loop_iteration_limit: 1000000,
            script_recursion_limit: 1024,
        }
    }
}

/// Status and metadata of the main document response
///
/// Captured when the engine asks for a response policy decision, whether or
/// not the navigation later succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationResponse {
    /// URL the response originated from
    pub url: String,
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HashMap<String, String>,
}

impl NavigationResponse {
    pub fn new(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status,
            headers: HashMap::new(),
        }
    }

    /// A plain `200` response standing in for one the engine never reported
    pub fn synthesized(url: impl Into<String>) -> Self {
        Self::new(url, 200)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = RenderOptions::default();
        assert_eq!(opts.timeout, Duration::from_secs(30));
        assert!(opts.load_media_content);
        assert!(opts.show_activity);
    }

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();
        assert!(config.user_agent.contains("RFOX"));
        assert!(config.enable_javascript);
    }

    #[test]
    fn test_response_success_range() {
        assert!(NavigationResponse::synthesized("about:blank").is_success());
        assert!(NavigationResponse::new("x", 299).is_success());
        assert!(!NavigationResponse::new("x", 300).is_success());
        assert!(!NavigationResponse::new("x", 404).is_success());
    }
}
