//! Terminal snapshot of a render task.

use base64::engine::general_purpose;
use base64::Engine as Base64Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::task::CancelCause;
use crate::{Error, NavigationResponse};

/// What a task produced, detached from the task itself
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutcome {
    pub name: String,
    /// Extracted payload (UTF-8 bytes of the scraping script's result)
    pub result: Option<Vec<u8>>,
    pub response: Option<NavigationResponse>,
    pub error: Option<Error>,
    pub cancelled: bool,
    pub cancel_cause: Option<CancelCause>,
}

impl RenderOutcome {
    /// Payload as text, when it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        self.result
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Completed without error or cancellation and produced a payload
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.error.is_none() && self.result.is_some()
    }

    /// Hex-encoded SHA-256 of the payload
    pub fn digest(&self) -> Option<String> {
        self.result.as_ref().map(|bytes| {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            hex::encode(hasher.finalize())
        })
    }

    /// JSON report; the payload is base64 encoded
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "cancelled": self.cancelled,
            "cancel_cause": self.cancel_cause,
            "error": self.error.as_ref().map(|e| e.to_string()),
            "response": self.response,
            "result": self.result.as_ref().map(|bytes| general_purpose::STANDARD.encode(bytes)),
            "sha256": self.digest(),
        })
    }
}
