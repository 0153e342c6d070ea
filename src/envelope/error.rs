//! Actionable command errors.
//!
//! A [`CommandError`] tells the caller what went wrong, whether retrying can help,
//! and (where possible) what to do next. Callers branch on [`CommandError::code`],
//! never on the message text.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Curated error codes.
///
/// The set is open: handlers may use their own codes. The dispatch layer and the
/// transports only ever produce the codes listed here.
pub mod codes {
    // Caller input
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const NOT_FOUND: &str = "NOT_FOUND";

    // Handler-level outcomes
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const CONFLICT: &str = "CONFLICT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const NO_CHANGES: &str = "NO_CHANGES";

    // Transport
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CANCELLED: &str = "CANCELLED";

    // Operator
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

    // Registry and batch bookkeeping
    pub const DUPLICATE_COMMAND: &str = "DUPLICATE_COMMAND";
    pub const COMMAND_SKIPPED: &str = "COMMAND_SKIPPED";
    pub const INVALID_BATCH_REQUEST: &str = "INVALID_BATCH_REQUEST";
}

/// Coarse classification of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input; retrying only helps with different input.
    Validation,
    /// Unknown command or resource.
    NotFound,
    /// Timeout, cancellation, lost connection.
    Transport,
    /// Handler blew up or the dispatch layer has a bug.
    Internal,
    /// Any other handler-defined code.
    Handler,
}

/// Error attached to a failure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct CommandError {
    /// Stable machine-readable code (see [`codes`]).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Recovery hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Whether the same call may succeed if retried unchanged.
    #[serde(default)]
    pub retryable: bool,
    /// Structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
    /// Underlying error, if this one wraps another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<CommandError>>,
}

impl CommandError {
    /// Create an error with an arbitrary code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            suggestion: None,
            retryable: false,
            details: None,
            cause: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Add a single detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_cause(mut self, cause: CommandError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// A resource handled by a command does not exist.
    pub fn not_found(resource: &str, id: &str) -> Self {
        Self::new(
            codes::NOT_FOUND,
            format!("{} with ID '{}' not found", resource, id),
        )
        .with_suggestion(format!(
            "Verify the {} ID exists and try again",
            resource.to_lowercase()
        ))
        .with_detail("resourceType", json!(resource))
        .with_detail("resourceId", json!(id))
    }

    /// No command is registered under `name`.
    ///
    /// `available` feeds the "did you mean" hint; it may be empty.
    pub fn unknown_command(name: &str, available: &[String]) -> Self {
        let similar = similar_names(name, available, 3);
        let suggestion = match similar.first() {
            Some(best) => format!("Did you mean '{}'?", best),
            None => "List the registered commands to see what is available".to_string(),
        };

        Self::new(codes::NOT_FOUND, format!("Command '{}' not found", name))
            .with_suggestion(suggestion)
            .with_detail("command", json!(name))
            .with_detail("availableCommands", json!(available))
            .with_detail("similar", json!(similar))
    }

    /// Input failed schema validation.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(codes::VALIDATION_ERROR, message)
            .with_suggestion("Check the input against the command's schema and try again")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(codes::FORBIDDEN, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(codes::CONFLICT, message)
            .with_suggestion("Refresh the resource and retry the change")
            .with_retryable(true)
    }

    /// Too many requests; `retry_after_seconds` lands in the suggestion and details.
    pub fn rate_limited(retry_after_seconds: Option<u32>) -> Self {
        let suggestion = match retry_after_seconds {
            Some(secs) => format!("Wait {} seconds and try again", secs),
            None => "Wait a moment and try again".to_string(),
        };
        let mut err = Self::new(codes::RATE_LIMITED, "Rate limit exceeded")
            .with_suggestion(suggestion)
            .with_retryable(true);
        if let Some(secs) = retry_after_seconds {
            err = err.with_detail("retryAfterSeconds", json!(secs));
        }
        err
    }

    /// The command ran but had nothing to change.
    pub fn no_changes(message: impl Into<String>) -> Self {
        Self::new(codes::NO_CHANGES, message)
    }

    /// The caller's patience budget ran out.
    pub fn timeout(operation: &str, timeout_ms: u64) -> Self {
        Self::new(
            codes::TIMEOUT,
            format!("Operation '{}' timed out after {}ms", operation, timeout_ms),
        )
        .with_suggestion("Try again with a longer timeout or a smaller request")
        .with_retryable(true)
        .with_detail("operationName", json!(operation))
        .with_detail("timeoutMs", json!(timeout_ms))
    }

    /// The call was cancelled by the caller or by the transport.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(codes::CANCELLED, reason).with_retryable(true)
    }

    /// Something broke below the command's own logic.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
            .with_suggestion("Please try again. If this persists, contact the operator.")
    }

    pub fn duplicate_command(name: &str) -> Self {
        Self::new(
            codes::DUPLICATE_COMMAND,
            format!("Command '{}' is already registered", name),
        )
        .with_detail("command", json!(name))
    }

    /// A batch item that never ran because an earlier item failed.
    pub fn skipped() -> Self {
        Self::new(
            codes::COMMAND_SKIPPED,
            "Command skipped due to previous error",
        )
    }

    /// Map the code onto the coarse taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self.code.as_str() {
            codes::VALIDATION_ERROR => ErrorCategory::Validation,
            codes::NOT_FOUND => ErrorCategory::NotFound,
            codes::TIMEOUT | codes::CANCELLED => ErrorCategory::Transport,
            codes::INTERNAL_ERROR => ErrorCategory::Internal,
            _ => ErrorCategory::Handler,
        }
    }

    /// Look up a detail entry.
    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.as_ref().and_then(|d| d.get(key))
    }
}

/// Normalized Levenshtein similarity in `[0, 1]`, case-insensitive.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();

    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    1.0 - prev[b.len()] as f64 / max_len as f64
}

/// Names from `available` that look like `requested`, best first.
fn similar_names(requested: &str, available: &[String], limit: usize) -> Vec<String> {
    let mut scored: Vec<(&String, f64)> = available
        .iter()
        .map(|name| (name, similarity(requested, name)))
        .filter(|(_, score)| *score >= 0.4)
        .collect();

    // Stable on ties so the hint is deterministic.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    scored
        .into_iter()
        .take(limit)
        .map(|(name, _)| name.clone())
        .collect()
}
