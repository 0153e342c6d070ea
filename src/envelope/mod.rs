//! Result envelope and error model.
//!
//! Provides:
//! - [`ResultEnvelope`] - the one shape every call resolves to
//! - [`CommandError`] - actionable errors with stable [`codes`]
//! - advisory metadata ([`ResultMeta`], [`Source`], [`PlanStep`], ...)
//!
//! # Example
//!
//! ```
//! use cmdwire::envelope::{failure, is_failure, success, CommandError, ResultEnvelope};
//! use serde_json::json;
//!
//! let ok = success(json!({"id": 1}));
//! assert!(ok.is_success());
//!
//! let err: ResultEnvelope = failure(CommandError::not_found("Todo", "1"));
//! assert!(is_failure(&err));
//! assert_eq!(err.error_code(), Some("NOT_FOUND"));
//! ```

mod error;
mod metadata;
mod result;

pub use error::{codes, CommandError, ErrorCategory};
pub use metadata::{
    Alternative, PlanStep, PlanStepStatus, Source, SourceType, Warning, WarningSeverity,
};
pub use result::{
    failure, failure_with, is_failure, is_success, success, success_with, ResultEnvelope,
    ResultMeta, ResultMetadata,
};
