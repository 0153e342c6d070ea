//! The universal result envelope.
//!
//! Every command invocation, on every transport, resolves to a [`ResultEnvelope`].
//! The only constructors are [`success`], [`success_with`], [`failure`] and
//! [`failure_with`]; the envelope is immutable afterwards.
//!
//! Wire shape (camelCase, absent fields omitted):
//!
//! ```text
//! {"success": true,  "data": ..., "confidence": 0.9, "warnings": [...], ...}
//! {"success": false, "error": {"code": "NOT_FOUND", "message": "..."}, ...}
//! ```

use serde::de::{self, DeserializeOwned, IntoDeserializer};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::error::CommandError;
use super::metadata::{Alternative, PlanStep, Source, Warning};

/// Execution bookkeeping attached to a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Advisory fields of an envelope.
///
/// Nothing in here affects `success`, `data` or `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<Warning>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<PlanStep>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<Vec<Alternative>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

impl ResultMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confidence is clamped to `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(clamp_unit(confidence));
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_warning(mut self, warning: Warning) -> Self {
        self.warnings.get_or_insert_with(Vec::new).push(warning);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions
            .get_or_insert_with(Vec::new)
            .push(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.sources.get_or_insert_with(Vec::new).push(source);
        self
    }

    pub fn with_plan(mut self, plan: Vec<PlanStep>) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_alternative(mut self, alternative: Alternative) -> Self {
        self.alternatives
            .get_or_insert_with(Vec::new)
            .push(alternative);
        self
    }

    pub fn with_metadata(mut self, metadata: ResultMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// True when no advisory field is set.
    pub fn is_empty(&self) -> bool {
        *self == ResultMeta::default()
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome<T> {
    Success(T),
    Failure(CommandError),
}

/// Canonical success/failure wrapper returned by every command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEnvelope<T = Value> {
    outcome: Outcome<T>,
    meta: ResultMeta,
}

/// Build a success envelope.
pub fn success<T>(data: T) -> ResultEnvelope<T> {
    success_with(data, ResultMeta::default())
}

/// Build a success envelope carrying advisory metadata.
pub fn success_with<T>(data: T, meta: ResultMeta) -> ResultEnvelope<T> {
    ResultEnvelope {
        outcome: Outcome::Success(data),
        meta,
    }
}

/// Build a failure envelope.
pub fn failure<T>(error: CommandError) -> ResultEnvelope<T> {
    failure_with(error, ResultMeta::default())
}

/// Build a failure envelope carrying advisory metadata.
pub fn failure_with<T>(error: CommandError, meta: ResultMeta) -> ResultEnvelope<T> {
    ResultEnvelope {
        outcome: Outcome::Failure(error),
        meta,
    }
}

/// True for envelopes built by [`success`]/[`success_with`].
pub fn is_success<T>(envelope: &ResultEnvelope<T>) -> bool {
    envelope.is_success()
}

/// True for envelopes built by [`failure`]/[`failure_with`].
pub fn is_failure<T>(envelope: &ResultEnvelope<T>) -> bool {
    envelope.is_failure()
}

impl<T> ResultEnvelope<T> {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Payload of a success envelope.
    pub fn data(&self) -> Option<&T> {
        match &self.outcome {
            Outcome::Success(data) => Some(data),
            Outcome::Failure(_) => None,
        }
    }

    /// Error of a failure envelope.
    pub fn error(&self) -> Option<&CommandError> {
        match &self.outcome {
            Outcome::Success(_) => None,
            Outcome::Failure(error) => Some(error),
        }
    }

    /// Shorthand for `self.error().map(|e| e.code.as_str())`.
    pub fn error_code(&self) -> Option<&str> {
        self.error().map(|e| e.code.as_str())
    }

    pub fn meta(&self) -> &ResultMeta {
        &self.meta
    }

    pub fn confidence(&self) -> Option<f64> {
        self.meta.confidence
    }

    /// Consume into a plain `Result`, dropping the advisory metadata.
    pub fn into_result(self) -> Result<T, CommandError> {
        match self.outcome {
            Outcome::Success(data) => Ok(data),
            Outcome::Failure(error) => Err(error),
        }
    }

    /// Consume into the outcome and the advisory metadata.
    pub fn into_parts(self) -> (Result<T, CommandError>, ResultMeta) {
        let meta = self.meta;
        let outcome = match self.outcome {
            Outcome::Success(data) => Ok(data),
            Outcome::Failure(error) => Err(error),
        };
        (outcome, meta)
    }

    /// Transform the payload of a success; failures pass through.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ResultEnvelope<U> {
        let outcome = match self.outcome {
            Outcome::Success(data) => Outcome::Success(f(data)),
            Outcome::Failure(error) => Outcome::Failure(error),
        };
        ResultEnvelope {
            outcome,
            meta: self.meta,
        }
    }
}

impl<T: Serialize> ResultEnvelope<T> {
    /// Erase the payload type.
    ///
    /// A payload that cannot be represented as JSON turns the envelope into an
    /// `INTERNAL_ERROR` failure; advisory metadata is kept.
    pub fn into_value(self) -> ResultEnvelope<Value> {
        let meta = self.meta;
        match self.outcome {
            Outcome::Success(data) => match serde_json::to_value(&data) {
                Ok(value) => success_with(value, meta),
                Err(e) => failure_with(
                    CommandError::internal(format!("Result could not be serialized: {}", e)),
                    meta,
                ),
            },
            Outcome::Failure(error) => failure_with(error, meta),
        }
    }
}

impl ResultEnvelope<Value> {
    /// Decode the payload into a concrete type.
    ///
    /// A payload that does not match `T` turns the envelope into an
    /// `INTERNAL_ERROR` failure.
    pub fn decode<T: DeserializeOwned>(self) -> ResultEnvelope<T> {
        let meta = self.meta;
        match self.outcome {
            Outcome::Success(value) => match serde_json::from_value(value) {
                Ok(data) => success_with(data, meta),
                Err(e) => failure_with(
                    CommandError::internal(format!("Result has unexpected shape: {}", e)),
                    meta,
                ),
            },
            Outcome::Failure(error) => failure_with(error, meta),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a, T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a CommandError>,
    #[serde(flatten)]
    meta: &'a ResultMeta,
}

impl<T: Serialize> Serialize for ResultEnvelope<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        EnvelopeRef {
            success: self.is_success(),
            data: self.data(),
            error: self.error(),
            meta: &self.meta,
        }
        .serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
struct EnvelopeRepr<T> {
    success: bool,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    error: Option<CommandError>,
    #[serde(flatten)]
    meta: ResultMeta,
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for ResultEnvelope<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = EnvelopeRepr::<T>::deserialize(deserializer)?;
        let mut meta = repr.meta;
        meta.confidence = meta.confidence.map(clamp_unit);

        let outcome = match (repr.success, repr.data, repr.error) {
            (true, Some(data), None) => Outcome::Success(data),
            // `"data": null` and an absent field look the same; accept them for
            // payload types that have a null form (Value, (), Option<_>).
            (true, None, None) => {
                let unit: de::value::UnitDeserializer<D::Error> = ().into_deserializer();
                let data = T::deserialize(unit).map_err(|_| {
                    de::Error::custom("success envelope is missing `data`")
                })?;
                Outcome::Success(data)
            }
            (true, _, Some(_)) => {
                return Err(de::Error::custom("success envelope carries an `error`"))
            }
            (false, None, Some(error)) => Outcome::Failure(error),
            (false, Some(_), _) => {
                return Err(de::Error::custom("failure envelope carries `data`"))
            }
            (false, None, None) => {
                return Err(de::Error::custom("failure envelope is missing `error`"))
            }
        };

        Ok(ResultEnvelope { outcome, meta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::error::codes;
    use serde_json::json;

    #[test]
    fn test_success_round_trip_through_predicates() {
        let env = success(json!({"v": 1}));
        assert!(is_success(&env));
        assert!(!is_failure(&env));
        assert_eq!(env.data(), Some(&json!({"v": 1})));
        assert!(env.error().is_none());
    }

    #[test]
    fn test_failure_round_trip_through_predicates() {
        let err = CommandError::not_found("Todo", "1");
        let env: ResultEnvelope<()> = failure(err.clone());
        assert!(is_failure(&env));
        assert!(!is_success(&env));
        assert_eq!(env.error(), Some(&err));
        assert!(env.data().is_none());
    }

    #[test]
    fn test_meta_does_not_affect_outcome() {
        let meta = ResultMeta::new()
            .with_confidence(0.2)
            .with_warning(Warning::new("STALE", "cached"));
        let env = failure_with::<Value>(CommandError::internal("x"), meta);
        assert!(env.is_failure());
        assert_eq!(env.confidence(), Some(0.2));
    }

    #[test]
    fn test_confidence_clamped() {
        let env = success_with(1, ResultMeta::new().with_confidence(3.5));
        assert_eq!(env.confidence(), Some(1.0));
        let env = success_with(1, ResultMeta::new().with_confidence(f64::NAN));
        assert_eq!(env.confidence(), Some(0.0));
    }

    #[test]
    fn test_serialize_success_shape() {
        let env = success_with(
            "hello".to_string(),
            ResultMeta::new().with_reasoning("cached"),
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            json!({"success": true, "data": "hello", "reasoning": "cached"})
        );
    }

    #[test]
    fn test_serialize_failure_shape() {
        let env: ResultEnvelope = failure(CommandError::new(codes::NOT_FOUND, "gone"));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            json!({"success": false, "error": {"code": "NOT_FOUND", "message": "gone", "retryable": false}})
        );
    }

    #[test]
    fn test_deserialize_rejects_inconsistent_shapes() {
        let both = json!({"success": true, "data": 1, "error": {"code": "X", "message": "y"}});
        assert!(serde_json::from_value::<ResultEnvelope>(both).is_err());

        let failure_without_error = json!({"success": false});
        assert!(serde_json::from_value::<ResultEnvelope>(failure_without_error).is_err());

        let failure_with_data = json!({"success": false, "data": 1, "error": {"code": "X", "message": "y"}});
        assert!(serde_json::from_value::<ResultEnvelope>(failure_with_data).is_err());
    }

    #[test]
    fn test_deserialize_null_data() {
        let env: ResultEnvelope = serde_json::from_value(json!({"success": true, "data": null}))
            .unwrap();
        assert_eq!(env.data(), Some(&Value::Null));

        #[derive(Debug, Deserialize)]
        struct Strict {
            _id: u32,
        }
        assert!(serde_json::from_value::<ResultEnvelope<Strict>>(json!({"success": true})).is_err());
    }

    #[test]
    fn test_deserialize_keeps_meta() {
        let env: ResultEnvelope = serde_json::from_value(json!({
            "success": true,
            "data": [1, 2],
            "confidence": 0.75,
            "suggestions": ["try again"],
            "metadata": {"executionTimeMs": 12, "traceId": "t-1"}
        }))
        .unwrap();
        assert_eq!(env.confidence(), Some(0.75));
        assert_eq!(env.meta().suggestions, Some(vec!["try again".to_string()]));
        let metadata = env.meta().metadata.as_ref().unwrap();
        assert_eq!(metadata.execution_time_ms, Some(12));
        assert_eq!(metadata.trace_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn test_decode_typed_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Todo {
            title: String,
        }

        let env = success(json!({"title": "write tests"}));
        let typed = env.decode::<Todo>();
        assert_eq!(
            typed.data(),
            Some(&Todo {
                title: "write tests".to_string()
            })
        );

        let wrong = success(json!(42)).decode::<Todo>();
        assert_eq!(wrong.error_code(), Some(codes::INTERNAL_ERROR));
    }

    #[test]
    fn test_into_value_and_map() {
        let env = success(vec![1, 2, 3]).map(|v| v.len());
        assert_eq!(env.data(), Some(&3));
        assert_eq!(env.into_value().data(), Some(&json!(3)));
    }

    #[test]
    fn test_into_parts() {
        let env = success_with(5, ResultMeta::new().with_suggestion("next"));
        let (outcome, meta) = env.into_parts();
        assert_eq!(outcome, Ok(5));
        assert_eq!(meta.suggestions, Some(vec!["next".to_string()]));
    }

    mod properties {
        use super::*;
        use crate::testing::{arb_error, arb_json};
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_success_envelope_holds_for_any_data(data in arb_json()) {
                let env = success(data.clone());
                prop_assert!(is_success(&env));
                prop_assert!(!is_failure(&env));
                prop_assert_eq!(env.data(), Some(&data));
                prop_assert!(env.error().is_none());

                let json = serde_json::to_string(&env).unwrap();
                let back: ResultEnvelope = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(back, env);
            }

            #[test]
            fn test_failure_envelope_holds_for_any_error(error in arb_error()) {
                let env: ResultEnvelope = failure(error.clone());
                prop_assert!(is_failure(&env));
                prop_assert!(!is_success(&env));
                prop_assert_eq!(env.error(), Some(&error));
                prop_assert!(env.data().is_none());

                let json = serde_json::to_string(&env).unwrap();
                let back: ResultEnvelope = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(back, env);
            }
        }
    }
}
