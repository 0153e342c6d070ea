//! Batch execution.
//!
//! A batch runs an ordered list of commands through one transport. Items run
//! concurrently, bounded by [`BatchOptions::max_concurrency`], and are
//! independent: a failure does not affect later items unless the caller asks for
//! fail-fast (or a failure limit). Results always come back in input order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::envelope::{codes, failure, CommandError, ResultEnvelope};
use crate::transport::{CallOptions, Transport};

/// Default bound on concurrently running items.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// One command of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    /// Caller-chosen id; defaults to the item's index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(alias = "command")]
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

impl BatchItem {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            input,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// How a batch runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchOptions {
    /// Skip the remaining items after the first failure.
    pub fail_fast: bool,
    /// Skip the remaining items once this many have failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<usize>,
    /// Upper bound on concurrently running items (default 8, 1 = sequential).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Budget for the whole batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl BatchOptions {
    fn failure_limit(&self) -> Option<usize> {
        match (self.fail_fast, self.max_failures) {
            (true, _) => Some(1),
            (false, limit) => limit.filter(|n| *n > 0),
        }
    }

    fn concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY).max(1)
    }
}

/// Ordered list of commands plus options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub options: BatchOptions,
}

impl BatchRequest {
    pub fn new(items: Vec<BatchItem>) -> Self {
        Self {
            items,
            options: BatchOptions::default(),
        }
    }

    /// Build from `(name, input)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, input)| BatchItem::new(name, input))
                .collect(),
        )
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.options.fail_fast = true;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.options.max_concurrency = Some(max);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Outcome of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub id: String,
    pub name: String,
    pub result: ResultEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl BatchItemResult {
    pub fn is_skipped(&self) -> bool {
        self.result.error_code() == Some(codes::COMMAND_SKIPPED)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Failed items, not counting skipped ones.
    pub failed: usize,
    pub skipped: usize,
    /// Mean confidence of the successful items that report one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_confidence: Option<f64>,
}

impl BatchSummary {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }
}

/// Wall-clock timing. Timestamps are RFC 3339.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTiming {
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_ms: Option<u64>,
}

/// Result of a whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// True when every item succeeded.
    pub success: bool,
    /// One entry per item, in input order.
    pub results: Vec<BatchItemResult>,
    pub summary: BatchSummary,
    pub timing: BatchTiming,
    /// Batch-level failure (the batch itself could not run).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl BatchResult {
    /// Assemble a result and compute the summary.
    pub fn from_results(
        results: Vec<BatchItemResult>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        total_ms: u64,
    ) -> Self {
        let total = results.len();
        let succeeded = results.iter().filter(|r| r.result.is_success()).count();
        let skipped = results.iter().filter(|r| r.is_skipped()).count();
        let failed = total - succeeded - skipped;

        let confidences: Vec<f64> = results
            .iter()
            .filter(|r| r.result.is_success())
            .filter_map(|r| r.result.confidence())
            .collect();
        let average_confidence = if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f64>() / confidences.len() as f64)
        };

        BatchResult {
            success: failed == 0 && skipped == 0,
            results,
            summary: BatchSummary {
                total,
                succeeded,
                failed,
                skipped,
                average_confidence,
            },
            timing: BatchTiming {
                started_at: rfc3339(started_at),
                ended_at: Some(rfc3339(ended_at)),
                total_ms: Some(total_ms),
                average_ms: (total > 0).then(|| total_ms / total as u64),
            },
            error: None,
        }
    }

    /// A batch that could not run at all.
    pub fn failed(error: CommandError, started_at: DateTime<Utc>) -> Self {
        BatchResult {
            success: false,
            results: Vec::new(),
            summary: BatchSummary::default(),
            timing: BatchTiming {
                started_at: rfc3339(started_at),
                ..BatchTiming::default()
            },
            error: Some(error),
        }
    }

    /// Item envelopes in input order.
    pub fn envelopes(&self) -> impl Iterator<Item = &ResultEnvelope> {
        self.results.iter().map(|r| &r.result)
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Run a batch through `transport`.
pub async fn execute_batch(transport: &dyn Transport, request: BatchRequest) -> BatchResult {
    let started_at = Utc::now();
    let clock = Instant::now();

    if request.items.is_empty() {
        return BatchResult::failed(
            CommandError::new(
                codes::INVALID_BATCH_REQUEST,
                "Batch must contain at least one command",
            ),
            started_at,
        );
    }

    let options = request.options;
    let failure_limit = options.failure_limit();
    let deadline = options
        .timeout_ms
        .map(|ms| (clock + Duration::from_millis(ms), ms));

    let failures = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let (failures, stop) = (&failures, &stop);

    debug!(
        items = request.items.len(),
        concurrency = options.concurrency(),
        "Executing batch"
    );

    let results: Vec<BatchItemResult> = stream::iter(request.items.into_iter().enumerate())
        .map(|(index, item)| async move {
            let id = item.id.unwrap_or_else(|| index.to_string());

            if stop.load(Ordering::SeqCst) {
                return BatchItemResult {
                    id,
                    name: item.name,
                    result: failure(CommandError::skipped()),
                    duration_ms: None,
                };
            }

            let item_started = Instant::now();
            let mut opts = CallOptions::new();
            let result = match deadline {
                Some((at, _)) if item_started < at => {
                    opts.timeout = Some(at - item_started);
                    transport.call(&item.name, item.input, opts).await
                }
                Some((_, ms)) => failure(CommandError::timeout("batch", ms)),
                None => transport.call(&item.name, item.input, opts).await,
            };

            if result.is_failure() {
                let failed = failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failure_limit.is_some_and(|limit| failed >= limit) {
                    stop.store(true, Ordering::SeqCst);
                }
            }

            BatchItemResult {
                id,
                name: item.name,
                result,
                duration_ms: Some(item_started.elapsed().as_millis() as u64),
            }
        })
        .buffered(options.concurrency())
        .collect()
        .await;

    let total_ms = clock.elapsed().as_millis() as u64;
    BatchResult::from_results(results, started_at, Utc::now(), total_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{success_with, ResultMeta};
    use crate::handler::{CommandDescriptor, CommandRegistry};
    use crate::transport::DirectTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> Arc<CommandRegistry> {
        let registry = CommandRegistry::new();
        registry
            .register(CommandDescriptor::new("echo", |input: Value, _ctx| async move {
                success_with(input, ResultMeta::new().with_confidence(0.5))
            }))
            .unwrap();
        registry
            .register(CommandDescriptor::new("sleep", |ms: u64, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, CommandError>(ms)
            }))
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_mixed_batch_keeps_order() {
        let transport = DirectTransport::new(registry());
        let request = BatchRequest::from_pairs([
            ("echo", json!({"v": 1})),
            ("ghost", json!({})),
            ("echo", json!({"v": 2})),
        ]);

        let result = execute_batch(&transport, request).await;

        assert!(!result.success);
        assert_eq!(result.summary.total, 3);
        assert_eq!(result.summary.succeeded, 2);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.skipped, 0);
        assert_eq!(result.summary.average_confidence, Some(0.5));

        assert_eq!(result.results[0].result.data(), Some(&json!({"v": 1})));
        assert_eq!(result.results[1].result.error_code(), Some(codes::NOT_FOUND));
        assert_eq!(result.results[2].result.data(), Some(&json!({"v": 2})));
        let ids: Vec<&str> = result.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_items_resolve_in_input_order() {
        let transport = DirectTransport::new(registry());
        let request = BatchRequest::from_pairs([
            ("sleep", json!(300)),
            ("sleep", json!(10)),
            ("sleep", json!(100)),
        ])
        .with_max_concurrency(3);

        let result = execute_batch(&transport, request).await;
        let data: Vec<&Value> = result.envelopes().filter_map(|e| e.data()).collect();
        assert_eq!(data, vec![&json!(300), &json!(10), &json!(100)]);
        // Ran concurrently: total is the slowest item, not the sum.
        assert!(result.timing.total_ms.unwrap() < 400);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_rest() {
        let transport = DirectTransport::new(registry());
        let request = BatchRequest::from_pairs([
            ("ghost", json!({})),
            ("echo", json!(1)),
            ("echo", json!(2)),
        ])
        .with_max_concurrency(1)
        .fail_fast();

        let result = execute_batch(&transport, request).await;
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.skipped, 2);
        assert_eq!(
            result.results[2].result.error_code(),
            Some(codes::COMMAND_SKIPPED)
        );
    }

    #[tokio::test]
    async fn test_failures_do_not_short_circuit_by_default() {
        let transport = DirectTransport::new(registry());
        let request = BatchRequest::from_pairs([("ghost", json!({})), ("echo", json!(1))])
            .with_max_concurrency(1);

        let result = execute_batch(&transport, request).await;
        assert!(result.results[1].result.is_success());
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let transport = DirectTransport::new(registry());
        let result = execute_batch(&transport, BatchRequest::default()).await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_ref().map(|e| e.code.as_str()),
            Some(codes::INVALID_BATCH_REQUEST)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout() {
        let transport = DirectTransport::new(registry());
        let request = BatchRequest::from_pairs([("sleep", json!(10)), ("sleep", json!(10_000))])
            .with_timeout(Duration::from_millis(500));

        let result = execute_batch(&transport, request).await;
        assert!(result.results[0].result.is_success());
        assert_eq!(result.results[1].result.error_code(), Some(codes::TIMEOUT));
    }

    #[test]
    fn test_wire_shape() {
        let request = BatchRequest::new(vec![BatchItem::new("echo", json!(1)).with_id("a")]).fail_fast();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"items": [{"id": "a", "name": "echo", "input": 1}], "options": {"failFast": true}})
        );

        let parsed: BatchItem =
            serde_json::from_value(json!({"command": "todo.list"})).unwrap();
        assert_eq!(parsed.name, "todo.list");
        assert_eq!(parsed.input, Value::Null);
    }

    mod properties {
        use super::*;
        use crate::testing::arb_json;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Planned {
            Echo(Value),
            Sleep(u64),
            Missing(String),
        }

        impl Planned {
            fn item(&self) -> BatchItem {
                match self {
                    Planned::Echo(v) => BatchItem::new("echo", v.clone()),
                    Planned::Sleep(ms) => BatchItem::new("sleep", json!(ms)),
                    Planned::Missing(name) => BatchItem::new(name.clone(), json!({})),
                }
            }
        }

        fn arb_planned() -> impl Strategy<Value = Planned> {
            prop_oneof![
                arb_json().prop_map(Planned::Echo),
                (0u64..50).prop_map(Planned::Sleep),
                "ghost\\.[a-z]{1,6}".prop_map(Planned::Missing),
            ]
        }

        proptest! {
            #[test]
            fn test_results_follow_input_order(
                plan in prop::collection::vec(arb_planned(), 1..12),
                concurrency in 1usize..5,
            ) {
                let request = BatchRequest::new(plan.iter().map(Planned::item).collect())
                    .with_max_concurrency(concurrency);
                let result = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
                    .unwrap()
                    .block_on(async {
                        let transport = DirectTransport::new(registry());
                        execute_batch(&transport, request).await
                    });

                prop_assert_eq!(result.results.len(), plan.len());
                for (index, (planned, item)) in plan.iter().zip(&result.results).enumerate() {
                    prop_assert_eq!(&item.id, &index.to_string());
                    match planned {
                        Planned::Echo(v) => prop_assert_eq!(item.result.data(), Some(v)),
                        Planned::Sleep(ms) => prop_assert_eq!(item.result.data(), Some(&json!(ms))),
                        Planned::Missing(_) => {
                            prop_assert_eq!(item.result.error_code(), Some(codes::NOT_FOUND))
                        }
                    }
                }
                let missing = plan.iter().filter(|p| matches!(p, Planned::Missing(_))).count();
                prop_assert_eq!(result.summary.failed, missing);
                prop_assert_eq!(result.summary.succeeded, plan.len() - missing);
                prop_assert_eq!(result.success, missing == 0);
            }
        }
    }
}
