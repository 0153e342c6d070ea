//! Pipeline execution.
//!
//! A pipeline runs commands one after another through one transport, feeding
//! earlier results into later inputs. Step inputs may reference:
//!
//! - `$input` - the pipeline's own input
//! - `$prev` - the last step that ran (skipped steps do not count)
//! - `$first` - the first step
//! - `$steps[n]` / `$steps.alias` - any earlier step by index or alias
//!
//! followed by an optional path such as `.items[0].id`. A step may carry a
//! `when` [`Condition`]; when it does not hold the step is skipped. The first
//! failure skips the remaining steps unless
//! [`PipelineOptions::continue_on_failure`] is set.
//!
//! The pipeline's confidence is that of its weakest successful step.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::debug;

use crate::envelope::{failure, Alternative, CommandError, ResultMeta, Source, Warning};
use crate::transport::{CallOptions, Transport};

/// One command of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub command: String,
    /// Input template; `$` references are resolved before the call. Defaults to `{}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Name for `$steps.<alias>` references.
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

impl PipelineStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            input: None,
            alias: None,
            when: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.when = Some(condition);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineOptions {
    /// Keep running after a failed step.
    pub continue_on_failure: bool,
    /// Budget for the whole pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    /// Caller-chosen id, echoed in the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Value behind `$input`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    pub steps: Vec<PipelineStep>,
    #[serde(default)]
    pub options: PipelineOptions,
}

impl PipelineRequest {
    pub fn new(steps: Vec<PipelineStep>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.options.continue_on_failure = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Guard on a step, written as `{"$eq": ["$prev.status", "open"]}` and so on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// The reference resolves to something other than `null`.
    #[serde(rename = "$exists")]
    Exists(String),
    #[serde(rename = "$eq")]
    Eq(String, Value),
    #[serde(rename = "$ne")]
    Ne(String, Value),
    #[serde(rename = "$gt")]
    Gt(String, f64),
    #[serde(rename = "$gte")]
    Gte(String, f64),
    #[serde(rename = "$lt")]
    Lt(String, f64),
    #[serde(rename = "$lte")]
    Lte(String, f64),
    #[serde(rename = "$and")]
    And(Vec<Condition>),
    #[serde(rename = "$or")]
    Or(Vec<Condition>),
    #[serde(rename = "$not")]
    Not(Box<Condition>),
}

impl Condition {
    /// Numeric comparisons are false when the reference is not a number.
    pub fn evaluate(&self, ctx: &PipelineContext) -> bool {
        let number = |reference: &str| ctx.resolve(reference).and_then(|v| v.as_f64());
        match self {
            Condition::Exists(r) => ctx.resolve(r).is_some_and(|v| !v.is_null()),
            Condition::Eq(r, expected) => ctx.resolve(r).unwrap_or(Value::Null) == *expected,
            Condition::Ne(r, expected) => ctx.resolve(r).unwrap_or(Value::Null) != *expected,
            Condition::Gt(r, n) => number(r).is_some_and(|v| v > *n),
            Condition::Gte(r, n) => number(r).is_some_and(|v| v >= *n),
            Condition::Lt(r, n) => number(r).is_some_and(|v| v < *n),
            Condition::Lte(r, n) => number(r).is_some_and(|v| v <= *n),
            Condition::And(all) => all.iter().all(|c| c.evaluate(ctx)),
            Condition::Or(any) => any.iter().any(|c| c.evaluate(ctx)),
            Condition::Not(inner) => !inner.evaluate(ctx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub command: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    #[serde(default, skip_serializing_if = "ResultMeta::is_empty")]
    pub meta: ResultMeta,
    pub execution_time_ms: u64,
}

impl StepResult {
    fn skipped(index: usize, step: PipelineStep) -> Self {
        StepResult {
            index,
            alias: step.alias,
            command: step.command,
            status: StepStatus::Skipped,
            data: None,
            error: None,
            meta: ResultMeta::default(),
            execution_time_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    fn tag<T>(&self, item: T) -> FromStep<T> {
        FromStep {
            step_index: self.index,
            step_alias: self.alias.clone(),
            item,
        }
    }
}

/// An item of pipeline metadata, tagged with the step it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromStep<T> {
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_alias: Option<String>,
    #[serde(flatten)]
    pub item: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfidence {
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReasoning {
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetadata {
    /// Lowest confidence among successful steps; 0 without any.
    pub confidence: f64,
    pub confidence_breakdown: Vec<FromStep<StepConfidence>>,
    pub reasoning: Vec<FromStep<StepReasoning>>,
    pub warnings: Vec<FromStep<Warning>>,
    pub sources: Vec<FromStep<Source>>,
    pub alternatives: Vec<FromStep<Alternative>>,
    pub execution_time_ms: u64,
    pub completed_steps: usize,
    pub total_steps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Data of the last successful step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub metadata: PipelineMetadata,
    pub steps: Vec<StepResult>,
}

impl PipelineResult {
    fn from_steps(id: Option<String>, steps: Vec<StepResult>, execution_time_ms: u64) -> Self {
        let mut metadata = PipelineMetadata {
            execution_time_ms,
            total_steps: steps.len(),
            ..PipelineMetadata::default()
        };

        let mut weakest: Option<f64> = None;
        for step in steps.iter().filter(|s| s.is_success()) {
            let meta = &step.meta;
            let confidence = meta.confidence.unwrap_or(1.0);
            weakest = Some(weakest.map_or(confidence, |w| w.min(confidence)));

            metadata.completed_steps += 1;
            metadata
                .confidence_breakdown
                .push(step.tag(StepConfidence { confidence }));
            if let Some(reasoning) = &meta.reasoning {
                metadata.reasoning.push(step.tag(StepReasoning {
                    reasoning: reasoning.clone(),
                }));
            }
            metadata
                .warnings
                .extend(meta.warnings.iter().flatten().map(|item| step.tag(item.clone())));
            metadata
                .sources
                .extend(meta.sources.iter().flatten().map(|item| step.tag(item.clone())));
            metadata
                .alternatives
                .extend(meta.alternatives.iter().flatten().map(|item| step.tag(item.clone())));
        }
        metadata.confidence = weakest.unwrap_or(0.0);

        let data = steps
            .iter()
            .rev()
            .find(|s| s.is_success())
            .and_then(|s| s.data.clone());

        PipelineResult {
            id,
            data,
            metadata,
            steps,
        }
    }

    /// A pipeline whose first step failed with `error` before anything ran.
    pub fn failed(request: PipelineRequest, error: CommandError) -> Self {
        let steps = request
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| {
                let mut result = StepResult::skipped(index, step);
                if index == 0 {
                    result.status = StepStatus::Failure;
                    result.error = Some(error.clone());
                }
                result
            })
            .collect();
        Self::from_steps(request.id, steps, 0)
    }

    /// True when no step failed.
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|s| s.status != StepStatus::Failure)
    }

    pub fn confidence(&self) -> f64 {
        self.metadata.confidence
    }

    /// Step by alias.
    pub fn step(&self, alias: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.alias.as_deref() == Some(alias))
    }
}

/// What `$` references resolve against while a pipeline runs.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    input: Option<Value>,
    steps: Vec<StepResult>,
    previous: Option<usize>,
}

impl PipelineContext {
    pub fn new(input: Option<Value>) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    /// Record a finished step. Only steps that ran become `$prev`.
    pub fn push(&mut self, step: StepResult) {
        if step.status != StepStatus::Skipped {
            self.previous = Some(self.steps.len());
        }
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }

    /// Resolve one reference such as `$prev.items[0].id`.
    ///
    /// `None` when the reference is malformed, points at a missing step or the
    /// step has no data, or the path does not exist.
    pub fn resolve(&self, reference: &str) -> Option<Value> {
        let rest = reference.strip_prefix('$')?;
        let (root, path) = if let Some(after) = rest.strip_prefix("steps[") {
            let (index, tail) = after.split_once(']')?;
            let step = self.steps.get(index.parse::<usize>().ok()?)?;
            (step.data.as_ref()?, tail)
        } else if let Some(after) = rest.strip_prefix("steps.") {
            let (alias, tail) = split_head(after);
            let step = self
                .steps
                .iter()
                .find(|s| s.alias.as_deref() == Some(alias))?;
            (step.data.as_ref()?, tail)
        } else {
            let (head, tail) = split_head(rest);
            let root = match head {
                "prev" => self.steps.get(self.previous?)?.data.as_ref()?,
                "first" => self.steps.first()?.data.as_ref()?,
                "input" => self.input.as_ref()?,
                _ => return None,
            };
            (root, tail)
        };
        lookup(root, path).cloned()
    }

    /// Replace every `$` string in `template`, at any depth. References that do
    /// not resolve become `null`; other values are kept.
    pub fn resolve_input(&self, template: &Value) -> Value {
        match template {
            Value::String(s) if s.starts_with('$') => self.resolve(s).unwrap_or(Value::Null),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_input(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_input(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Split `alias.rest` or `alias[0]` into the name and the remaining path.
fn split_head(s: &str) -> (&str, &str) {
    match s.find(['.', '[']) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

/// Follow a dotted path with optional `[n]` indexes. Numeric segments also
/// index arrays, so `items.0` and `items[0]` are the same.
fn lookup<'a>(mut value: &'a Value, path: &str) -> Option<&'a Value> {
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let (key, indexes) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            value = match value {
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => value.get(key)?,
            };
        }
        for index in indexes.split('[').skip(1) {
            let index: usize = index.strip_suffix(']')?.parse().ok()?;
            value = value.get(index)?;
        }
    }
    Some(value)
}

/// Run a pipeline through `transport`.
pub async fn execute_pipeline(transport: &dyn Transport, request: PipelineRequest) -> PipelineResult {
    let clock = Instant::now();
    let options = request.options;
    let deadline = options
        .timeout_ms
        .map(|ms| (clock + Duration::from_millis(ms), ms));

    debug!(steps = request.steps.len(), id = ?request.id, "Executing pipeline");

    let mut ctx = PipelineContext::new(request.input);
    let mut steps = request.steps.into_iter().enumerate();

    while let Some((index, step)) = steps.next() {
        if let Some(condition) = &step.when {
            if !condition.evaluate(&ctx) {
                debug!(index, command = %step.command, "Step condition not met, skipping");
                ctx.push(StepResult::skipped(index, step));
                continue;
            }
        }

        let input = match &step.input {
            Some(template) => ctx.resolve_input(template),
            None => Value::Object(Map::new()),
        };

        let started = Instant::now();
        let mut opts = CallOptions::new();
        let envelope = match deadline {
            Some((at, _)) if started < at => {
                opts.timeout = Some(at - started);
                transport.call(&step.command, input, opts).await
            }
            Some((_, ms)) => failure(CommandError::timeout("pipeline", ms)),
            None => transport.call(&step.command, input, opts).await,
        };

        let (outcome, meta) = envelope.into_parts();
        let failed = outcome.is_err();
        let (status, data, error) = match outcome {
            Ok(data) => (StepStatus::Success, Some(data), None),
            Err(error) => (StepStatus::Failure, None, Some(error)),
        };
        ctx.push(StepResult {
            index,
            alias: step.alias,
            command: step.command,
            status,
            data,
            error,
            meta,
            execution_time_ms: started.elapsed().as_millis() as u64,
        });

        if failed && !options.continue_on_failure {
            debug!(index, "Step failed, skipping the rest of the pipeline");
            for (index, step) in steps.by_ref() {
                ctx.push(StepResult::skipped(index, step));
            }
        }
    }

    let execution_time_ms = clock.elapsed().as_millis() as u64;
    PipelineResult::from_steps(request.id, ctx.steps, execution_time_ms)
}
