//! Command metadata.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::registry::{Handler, IntoEnvelope, TypedHandler};
use super::schema::JsonSchema;
use super::CommandContext;
use crate::stream::StreamOptions;

/// Rough duration class of a command, for callers planning timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionTime {
    /// Under 100ms.
    Instant,
    /// 100ms to 1s.
    Fast,
    /// 1s to 10s.
    Slow,
    /// Over 10s.
    LongRunning,
}

/// Immutable description of one command plus its handler.
///
/// Built once, handed to [`CommandRegistry::register`](super::CommandRegistry::register),
/// never mutated afterwards.
#[derive(Clone)]
pub struct CommandDescriptor {
    name: String,
    description: String,
    version: Option<String>,
    input_schema: JsonSchema,
    is_mutation: bool,
    tags: BTreeSet<String>,
    streaming: bool,
    category: Option<String>,
    returns: Option<JsonSchema>,
    execution_time: Option<ExecutionTime>,
    stream_options: Option<StreamOptions>,
    handler: Arc<dyn Handler>,
}

impl CommandDescriptor {
    /// Create a descriptor around a typed async function.
    ///
    /// The input is deserialized into `T` after schema validation; a mismatch
    /// fails the call with `VALIDATION_ERROR`.
    pub fn new<F, T, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(T, CommandContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: IntoEnvelope,
    {
        Self::from_handler(name, TypedHandler::new(handler))
    }

    /// Create a descriptor around any [`Handler`] implementation.
    pub fn from_handler(name: impl Into<String>, handler: impl Handler) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            version: None,
            input_schema: JsonSchema::any(),
            is_mutation: false,
            tags: BTreeSet::new(),
            streaming: false,
            category: None,
            returns: None,
            execution_time: None,
            stream_options: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_input_schema(mut self, schema: JsonSchema) -> Self {
        self.input_schema = schema;
        self
    }

    /// Mark the command as having side effects.
    pub fn mutation(mut self) -> Self {
        self.is_mutation = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Declare that the command emits progressive output.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Filter the command's progressive output; implies [`streaming`](Self::streaming).
    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.streaming = true;
        self.stream_options = Some(options);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Schema of the data a successful call returns. Documentation only.
    pub fn with_returns(mut self, schema: JsonSchema) -> Self {
        self.returns = Some(schema);
        self
    }

    pub fn with_execution_time(mut self, hint: ExecutionTime) -> Self {
        self.execution_time = Some(hint);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn input_schema(&self) -> &JsonSchema {
        &self.input_schema
    }

    pub fn is_mutation(&self) -> bool {
        self.is_mutation
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn returns(&self) -> Option<&JsonSchema> {
        self.returns.as_ref()
    }

    pub fn execution_time(&self) -> Option<ExecutionTime> {
        self.execution_time
    }

    pub fn stream_options(&self) -> Option<&StreamOptions> {
        self.stream_options.as_ref()
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Handler-free view for discovery.
    pub fn info(&self) -> CommandInfo {
        CommandInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            is_mutation: self.is_mutation,
            tags: self.tags.iter().cloned().collect(),
            streaming: self.streaming,
            input_schema: self.input_schema.clone(),
            category: self.category.clone(),
            returns: self.returns.clone(),
            execution_time: self.execution_time,
        }
    }
}

impl std::fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("is_mutation", &self.is_mutation)
            .field("tags", &self.tags)
            .field("streaming", &self.streaming)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// Serializable command metadata, as returned by `list()` and sent in the
/// handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub is_mutation: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub input_schema: JsonSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<JsonSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<ExecutionTime>,
}
