//! Command registry and dispatch.
//!
//! The registry maps command names to descriptors. [`CommandRegistry::execute`] is
//! the one place where handler failures are contained: unknown names, invalid
//! input and handler panics all come back as failure envelopes.
//!
//! # Example
//!
//! ```
//! use cmdwire::handler::{CommandDescriptor, CommandRegistry};
//! use cmdwire::envelope::CommandError;
//! use serde_json::{json, Value};
//!
//! # tokio_test_block_on(async {
//! let registry = CommandRegistry::new();
//! registry
//!     .register(CommandDescriptor::new("echo", |input: Value, _ctx| async move {
//!         Ok::<_, CommandError>(input)
//!     }))
//!     .unwrap();
//!
//! let result = registry.execute("echo", json!({"v": 1})).await;
//! assert_eq!(result.data(), Some(&json!({"v": 1})));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error};

use super::descriptor::{CommandDescriptor, CommandInfo};
use super::schema;
use super::CommandContext;
use crate::envelope::{failure, success, CommandError, ResultEnvelope};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased command handler.
pub trait Handler: Send + Sync + 'static {
    /// Run the command with already-validated input.
    fn call(&self, input: Value, ctx: CommandContext) -> BoxFuture<'static, ResultEnvelope>;
}

/// Anything a handler function may return.
pub trait IntoEnvelope {
    fn into_envelope(self) -> ResultEnvelope;
}

impl<O: Serialize> IntoEnvelope for Result<O, CommandError> {
    fn into_envelope(self) -> ResultEnvelope {
        match self {
            Ok(data) => success(data).into_value(),
            Err(error) => failure(error),
        }
    }
}

impl<O: Serialize> IntoEnvelope for ResultEnvelope<O> {
    fn into_envelope(self) -> ResultEnvelope {
        self.into_value()
    }
}

/// Wrapper that deserializes the input before calling the handler.
pub struct TypedHandler<F, T, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, CommandContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoEnvelope,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, CommandContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoEnvelope,
{
    fn call(&self, input: Value, ctx: CommandContext) -> BoxFuture<'static, ResultEnvelope> {
        let parsed: T = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => {
                let err = CommandError::validation(format!("Input could not be decoded: {}", e));
                return Box::pin(async move { failure(err) });
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move { fut.await.into_envelope() })
    }
}

/// Change notification emitted by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Registered(String),
    Unregistered(String),
}

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Registry mapping command names to descriptors.
///
/// Shared by reference (`Arc<CommandRegistry>`); registration takes `&self`.
/// The registry imposes no ordering between concurrent `execute` calls.
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, Arc<CommandDescriptor>>>,
    changes: broadcast::Sender<RegistryChange>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            commands: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Register a command. Fails with `DUPLICATE_COMMAND` if the name is taken.
    pub fn register(&self, descriptor: CommandDescriptor) -> Result<(), CommandError> {
        let name = descriptor.name().to_string();
        {
            let mut commands = self.commands.write();
            if commands.contains_key(&name) {
                return Err(CommandError::duplicate_command(&name));
            }
            commands.insert(name.clone(), Arc::new(descriptor));
        }
        debug!(command = %name, "Registered command");
        let _ = self.changes.send(RegistryChange::Registered(name));
        Ok(())
    }

    /// Remove a command. Returns false if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.commands.write().remove(name).is_some();
        if removed {
            debug!(command = %name, "Unregistered command");
            let _ = self
                .changes
                .send(RegistryChange::Unregistered(name.to_string()));
        }
        removed
    }

    pub fn has(&self, name: &str) -> bool {
        self.commands.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CommandDescriptor>> {
        self.commands.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata of every registered command, sorted by name.
    pub fn list(&self) -> Vec<CommandInfo> {
        self.collect_info(|_| true)
    }

    /// Metadata of the commands carrying `tag`, sorted by name.
    pub fn list_by_tag(&self, tag: &str) -> Vec<CommandInfo> {
        self.collect_info(|d| d.has_tag(tag))
    }

    /// Metadata of the commands in `category`, sorted by name.
    pub fn list_by_category(&self, category: &str) -> Vec<CommandInfo> {
        self.collect_info(|d| d.category() == Some(category))
    }

    /// Distinct categories in use, sorted.
    pub fn categories(&self) -> Vec<String> {
        let categories: std::collections::BTreeSet<String> = self
            .commands
            .read()
            .values()
            .filter_map(|d| d.category().map(str::to_string))
            .collect();
        categories.into_iter().collect()
    }

    fn collect_info(&self, keep: impl Fn(&CommandDescriptor) -> bool) -> Vec<CommandInfo> {
        let mut infos: Vec<CommandInfo> = self
            .commands
            .read()
            .values()
            .filter(|d| keep(d))
            .map(|d| d.info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.read().is_empty()
    }

    /// Subscribe to registration changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    /// Execute a command with a default context.
    pub async fn execute(&self, name: &str, input: Value) -> ResultEnvelope {
        self.execute_with(name, input, CommandContext::new()).await
    }

    /// Execute a command.
    ///
    /// Never panics and never returns anything but an envelope:
    /// - unknown name: `NOT_FOUND`
    /// - input failing the schema: `VALIDATION_ERROR`
    /// - handler panic: `INTERNAL_ERROR` with the panic message in `details.panic`
    pub async fn execute_with(
        &self,
        name: &str,
        input: Value,
        ctx: CommandContext,
    ) -> ResultEnvelope {
        let descriptor = match self.get(name) {
            Some(d) => d,
            None => {
                debug!(command = %name, "Unknown command");
                return failure(CommandError::unknown_command(name, &self.names()));
            }
        };

        let report = schema::validate(descriptor.input_schema(), &input);
        if let Some(err) = report.to_error() {
            debug!(command = %name, violations = report.errors.len(), "Input rejected");
            return failure(err);
        }

        let ctx = match descriptor.stream_options() {
            Some(options) => ctx.with_stream_options(options.clone()),
            None => ctx,
        };
        let handler = descriptor.handler().clone();
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(input, ctx))) {
            Ok(fut) => fut,
            Err(panic) => return panicked(name, panic),
        };

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(envelope) => envelope,
            Err(panic) => panicked(name, panic),
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

fn panicked(name: &str, panic: Box<dyn std::any::Any + Send>) -> ResultEnvelope {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());

    error!(command = %name, panic = %message, "Command handler panicked");
    failure(
        CommandError::internal(format!("Command '{}' failed: {}", name, message))
            .with_detail("command", json!(name))
            .with_detail("panic", json!(message)),
    )
}
