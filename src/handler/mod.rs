//! Handler module - command registration and dispatch.
//!
//! Provides:
//! - [`CommandRegistry`] - maps command names to descriptors, contains failures
//! - [`CommandDescriptor`] - command metadata plus the boxed handler
//! - [`CommandContext`] - trace id, cancellation and streaming output for handlers
//! - [`JsonSchema`] / [`validate`] - input validation

mod context;
mod descriptor;
mod registry;
mod schema;

pub use context::{ChunkReceiver, CommandContext};
pub use descriptor::{CommandDescriptor, CommandInfo, ExecutionTime};
pub use registry::{
    BoxFuture, CommandRegistry, Handler, IntoEnvelope, RegistryChange, TypedHandler,
};
pub use schema::{validate, JsonSchema, SchemaType, ValidationReport, Violation};
