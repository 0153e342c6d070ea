//! # cmdwire
//!
//! Call named, schema-validated commands the same way whether the handlers live in
//! this process or behind a socket.
//!
//! ## Architecture
//!
//! - **Registry**: [`CommandRegistry`] maps names to handlers and always answers with a
//!   [`ResultEnvelope`], never a panic or raw error
//! - **Transports**: direct (in-process), request/response (one reply per request) and
//!   streaming (persistent, multiplexed, reconnecting)
//! - **Server**: serves a registry to the remote transports over length-prefixed frames
//! - **Client**: one facade over any transport, with batches, pipelines, progressive
//!   output and connection events
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use cmdwire::{Client, CommandDescriptor, CommandError, CommandRegistry};
//! use serde_json::{json, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = Arc::new(CommandRegistry::new());
//! registry
//!     .register(CommandDescriptor::new("echo", |input: Value, _ctx| async move {
//!         Ok::<_, CommandError>(input)
//!     }))
//!     .unwrap();
//!
//! let client = Client::builder().direct(registry);
//! let result = client.call("echo", json!({"v": 1})).await;
//! assert_eq!(result.data(), Some(&json!({"v": 1})));
//! # }
//! ```

pub mod batch;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod writer;

mod client;
mod server;
#[cfg(test)]
mod testing;

pub use batch::{BatchItem, BatchOptions, BatchRequest, BatchResult};
pub use client::{Client, ClientBuilder, ALL_EVENTS};
pub use config::{ClientConfig, ServerConfig};
pub use envelope::{codes, failure, success, CommandError, ResultEnvelope, ResultMeta};
pub use error::WireError;
pub use handler::{CommandContext, CommandDescriptor, CommandInfo, CommandRegistry, ExecutionTime};
pub use pipeline::{Condition, PipelineRequest, PipelineResult, PipelineStep};
pub use server::{Server, COMMANDS_CHANGED_EVENT};
pub use stream::{StreamCallbacks, StreamChunk, StreamOptions};
pub use transport::{CallOptions, ConnectionState, TransportEvent, TransportKind};
