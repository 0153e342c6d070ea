//! In-process transport.
//!
//! Calls go straight into a co-located [`CommandRegistry`]: no serialization, no
//! connection state. The only failures are the registry's own, plus `TIMEOUT` and
//! `CANCELLED` when the caller passes a timeout or a cancellation token.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::{CallOptions, Transport, TransportKind};
use crate::envelope::{failure, CommandError, ResultEnvelope};
use crate::handler::{CommandContext, CommandRegistry};
use crate::stream::{StreamCallbacks, StreamChunk};

/// Transport that invokes a registry in the same process.
#[derive(Debug, Clone)]
pub struct DirectTransport {
    registry: Arc<CommandRegistry>,
}

impl DirectTransport {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }
}

/// Handler context for a call. The handler sees the caller's cancellation
/// through a child token, so cancelling it here never leaks back to the caller.
fn context_for(opts: &CallOptions) -> CommandContext {
    let token = match &opts.cancel {
        Some(token) => token.child_token(),
        None => Default::default(),
    };
    let ctx = CommandContext::new()
        .with_source("direct")
        .with_cancellation(token);
    match &opts.trace_id {
        Some(trace_id) => ctx.with_trace_id(trace_id.clone()),
        None => ctx,
    }
}

/// Run `fut` under the caller's timeout and cancellation token.
pub(crate) async fn bounded<F>(name: &str, fut: F, opts: &CallOptions) -> ResultEnvelope
where
    F: Future<Output = ResultEnvelope>,
{
    let timed = async {
        match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                debug!(command = %name, timeout_ms = limit.as_millis() as u64, "Call timed out");
                failure(CommandError::timeout(name, limit.as_millis() as u64))
            }),
            None => fut.await,
        }
    };

    tokio::select! {
        biased;
        _ = opts.cancelled() => failure(CommandError::cancelled(format!(
            "Call to '{}' was cancelled",
            name
        ))),
        envelope = timed => envelope,
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn call(&self, name: &str, input: Value, opts: CallOptions) -> ResultEnvelope {
        let ctx = context_for(&opts);
        // Stop a handler that outlives an abandoned call.
        let _guard = ctx.cancellation().clone().drop_guard();
        bounded(name, self.registry.execute_with(name, input, ctx), &opts).await
    }

    async fn call_stream(
        &self,
        name: &str,
        input: Value,
        callbacks: &StreamCallbacks,
        opts: CallOptions,
    ) -> ResultEnvelope {
        let started = Instant::now();
        let mut ctx = context_for(&opts);
        let _guard = ctx.cancellation().clone().drop_guard();
        let mut chunks = ctx.attach_stream();

        let run = bounded(name, self.registry.execute_with(name, input, ctx), &opts);
        tokio::pin!(run);

        let envelope = loop {
            tokio::select! {
                biased;
                Some(chunk) = chunks.recv() => callbacks.dispatch(&chunk),
                envelope = &mut run => break envelope,
            }
        };
        while let Ok(chunk) = chunks.try_recv() {
            callbacks.dispatch(&chunk);
        }

        let elapsed = started.elapsed().as_millis() as u64;
        callbacks.dispatch(&StreamChunk::terminal_for(&envelope, Some(elapsed)));
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::codes;
    use crate::handler::CommandDescriptor;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn transport() -> DirectTransport {
        let registry = CommandRegistry::new();
        registry
            .register(CommandDescriptor::new("echo", |input: Value, _ctx| async move {
                Ok::<_, CommandError>(input)
            }))
            .unwrap();
        registry
            .register(CommandDescriptor::new("hang", |_: Value, ctx: CommandContext| async move {
                ctx.cancelled().await;
                Err::<Value, _>(CommandError::cancelled("stopped"))
            }))
            .unwrap();
        registry
            .register(
                CommandDescriptor::new("count", |n: u32, ctx: CommandContext| async move {
                    for i in 0..n {
                        ctx.progress(100.0 * f64::from(i + 1) / f64::from(n), "counting");
                        ctx.data(json!(i));
                    }
                    Ok::<_, CommandError>(n)
                })
                .streaming(),
            )
            .unwrap();
        DirectTransport::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_call_returns_registry_envelope() {
        let transport = transport();
        let result = transport.call("echo", json!({"v": 1}), CallOptions::new()).await;
        assert_eq!(result.data(), Some(&json!({"v": 1})));

        let result = transport.call("ghost", json!({}), CallOptions::new()).await;
        assert_eq!(result.error_code(), Some(codes::NOT_FOUND));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let transport = transport();
        let opts = CallOptions::new().with_timeout(Duration::from_millis(50));
        let result = transport.call("hang", json!(null), opts).await;
        assert_eq!(result.error_code(), Some(codes::TIMEOUT));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let transport = transport();
        let token = CancellationToken::new();
        let opts = CallOptions::new().with_cancel(token.clone());

        let call = tokio::spawn(async move { transport.call("hang", json!(null), opts).await });
        tokio::task::yield_now().await;
        token.cancel();

        let result = call.await.unwrap();
        assert_eq!(result.error_code(), Some(codes::CANCELLED));
    }

    #[tokio::test]
    async fn test_call_stream_delivers_chunks_then_terminal() {
        let transport = transport();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let callbacks = {
            let (a, b, c) = (seen.clone(), seen.clone(), seen.clone());
            StreamCallbacks::new()
                .on_progress(move |p| a.lock().push(format!("progress {}", p.progress)))
                .on_data(move |d| b.lock().push(format!("data {}", d.data)))
                .on_complete(move |done| c.lock().push(format!("complete {}", done.data)))
        };

        let result = transport
            .call_stream("count", json!(2), &callbacks, CallOptions::new())
            .await;
        assert_eq!(result.data(), Some(&json!(2)));
        assert_eq!(
            *seen.lock(),
            vec!["progress 50", "data 0", "progress 100", "data 1", "complete 2"]
        );
    }
}
