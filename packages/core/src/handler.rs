//! The contract user logic implements, plus closure adapters.

use std::future::Future;

use async_trait::async_trait;

use crate::context::FunctionContext;
use crate::JsonObject;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Request handler bound to a module name.
///
/// `process` receives the execution context and the decoded request object.
/// It may emit any number of envelopes through the context and may also
/// return a direct result, which is published after the emitted ones.
/// Returning `Ok(None)` produces no direct result.
///
/// Stateful modules override `init`, which runs once at startup before any
/// message is processed.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// One-time initialization with a context that is not bound to a message.
    ///
    /// # Errors
    ///
    /// An error aborts runtime construction.
    fn init(&self, _ctx: &FunctionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Processes one request.
    async fn process(
        &self,
        ctx: &FunctionContext,
        data: JsonObject,
    ) -> anyhow::Result<Option<JsonObject>>;
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

/// Adapter turning a synchronous closure into a [`Handler`].
pub struct FnHandler<F>(F);

/// Wraps a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&FunctionContext, JsonObject) -> anyhow::Result<Option<JsonObject>>
        + Send
        + Sync
        + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&FunctionContext, JsonObject) -> anyhow::Result<Option<JsonObject>>
        + Send
        + Sync
        + 'static,
{
    async fn process(
        &self,
        ctx: &FunctionContext,
        data: JsonObject,
    ) -> anyhow::Result<Option<JsonObject>> {
        (self.0)(ctx, data)
    }
}

/// Adapter turning a future-returning closure into a [`Handler`].
///
/// The closure receives an owned clone of the context so the returned
/// future can be `'static`; emitted envelopes are still collected.
pub struct AsyncFnHandler<F>(F);

/// Wraps a closure returning a future as a handler.
pub fn async_handler_fn<F, Fut>(f: F) -> AsyncFnHandler<F>
where
    F: Fn(FunctionContext, JsonObject) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<JsonObject>>> + Send + 'static,
{
    AsyncFnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for AsyncFnHandler<F>
where
    F: Fn(FunctionContext, JsonObject) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<JsonObject>>> + Send + 'static,
{
    async fn process(
        &self,
        ctx: &FunctionContext,
        data: JsonObject,
    ) -> anyhow::Result<Option<JsonObject>> {
        (self.0)(ctx.clone(), data).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
