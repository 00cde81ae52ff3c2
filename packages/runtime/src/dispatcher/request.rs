//! Per-message processing.
//!
//! Order within one task: start metrics, wait on the admission gate,
//! re-check shutdown, decode, invoke the handler, publish, record the
//! outcome, acknowledge. Each message is acknowledged at most once, and
//! never when its payload could not be decoded or it was abandoned.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use fstream_core::{Envelope, FunctionContext, JsonObject, MessageMetadata};
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, field, info_span, warn, Instrument};

use super::Dispatcher;
use crate::broker::InboundMessage;
use crate::error::ProcessError;

/// How a message left the pipeline without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Completed,
    /// Shutdown was observed after admission; left unacknowledged.
    Abandoned,
}

impl Dispatcher {
    /// Processes one message to completion.
    ///
    /// Registers itself in the task registry for its whole duration. Handler
    /// and publish failures have already been answered (error envelope, ack)
    /// when this returns their error; decode failures are returned without a
    /// response or acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the [`ProcessError`] that ended the request.
    pub async fn process_request(&self, message: InboundMessage) -> Result<(), ProcessError> {
        let _guard = self.tasks.register();
        self.handle_message(message).await
    }

    /// [`process_request`](Self::process_request) for tasks the consume loop
    /// already registered.
    pub(super) async fn handle_message(&self, message: InboundMessage) -> Result<(), ProcessError> {
        let span = info_span!(
            "request",
            topic = %message.topic,
            message_id = %message.message_id,
            request_id = message.request_id().unwrap_or_default(),
            outcome = field::Empty,
            duration_ms = field::Empty,
        );

        async move {
            let start = Instant::now();
            let result = self.handle_admitted(&message).await;

            let outcome = match &result {
                Ok(Disposition::Completed) => "ok",
                Ok(Disposition::Abandoned) => "abandoned",
                Err(e) if e.is_decode() => "decode_error",
                Err(_) => "error",
            };
            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);
            debug!(duration_ms, outcome, "request complete");

            result.map(|_| ())
        }
        .instrument(span)
        .await
    }

    async fn handle_admitted(&self, message: &InboundMessage) -> Result<Disposition, ProcessError> {
        let scope = self.metrics.begin_request();

        // A closed gate means teardown has begun.
        let Ok(_permit) = self.gate.acquire().await else {
            debug!("admission gate closed; abandoning message");
            return Ok(Disposition::Abandoned);
        };
        if self.lifecycle.is_shutting_down() {
            debug!("shutdown in progress; abandoning message");
            return Ok(Disposition::Abandoned);
        }
        debug!(queued = ?scope.elapsed(), "admitted");

        let request_id = message.request_id();
        let destination = self.resolve_destination(message);

        match self.execute(message, destination, request_id).await {
            Ok(()) => {
                scope.finish(true);
                self.metrics.record_event(true);
                self.acknowledge(message).await;
                Ok(Disposition::Completed)
            }
            Err(err) if err.is_decode() => {
                scope.finish(false);
                self.metrics.record_event(false);
                Err(err)
            }
            Err(err) => {
                scope.finish(false);
                self.metrics.record_event(false);
                if let (Some(request_id), Some(topic)) = (request_id, destination) {
                    self.send_error_response(topic, request_id, &err).await;
                }
                self.acknowledge(message).await;
                Err(err)
            }
        }
    }

    /// Decodes, invokes the handler and publishes whatever it produced.
    async fn execute(
        &self,
        message: &InboundMessage,
        destination: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<(), ProcessError> {
        let data = decode_payload(&message.payload)?;

        let ctx = FunctionContext::for_message(
            Arc::clone(&self.module),
            Arc::clone(&self.settings),
            MessageMetadata {
                topic: message.topic.clone(),
                message_id: message.message_id.clone(),
            },
        );
        // A panicking handler takes the same error path as a failing one.
        let returned = AssertUnwindSafe(self.handler.process(&ctx, data))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic)))
            })
            .map_err(ProcessError::Handler)?;

        let mut envelopes = ctx.take_emitted();
        if let Some(data) = returned.filter(|d| !d.is_empty()) {
            envelopes.push(Envelope::stamped_now(data));
        }

        let Some(topic) = destination else {
            if !envelopes.is_empty() {
                warn!(
                    dropped = envelopes.len(),
                    "no response topic or sink configured; dropping output"
                );
            }
            return Ok(());
        };
        self.send_response(topic, request_id, envelopes).await?;
        Ok(())
    }

    /// Per-message override first, then the configured sink.
    fn resolve_destination<'a>(&'a self, message: &'a InboundMessage) -> Option<&'a str> {
        message
            .response_topic()
            .or_else(|| self.config.sink_topic())
    }

    async fn send_error_response(&self, topic: &str, request_id: &str, err: &ProcessError) {
        if self.lifecycle.is_shutting_down() {
            warn!("shutdown in progress; not sending error response");
            return;
        }
        let envelope = Envelope::error(err.to_string());
        if let Err(e) = self
            .send_response(topic, Some(request_id), vec![envelope])
            .await
        {
            tracing::error!(topic, error = %e, "failed to send error response");
        }
    }

    async fn acknowledge(&self, message: &InboundMessage) {
        let Some(consumer) = self.consumer() else {
            warn!("consumer closed; message left unacknowledged");
            return;
        };
        if let Err(e) = consumer.acknowledge(message).await {
            warn!(error = %e, "failed to acknowledge message");
        }
    }
}

/// Parses a payload that must be a JSON object.
fn decode_payload(payload: &[u8]) -> Result<JsonObject, ProcessError> {
    match serde_json::from_slice::<Value>(payload).map_err(ProcessError::Decode)? {
        Value::Object(map) => Ok(map),
        other => Err(ProcessError::NotAnObject {
            kind: json_kind(&other),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
