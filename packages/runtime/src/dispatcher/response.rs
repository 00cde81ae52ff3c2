//! Response publishing.

use fstream_core::Envelope;
use futures_util::future::join_all;
use tracing::debug;

use super::Dispatcher;
use crate::broker::{OutboundMessage, REQUEST_ID_PROPERTY};
use crate::error::PublishError;

impl Dispatcher {
    /// Publishes `envelopes` to `topic`, tagged with `request_id` if given.
    ///
    /// All sends are issued concurrently and awaited to completion. Delivery
    /// is best-effort: envelopes that went out stay published even when
    /// others in the batch failed.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Producer`] if no producer could be obtained
    /// - [`PublishError::Encode`] if an envelope cannot be serialized
    /// - [`PublishError::Send`] if at least one send failed
    pub async fn send_response(
        &self,
        topic: &str,
        request_id: Option<&str>,
        envelopes: Vec<Envelope>,
    ) -> Result<(), PublishError> {
        if envelopes.is_empty() {
            debug!(topic, "nothing to publish");
            return Ok(());
        }

        let producer = self
            .producers
            .get_or_create(topic)
            .await
            .map_err(|source| PublishError::Producer {
                topic: topic.to_string(),
                source,
            })?;

        let messages = envelopes
            .iter()
            .map(|envelope| outbound(envelope, request_id))
            .collect::<Result<Vec<_>, _>>()?;
        let total = messages.len();

        let results = join_all(messages.into_iter().map(|m| producer.send(m))).await;

        let mut failures = results.into_iter().filter_map(Result::err);
        match failures.next() {
            None => {
                debug!(topic, total, "response published");
                Ok(())
            }
            Some(first) => Err(PublishError::Send {
                failed: 1 + failures.count(),
                total,
                first,
            }),
        }
    }
}

fn outbound(envelope: &Envelope, request_id: Option<&str>) -> Result<OutboundMessage, PublishError> {
    let payload = envelope.to_payload().map_err(PublishError::Encode)?;
    let message = OutboundMessage::new(payload).with_event_timestamp(envelope.event_timestamp_millis());
    Ok(match request_id {
        Some(id) => message.with_property(REQUEST_ID_PROPERTY, id),
        None => message,
    })
}
