//! Outgoing and incoming delivery types
//!
//! A [`Tracker`] follows one outgoing delivery to settlement; a
//! [`Delivery`] is one fully reassembled incoming message whose body is
//! decoded lazily.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::Poll;

use bytes::Bytes;
use fe2o3_amqp_types::definitions::{DeliveryNumber, DeliveryTag, MessageFormat};
use fe2o3_amqp_types::messaging::message::__private::{Deserializable, Serializable};
use fe2o3_amqp_types::messaging::{Body, DeliveryState, Message, SerializableBody};
use fe2o3_amqp_types::primitives::Value;
use futures_util::Future;
use tokio::sync::{mpsc, oneshot};

use crate::control::WorkItem;
use crate::error::Error;
use crate::Payload;

/// A message plus its transfer-level options
#[derive(Debug)]
pub struct Sendable<T> {
    pub(crate) message: Message<T>,
    pub(crate) message_format: MessageFormat,
    pub(crate) settled: Option<bool>,
}

impl<T> Sendable<T> {
    /// Wraps a message with default transfer options
    pub fn new(message: impl Into<Message<T>>) -> Self {
        Self {
            message: message.into(),
            message_format: 0,
            settled: None,
        }
    }

    /// Overrides the message-format field of the first transfer
    pub fn message_format(mut self, message_format: MessageFormat) -> Self {
        self.message_format = message_format;
        self
    }

    /// Overrides the settled flag, taking precedence over the link's
    /// sender settle mode when the mode is Mixed
    pub fn settled(mut self, settled: impl Into<Option<bool>>) -> Self {
        self.settled = settled.into();
        self
    }
}

impl<T: SerializableBody> From<Message<T>> for Sendable<T> {
    fn from(message: Message<T>) -> Self {
        Self::new(message)
    }
}

/// Encodes all message sections into one payload buffer.
///
/// This is the `encode_message` half of the codec boundary; it runs on the
/// caller's task so the event loop never serializes user data.
pub(crate) fn encode_message<T: SerializableBody>(message: Message<T>) -> Result<Payload, Error> {
    use bytes::{BufMut, BytesMut};
    use serde::Serialize;

    let mut buf = BytesMut::new();
    let mut serializer = serde_amqp::ser::Serializer::from((&mut buf).writer());
    Serializable(message).serialize(&mut serializer)?;
    Ok(buf.freeze())
}

/// State of one unsettled outgoing delivery, shared between the engine
/// (which mutates it) and the user's [`Tracker`] (which reads it).
#[derive(Debug)]
pub(crate) struct TrackerShared {
    pub delivery_id: DeliveryNumber,
    pub delivery_tag: DeliveryTag,
    pub state: Mutex<TrackerCell>,
}

#[derive(Debug, Default)]
pub(crate) struct TrackerCell {
    pub local_state: Option<DeliveryState>,
    pub locally_settled: bool,
    pub remote_state: Option<DeliveryState>,
    pub remotely_settled: bool,
}

impl TrackerShared {
    pub(crate) fn new(delivery_id: DeliveryNumber, delivery_tag: DeliveryTag) -> Arc<Self> {
        Arc::new(Self {
            delivery_id,
            delivery_tag,
            state: Mutex::new(TrackerCell::default()),
        })
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, TrackerCell> {
        // A poisoned lock means a panic mid-update on the engine task; the
        // cell only holds plain values, so the data is still coherent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What the engine hands back for an accepted send request
pub(crate) struct Settlement {
    pub shared: Arc<TrackerShared>,
    pub outcome: oneshot::Receiver<Result<Option<DeliveryState>, Error>>,
}

/// Future resolving when an outgoing delivery is settled
///
/// The engine always applies the unsettled-map removal and tracker-state
/// update before completing this future, so an observer of the result also
/// observes those effects.
#[derive(Debug)]
pub struct SettlementFut {
    inner: SettlementFutInner,
}

#[derive(Debug)]
enum SettlementFutInner {
    Pending(oneshot::Receiver<Result<Option<DeliveryState>, Error>>),
    Done(Result<Option<DeliveryState>, Error>),
}

impl SettlementFut {
    pub(crate) fn new(outcome: oneshot::Receiver<Result<Option<DeliveryState>, Error>>) -> Self {
        Self {
            inner: SettlementFutInner::Pending(outcome),
        }
    }
}

impl Future for SettlementFut {
    type Output = Result<Option<DeliveryState>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            SettlementFutInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => {
                    self.inner = SettlementFutInner::Done(result.clone());
                    Poll::Ready(result)
                }
                Poll::Ready(Err(_)) => {
                    // Engine dropped the sender without answering
                    let err = Error::resource_closed("connection ended before settlement");
                    self.inner = SettlementFutInner::Done(Err(err.clone()));
                    Poll::Ready(Err(err))
                }
                Poll::Pending => Poll::Pending,
            },
            SettlementFutInner::Done(result) => Poll::Ready(result.clone()),
        }
    }
}

/// Follows one outgoing delivery from transfer to settlement
#[derive(Debug)]
pub struct Tracker {
    pub(crate) shared: Arc<TrackerShared>,
    pub(crate) fut: SettlementFut,
    pub(crate) control: mpsc::Sender<WorkItem>,
    pub(crate) channel: u16,
    pub(crate) handle: u32,
}

impl Tracker {
    pub(crate) fn new(
        settlement: Settlement,
        control: mpsc::Sender<WorkItem>,
        channel: u16,
        handle: u32,
    ) -> Self {
        Self {
            shared: settlement.shared,
            fut: SettlementFut::new(settlement.outcome),
            control,
            channel,
            handle,
        }
    }

    /// Delivery id assigned by the session
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.shared.delivery_id
    }

    /// Delivery tag assigned by the sender link
    pub fn delivery_tag(&self) -> &[u8] {
        &self.shared.delivery_tag
    }

    /// Local delivery state, if any was applied
    pub fn state(&self) -> Option<DeliveryState> {
        self.shared.lock().local_state.clone()
    }

    /// Whether the delivery is settled locally
    pub fn settled(&self) -> bool {
        self.shared.lock().locally_settled
    }

    /// Last delivery state reported by the remote peer
    pub fn remote_state(&self) -> Option<DeliveryState> {
        self.shared.lock().remote_state.clone()
    }

    /// Whether the remote peer has settled the delivery
    pub fn remote_settled(&self) -> bool {
        self.shared.lock().remotely_settled
    }

    /// Settles the delivery locally, removing it from the unsettled map.
    /// Idempotent: settling an already settled delivery is a no-op.
    pub async fn settle(&mut self) -> Result<(), Error> {
        if self.settled() {
            return Ok(());
        }
        self.request(|responder| WorkItem::TrackerDisposition {
            channel: self.channel,
            handle: self.handle,
            delivery_tag: self.shared.delivery_tag.clone(),
            state: None,
            settled: true,
            responder,
        })
        .await
    }

    /// Applies a local delivery state, optionally settling
    pub async fn disposition(
        &mut self,
        state: DeliveryState,
        settled: bool,
    ) -> Result<(), Error> {
        self.request(|responder| WorkItem::TrackerDisposition {
            channel: self.channel,
            handle: self.handle,
            delivery_tag: self.shared.delivery_tag.clone(),
            state: Some(state),
            settled,
            responder,
        })
        .await
    }

    /// Awaits settlement, returning the terminal remote state when one was
    /// observed. Completing does not require a Disposition when the link's
    /// sender settle mode is Settled.
    pub async fn settlement(&mut self) -> Result<Option<DeliveryState>, Error> {
        (&mut self.fut).await
    }

    async fn request<F>(&self, build: F) -> Result<(), Error>
    where
        F: FnOnce(oneshot::Sender<Result<(), Error>>) -> WorkItem,
    {
        let (responder, rx) = oneshot::channel();
        self.control
            .send(build(responder))
            .await
            .map_err(|_| Error::resource_closed("connection is closed"))?;
        rx.await
            .map_err(|_| Error::resource_closed("connection is closed"))?
    }
}

/// One reassembled incoming message
#[derive(Debug)]
pub struct Delivery {
    pub(crate) delivery_id: DeliveryNumber,
    pub(crate) delivery_tag: DeliveryTag,
    pub(crate) message_format: MessageFormat,
    pub(crate) remotely_settled: bool,
    pub(crate) payload: Bytes,
}

impl Delivery {
    /// Delivery id assigned by the remote session
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }

    /// Delivery tag assigned by the remote sender
    pub fn delivery_tag(&self) -> &[u8] {
        &self.delivery_tag
    }

    /// Message format from the first transfer
    pub fn message_format(&self) -> MessageFormat {
        self.message_format
    }

    /// Whether the sender pre-settled the delivery
    pub fn remotely_settled(&self) -> bool {
        self.remotely_settled
    }

    /// The undecoded section bytes, exactly as received
    pub fn raw_payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decodes the message sections.
    ///
    /// Decoding happens here, not in the engine, so a receiver that only
    /// forwards or drops payloads never pays for it.
    pub fn message(&self) -> Result<Message<Body<Value>>, Error> {
        let decoded: Deserializable<Message<Body<Value>>> =
            serde_amqp::from_slice(&self.payload)?;
        Ok(decoded.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fe2o3_amqp_types::messaging::AmqpValue;

    #[test]
    fn encode_then_lazy_decode_roundtrip() {
        let message = Message::builder().value("Hello World").build();
        let payload = encode_message(message).unwrap();

        let delivery = Delivery {
            delivery_id: 0,
            delivery_tag: vec![0u8; 8].into(),
            message_format: 0,
            remotely_settled: false,
            payload,
        };

        let decoded = delivery.message().unwrap();
        match decoded.body {
            Body::Value(AmqpValue(Value::String(s))) => assert_eq!(s, "Hello World"),
            other => panic!("expected string body, got {:?}", other),
        }
    }

    #[test]
    fn tracker_shared_updates_are_visible() {
        let shared = TrackerShared::new(7, vec![0u8; 8].into());
        {
            let mut cell = shared.lock();
            cell.remote_state = Some(DeliveryState::Accepted(
                fe2o3_amqp_types::messaging::Accepted {},
            ));
            cell.remotely_settled = true;
        }
        let cell = shared.lock();
        assert!(cell.remotely_settled);
        assert!(matches!(
            cell.remote_state,
            Some(DeliveryState::Accepted(_))
        ));
    }

    #[tokio::test]
    async fn settlement_future_caches_its_result() {
        let (tx, rx) = oneshot::channel();
        let mut fut = SettlementFut::new(rx);
        tx.send(Ok(None)).unwrap();

        assert!(matches!((&mut fut).await, Ok(None)));
        // Second await observes the cached result instead of hanging
        assert!(matches!((&mut fut).await, Ok(None)));
    }
}
