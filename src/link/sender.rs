//! The user-facing sender handle

use bytes::Bytes;
use fe2o3_amqp_types::definitions::{self, MessageFormat};
use fe2o3_amqp_types::messaging::{Data, SerializableBody};
use fe2o3_amqp_types::primitives::Binary;
use tokio::sync::mpsc;

use crate::connection::{request, request_unbounded, OpTimeouts};
use crate::control::{AttachedLink, WorkItem};
use crate::error::Error;
use crate::link::delivery::{encode_message, Sendable, Settlement, Tracker};

/// An attached sender link
///
/// `send` blocks (asynchronously) while the link has no credit; `try_send`
/// fails instead. Both return a [`Tracker`] that follows the delivery to
/// settlement.
pub struct Sender {
    name: String,
    /// Target address this sender was opened with; `None` on the anonymous
    /// relay
    address: Option<String>,
    attached: AttachedLink,
    control: mpsc::Sender<WorkItem>,
    channel: u16,
    timeouts: OpTimeouts,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("name", &self.name)
            .field("link_id", &self.attached.link_id)
            .finish()
    }
}

impl Sender {
    pub(crate) fn new(
        name: String,
        address: Option<String>,
        attached: AttachedLink,
        control: mpsc::Sender<WorkItem>,
        channel: u16,
        timeouts: OpTimeouts,
    ) -> Self {
        Self {
            name,
            address,
            attached,
            control,
            channel,
            timeouts,
        }
    }

    /// Link name, unique within the session
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target address this sender was opened with; `None` on an anonymous
    /// sender
    pub fn address(&self) -> Option<String> {
        self.address.clone()
    }

    /// Maximum message size imposed by the remote peer, if any
    pub fn max_message_size(&self) -> Option<u64> {
        self.attached
            .remote_attach
            .max_message_size
            .filter(|size| *size > 0)
    }

    /// Link properties carried by the peer's Attach
    pub fn properties(&self) -> Option<fe2o3_amqp_types::definitions::Fields> {
        self.attached.remote_attach.properties.clone()
    }

    /// Capabilities offered by the peer's Attach
    pub fn offered_capabilities(&self) -> Vec<fe2o3_amqp_types::primitives::Symbol> {
        self.attached
            .remote_attach
            .offered_capabilities
            .as_ref()
            .map(|capabilities| capabilities.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Capabilities desired by the peer's Attach
    pub fn desired_capabilities(&self) -> Vec<fe2o3_amqp_types::primitives::Symbol> {
        self.attached
            .remote_attach
            .desired_capabilities
            .as_ref()
            .map(|capabilities| capabilities.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sends a message, waiting for link credit if none is available.
    ///
    /// The wait is bounded by the connection's send timeout; the returned
    /// tracker resolves separately once the delivery settles.
    pub async fn send<T: SerializableBody>(
        &self,
        sendable: impl Into<Sendable<T>>,
    ) -> Result<Tracker, Error> {
        let settlement = self.send_inner(sendable.into(), false).await?;
        Ok(Tracker::new(
            settlement,
            self.control.clone(),
            self.channel,
            self.attached.handle,
        ))
    }

    /// Sends only if credit is immediately available, failing with
    /// [`Error::IllegalState`] otherwise
    pub async fn try_send<T: SerializableBody>(
        &self,
        sendable: impl Into<Sendable<T>>,
    ) -> Result<Tracker, Error> {
        let settlement = self.send_inner(sendable.into(), true).await?;
        Ok(Tracker::new(
            settlement,
            self.control.clone(),
            self.channel,
            self.attached.handle,
        ))
    }

    async fn send_inner<T: SerializableBody>(
        &self,
        sendable: Sendable<T>,
        try_only: bool,
    ) -> Result<Settlement, Error> {
        let Sendable {
            message,
            message_format,
            settled,
        } = sendable;
        // Encoding happens here, on the caller's task
        let payload = encode_message(message)?;

        let channel = self.channel;
        let handle = self.attached.handle;
        let build = |responder| WorkItem::Send {
            channel,
            handle,
            payload,
            message_format,
            settled,
            try_only,
            responder,
        };

        match self.timeouts.send {
            Some(timeout) => request(&self.control, timeout, build).await,
            None => request_unbounded(&self.control, build).await,
        }
    }

    /// Starts a streaming delivery: body parts are emitted one at a time
    /// under a single delivery-id
    pub fn begin_streaming(&self) -> StreamingDelivery {
        StreamingDelivery {
            control: self.control.clone(),
            channel: self.channel,
            handle: self.attached.handle,
            timeouts: self.timeouts.clone(),
            message_format: 0,
            finished: false,
        }
    }

    /// Detaches the link without closing it
    pub async fn detach(self) -> Result<(), Error> {
        self.detach_inner(false, None).await
    }

    /// Closes the link; its name cannot re-attach on this session
    pub async fn close(self) -> Result<(), Error> {
        self.detach_inner(true, None).await
    }

    /// Closes the link with an error condition
    pub async fn close_with_error(self, error: definitions::Error) -> Result<(), Error> {
        self.detach_inner(true, Some(error)).await
    }

    async fn detach_inner(
        &self,
        closed: bool,
        error: Option<definitions::Error>,
    ) -> Result<(), Error> {
        let channel = self.channel;
        let handle = self.attached.handle;
        let result = request(&self.control, self.timeouts.close, |responder| {
            WorkItem::DetachLink {
                channel,
                handle,
                closed,
                error,
                responder,
            }
        })
        .await;
        match result {
            Err(Error::ResourceClosed { .. }) => Ok(()),
            other => other,
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        // Best effort: let the engine close the link if the handle is
        // dropped without an explicit close
        let (responder, _rx) = tokio::sync::oneshot::channel();
        let _ = self.control.try_send(WorkItem::DetachLink {
            channel: self.channel,
            handle: self.attached.handle,
            closed: true,
            error: None,
            responder,
        });
    }
}

/// A partial delivery in progress
///
/// Each `send_data` call emits one transfer with `more = true`;
/// [`complete`](StreamingDelivery::complete) ends the delivery and returns
/// its tracker, [`abort`](StreamingDelivery::abort) emits a terminal
/// aborted transfer.
#[derive(Debug)]
pub struct StreamingDelivery {
    control: mpsc::Sender<WorkItem>,
    channel: u16,
    handle: u32,
    timeouts: OpTimeouts,
    message_format: MessageFormat,
    finished: bool,
}

impl StreamingDelivery {
    /// Overrides the message-format announced on the first transfer
    pub fn message_format(mut self, message_format: MessageFormat) -> Self {
        self.message_format = message_format;
        self
    }

    /// Emits one Data body section as a non-final transfer
    pub async fn send_data(&mut self, data: impl Into<Vec<u8>>) -> Result<(), Error> {
        if self.finished {
            return Err(Error::illegal_state("streaming delivery already finished"));
        }
        let section = Data(Binary::from(data.into()));
        let payload = Bytes::from(serde_amqp::to_vec(&section)?);
        self.part(payload, true, false).await?;
        Ok(())
    }

    /// Emits the final transfer and returns the delivery's tracker
    pub async fn complete(mut self) -> Result<Tracker, Error> {
        self.finished = true;
        let settlement = self.part(Bytes::new(), false, false).await?;
        settlement
            .map(|settlement| {
                Tracker::new(settlement, self.control.clone(), self.channel, self.handle)
            })
            .ok_or_else(|| Error::illegal_state("streaming delivery produced no settlement"))
    }

    /// Aborts the delivery; the receiver discards everything received so
    /// far
    pub async fn abort(mut self) -> Result<(), Error> {
        self.finished = true;
        self.part(Bytes::new(), false, true).await?;
        Ok(())
    }

    async fn part(
        &self,
        payload: Bytes,
        more: bool,
        aborted: bool,
    ) -> Result<Option<Settlement>, Error> {
        let channel = self.channel;
        let handle = self.handle;
        let message_format = self.message_format;
        request(&self.control, self.timeouts.request, |responder| {
            WorkItem::StreamPart {
                channel,
                handle,
                payload,
                message_format,
                more,
                aborted,
                responder,
            }
        })
        .await
    }
}
