//! The user-facing receiver handle

use std::time::Duration;

use fe2o3_amqp_types::definitions::{self, Fields};
use fe2o3_amqp_types::messaging::{Accepted, DeliveryState, Modified, Rejected, Released};
use tokio::sync::mpsc;

use crate::connection::{request, OpTimeouts};
use crate::control::{AttachedReceiver, WorkItem};
use crate::error::Error;
use crate::link::delivery::Delivery;

/// An attached receiver link
///
/// Completed deliveries queue inside the handle; `recv` awaits them,
/// `try_recv` polls. Settlement is explicit through
/// [`accept`](Receiver::accept) and friends.
pub struct Receiver {
    name: String,
    attached: AttachedReceiver,
    credit_window: u32,
    control: mpsc::Sender<WorkItem>,
    channel: u16,
    timeouts: OpTimeouts,
    /// Failure observed on the queue; replayed to every later call
    failure: Option<Error>,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("link_id", &self.attached.link.link_id)
            .finish()
    }
}

impl Receiver {
    pub(crate) fn new(
        name: String,
        attached: AttachedReceiver,
        credit_window: u32,
        control: mpsc::Sender<WorkItem>,
        channel: u16,
        timeouts: OpTimeouts,
    ) -> Self {
        Self {
            name,
            attached,
            credit_window,
            control,
            channel,
            timeouts,
            failure: None,
        }
    }

    /// Link name, unique within the session
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source address confirmed by the remote peer. For a dynamic receiver
    /// this is the server-assigned node address.
    pub fn source_address(&self) -> Option<String> {
        self.attached
            .link
            .remote_attach
            .source
            .as_ref()
            .and_then(|source| source.address.clone())
    }

    /// Link properties carried by the peer's Attach
    pub fn properties(&self) -> Option<Fields> {
        self.attached.link.remote_attach.properties.clone()
    }

    /// Capabilities offered by the peer's Attach
    pub fn offered_capabilities(&self) -> Vec<fe2o3_amqp_types::primitives::Symbol> {
        self.attached
            .link
            .remote_attach
            .offered_capabilities
            .as_ref()
            .map(|capabilities| capabilities.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Awaits the next delivery.
    ///
    /// Fails once the link, session or connection is closed; the cause is
    /// sticky and repeated on every later call.
    pub async fn recv(&mut self) -> Result<Delivery, Error> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        match self.attached.deliveries.recv().await {
            Some(Ok(delivery)) => {
                self.report_consumed();
                Ok(delivery)
            }
            Some(Err(err)) => {
                self.failure = Some(err.clone());
                Err(err)
            }
            None => {
                let err = Error::resource_closed("receiver is closed");
                self.failure = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Awaits the next delivery up to `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Delivery, Error> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimedOut),
        }
    }

    /// Returns the next delivery if one is already queued
    pub fn try_recv(&mut self) -> Result<Option<Delivery>, Error> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        match self.attached.deliveries.try_recv() {
            Ok(Ok(delivery)) => {
                self.report_consumed();
                Ok(Some(delivery))
            }
            Ok(Err(err)) => {
                self.failure = Some(err.clone());
                Err(err)
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                let err = Error::resource_closed("receiver is closed");
                self.failure = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Lets the engine top the credit window back up
    fn report_consumed(&self) {
        if self.credit_window > 0 {
            let _ = self.control.try_send(WorkItem::Consumed {
                channel: self.channel,
                handle: self.attached.link.handle,
                count: 1,
            });
        }
    }

    /// Grants `credit` more deliveries to the remote sender.
    ///
    /// Fails with [`Error::IllegalState`] while a drain is pending.
    pub async fn add_credit(&self, credit: u32) -> Result<(), Error> {
        let channel = self.channel;
        let handle = self.attached.link.handle;
        request(&self.control, self.timeouts.request, |responder| {
            WorkItem::AddCredit {
                channel,
                handle,
                credit,
                responder,
            }
        })
        .await
    }

    /// Asks the sender to use up all outstanding credit, either by
    /// delivering messages or by advancing its delivery-count. Completes
    /// when the credit reaches zero.
    pub async fn drain(&self) -> Result<(), Error> {
        let channel = self.channel;
        let handle = self.attached.link.handle;
        request(&self.control, self.timeouts.request, |responder| {
            WorkItem::Drain {
                channel,
                handle,
                responder,
            }
        })
        .await
    }

    /// Accepts the delivery
    pub async fn accept(&self, delivery: &Delivery) -> Result<(), Error> {
        self.disposition(delivery, DeliveryState::Accepted(Accepted {}), true)
            .await
    }

    /// Rejects the delivery with an optional error
    pub async fn reject(
        &self,
        delivery: &Delivery,
        error: impl Into<Option<definitions::Error>>,
    ) -> Result<(), Error> {
        self.disposition(
            delivery,
            DeliveryState::Rejected(Rejected {
                error: error.into(),
            }),
            true,
        )
        .await
    }

    /// Releases the delivery back to the sender
    pub async fn release(&self, delivery: &Delivery) -> Result<(), Error> {
        self.disposition(delivery, DeliveryState::Released(Released {}), true)
            .await
    }

    /// Modifies the delivery, optionally blocking redelivery here
    pub async fn modify(
        &self,
        delivery: &Delivery,
        delivery_failed: bool,
        undeliverable_here: bool,
        message_annotations: impl Into<Option<Fields>>,
    ) -> Result<(), Error> {
        self.disposition(
            delivery,
            DeliveryState::Modified(Modified {
                delivery_failed: Some(delivery_failed),
                undeliverable_here: Some(undeliverable_here),
                message_annotations: message_annotations.into(),
            }),
            true,
        )
        .await
    }

    /// Emits a Disposition with an explicit state. Under
    /// receiver-settle-mode Second an unsettled disposition completes only
    /// after the sender's settling answer.
    pub async fn disposition(
        &self,
        delivery: &Delivery,
        state: DeliveryState,
        settled: bool,
    ) -> Result<(), Error> {
        let channel = self.channel;
        let handle = self.attached.link.handle;
        let delivery_id = delivery.delivery_id();
        request(&self.control, self.timeouts.request, |responder| {
            WorkItem::Disposition {
                channel,
                handle,
                delivery_id,
                state,
                settled,
                responder,
            }
        })
        .await
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
        let handle = self.attached.link.handle;
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

impl Drop for Receiver {
    fn drop(&mut self) {
        let (responder, _rx) = tokio::sync::oneshot::channel();
        let _ = self.control.try_send(WorkItem::DetachLink {
            channel: self.channel,
            handle: self.attached.link.handle,
            closed: true,
            error: None,
            responder,
        });
    }
}
