//! Engine-side state of a receiver link
//!
//! Owns credit, the credit-window policy, drain bookkeeping and the
//! single in-progress reassembly of a multi-transfer delivery. Completed
//! deliveries go out through an unbounded queue drained by the user-facing
//! [`Receiver`](crate::link::Receiver).

use std::collections::HashMap;

use bytes::BytesMut;
use fe2o3_amqp_types::definitions::{
    DeliveryNumber, DeliveryTag, MessageFormat, ReceiverSettleMode, Role,
};
use fe2o3_amqp_types::messaging::DeliveryState;
use fe2o3_amqp_types::performatives::{Disposition, Flow, Transfer};
use tokio::sync::mpsc;

use crate::control::{AttachedReceiver, Responder};
use crate::error::Error;
use crate::frames::{Frame, FrameBody};
use crate::link::delivery::Delivery;
use crate::link::{LinkCore, LinkState};
use crate::session::SessionTxState;
use crate::Payload;

/// Reassembly state of one multi-transfer delivery
struct Reassembly {
    delivery_id: DeliveryNumber,
    delivery_tag: DeliveryTag,
    message_format: MessageFormat,
    settled: bool,
    buffer: BytesMut,
}

pub(crate) struct ReceiverLink {
    pub core: LinkCore,

    /// Credit outstanding at the remote sender
    credit: u32,
    /// The sender's delivery-count as last observed
    delivery_count: u32,
    /// Credit the engine keeps outstanding automatically; 0 = manual
    credit_window: u32,
    /// Responder for a drain in progress
    drain_responder: Option<Responder<()>>,

    reassembly: Option<Reassembly>,
    queue_tx: mpsc::UnboundedSender<Result<Delivery, Error>>,
    /// Held until attach completes, then handed to the user handle
    queue_rx: Option<mpsc::UnboundedReceiver<Result<Delivery, Error>>>,

    /// Dispositions sent unsettled (receiver-settle-mode Second) waiting for
    /// the sender's settling disposition
    awaiting_settle: HashMap<DeliveryNumber, Responder<()>>,

    pub attach_responder: Option<Responder<AttachedReceiver>>,
    pub attach_refused: bool,
}

impl ReceiverLink {
    pub(crate) fn new(core: LinkCore, credit_window: u32) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            core,
            credit: 0,
            delivery_count: 0,
            credit_window,
            drain_responder: None,
            reassembly: None,
            queue_tx,
            queue_rx: Some(queue_rx),
            awaiting_settle: HashMap::new(),
            attach_responder: None,
            attach_refused: false,
        }
    }

    /// Completes the pending attach, handing out the delivery queue.
    ///
    /// On a re-attach after reconnect the queue was already handed out; the
    /// responder is long gone and this is a no-op.
    pub(crate) fn complete_attach(&mut self, link: crate::control::AttachedLink) {
        if let Some(responder) = self.attach_responder.take() {
            if let Some(deliveries) = self.queue_rx.take() {
                let _ = responder.send(Ok(AttachedReceiver { link, deliveries }));
            }
        }
    }

    pub(crate) fn reassembly_in_progress(&self) -> bool {
        self.reassembly.is_some()
    }

    /// Seeds the sender's delivery-count from its Attach
    pub(crate) fn set_initial_delivery_count(&mut self, count: u32) {
        self.delivery_count = count;
    }

    /// Handles `add_credit`; fails while a drain is outstanding
    pub(crate) fn add_credit(
        &mut self,
        credit: u32,
        tx: &SessionTxState,
        channel: u16,
    ) -> Result<Option<Frame>, Error> {
        if self.drain_responder.is_some() {
            return Err(Error::illegal_state(
                "cannot add credit while a drain is pending",
            ));
        }
        if credit == 0 {
            return Ok(None);
        }
        self.credit = self.credit.saturating_add(credit);
        Ok(Some(self.flow_frame(tx, channel, false)))
    }

    /// Starts a drain cycle: offer the current credit with `drain = true`
    pub(crate) fn drain(
        &mut self,
        responder: Responder<()>,
        tx: &SessionTxState,
        channel: u16,
    ) -> Option<Frame> {
        if self.drain_responder.is_some() {
            let _ = responder.send(Err(Error::illegal_state("drain already in progress")));
            return None;
        }
        if self.credit == 0 {
            // Nothing outstanding: the drain completes trivially
            let _ = responder.send(Ok(()));
            return None;
        }
        self.drain_responder = Some(responder);
        Some(self.flow_frame(tx, channel, true))
    }

    /// Reports messages consumed by the application and tops the window up
    /// once half of it has been used
    pub(crate) fn consumed(&mut self, _count: u32, tx: &SessionTxState, channel: u16) -> Option<Frame> {
        if self.credit_window == 0 || self.drain_responder.is_some() {
            return None;
        }
        if self.credit > self.credit_window / 2 {
            return None;
        }
        self.credit = self.credit_window;
        Some(self.flow_frame(tx, channel, false))
    }

    fn flow_frame(&self, tx: &SessionTxState, channel: u16, drain: bool) -> Frame {
        Frame::new(
            channel,
            FrameBody::Flow(Flow {
                next_incoming_id: Some(tx.next_incoming_id),
                incoming_window: tx.incoming_window,
                next_outgoing_id: tx.next_outgoing_id,
                outgoing_window: tx.outgoing_window,
                handle: Some(self.core.output_handle.into()),
                delivery_count: Some(self.delivery_count),
                link_credit: Some(self.credit),
                available: None,
                drain,
                echo: false,
                properties: None,
            }),
        )
    }

    /// Applies link fields of an incoming Flow.
    ///
    /// A sender answering a drain advances its delivery-count to eat the
    /// remaining credit; observing that completes the pending drain.
    pub(crate) fn on_incoming_flow(&mut self, flow: &Flow) {
        if let Some(remote_delivery_count) = flow.delivery_count {
            let advanced = remote_delivery_count.wrapping_sub(self.delivery_count);
            if advanced > 0 && flow.drain {
                self.credit = self.credit.saturating_sub(advanced);
            }
            self.delivery_count = remote_delivery_count;
        }
        if flow.drain {
            if let Some(link_credit) = flow.link_credit {
                self.credit = self.credit.min(link_credit);
            }
            if self.credit == 0 {
                if let Some(responder) = self.drain_responder.take() {
                    let _ = responder.send(Ok(()));
                }
            }
        }
    }

    /// Handles one incoming Transfer, reassembling multi-transfer
    /// deliveries. Returns a replenish Flow when an aborted delivery freed
    /// window credit.
    pub(crate) fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Payload,
        tx: &SessionTxState,
        channel: u16,
    ) -> Result<Option<Frame>, Error> {
        // Continuation transfers may omit tag and format; a present tag
        // opens a new delivery
        let is_first = self.reassembly.is_none();

        if is_first {
            if self.credit == 0 {
                // A transfer with no credit behind it violates the link's
                // transfer limit
                return Err(Error::protocol(
                    fe2o3_amqp_types::definitions::LinkError::TransferLimitExceeded,
                    "transfer arrived with no link credit outstanding",
                ));
            }
            let delivery_tag = transfer.delivery_tag.clone().ok_or_else(|| {
                Error::protocol(
                    fe2o3_amqp_types::definitions::AmqpError::InvalidField,
                    "first transfer of a delivery is missing the delivery-tag",
                )
            })?;
            let delivery_id = transfer.delivery_id.ok_or_else(|| {
                Error::protocol(
                    fe2o3_amqp_types::definitions::AmqpError::InvalidField,
                    "first transfer of a delivery is missing the delivery-id",
                )
            })?;

            // One message accepted against one unit of credit
            self.credit = self.credit.saturating_sub(1);
            self.delivery_count = self.delivery_count.wrapping_add(1);

            self.reassembly = Some(Reassembly {
                delivery_id,
                delivery_tag,
                message_format: transfer.message_format.unwrap_or(0),
                settled: transfer.settled.unwrap_or(false),
                buffer: BytesMut::from(&payload[..]),
            });
        } else if let Some(reassembly) = self.reassembly.as_mut() {
            if transfer.settled.unwrap_or(false) {
                reassembly.settled = true;
            }
            reassembly.buffer.extend_from_slice(&payload);
        }

        if transfer.aborted {
            // Reassembly is discarded without dispatch; top the window up so
            // the aborted message does not eat credit forever
            self.reassembly = None;
            let replenish = self.consumed(1, tx, channel);
            if self.drain_responder.is_some() && self.credit == 0 {
                if let Some(responder) = self.drain_responder.take() {
                    let _ = responder.send(Ok(()));
                }
            }
            return Ok(replenish);
        }

        if transfer.more {
            return Ok(None);
        }

        if let Some(reassembly) = self.reassembly.take() {
            // A link in DetachSent still keeps the protocol numbers straight
            // but its deliveries are no longer surfaced
            if self.core.state != LinkState::DetachSent {
                let delivery = Delivery {
                    delivery_id: reassembly.delivery_id,
                    delivery_tag: reassembly.delivery_tag,
                    message_format: reassembly.message_format,
                    remotely_settled: reassembly.settled,
                    payload: reassembly.buffer.freeze(),
                };
                // The queue is unbounded so the event loop never blocks here;
                // depth is bounded by outstanding credit
                let _ = self.queue_tx.send(Ok(delivery));
            }
        }

        if self.drain_responder.is_some() && self.credit == 0 {
            if let Some(responder) = self.drain_responder.take() {
                let _ = responder.send(Ok(()));
            }
        }

        Ok(None)
    }

    /// Builds the Disposition for a user settlement call
    pub(crate) fn disposition(
        &mut self,
        delivery_id: DeliveryNumber,
        state: DeliveryState,
        settled: bool,
        channel: u16,
        responder: Responder<()>,
    ) -> Option<Frame> {
        let settled = match self.core.rcv_settle_mode {
            // Mode First settles immediately regardless of what was asked
            ReceiverSettleMode::First => true,
            ReceiverSettleMode::Second => settled,
        };

        let frame = Frame::new(
            channel,
            FrameBody::Disposition(Disposition {
                role: Role::Receiver,
                first: delivery_id,
                last: None,
                settled,
                state: Some(state),
                batchable: false,
            }),
        );

        if settled {
            let _ = responder.send(Ok(()));
        } else {
            // Mode Second: completion waits for the sender's settling
            // disposition
            self.awaiting_settle.insert(delivery_id, responder);
        }
        Some(frame)
    }

    /// Sender dispositions referencing unsettled receiver state
    pub(crate) fn on_incoming_disposition(
        &mut self,
        first: DeliveryNumber,
        last: DeliveryNumber,
        remotely_settled: bool,
    ) {
        if !remotely_settled {
            return;
        }
        let mut id = first;
        loop {
            if let Some(responder) = self.awaiting_settle.remove(&id) {
                let _ = responder.send(Ok(()));
            }
            if id == last {
                break;
            }
            id = id.wrapping_add(1);
        }
    }

    /// Pushes the closure cause into the delivery queue and fails waiters
    pub(crate) fn fail_all(&mut self, cause: &Error) {
        let _ = self.queue_tx.send(Err(cause.clone()));
        if let Some(responder) = self.drain_responder.take() {
            let _ = responder.send(Err(cause.clone()));
        }
        for (_, responder) in self.awaiting_settle.drain() {
            let _ = responder.send(Err(cause.clone()));
        }
        if let Some(responder) = self.attach_responder.take() {
            let _ = responder.send(Err(cause.clone()));
        }
        if let Some(responder) = self.core.detach_responder.take() {
            let _ = responder.send(Err(cause.clone()));
        }
    }

    /// Drops in-flight state ahead of a re-attach, keeping the delivery
    /// queue and its already-completed messages intact
    pub(crate) fn reset_for_reattach(&mut self, cause: &Error) {
        self.core.state = LinkState::Detached;
        self.core.input_handle = None;
        self.core.remote_attach = None;
        self.reassembly = None;
        self.delivery_count = 0;
        for (_, responder) in self.awaiting_settle.drain() {
            let _ = responder.send(Err(cause.clone()));
        }
        if let Some(responder) = self.drain_responder.take() {
            let _ = responder.send(Err(cause.clone()));
        }
    }

    /// Re-issues the credit outstanding before a reconnect
    pub(crate) fn reissue_credit(&mut self, tx: &SessionTxState, channel: u16) -> Option<Frame> {
        if self.credit_window > 0 {
            self.credit = self.credit_window;
        }
        match self.credit {
            0 => None,
            _ => Some(self.flow_frame(tx, channel, false)),
        }
    }
}

pub(crate) fn attach_refused(attach: &fe2o3_amqp_types::performatives::Attach) -> bool {
    attach.source.is_none()
}
