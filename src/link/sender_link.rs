//! Engine-side state of a sender link
//!
//! Owns credit, the pending-send queue and the unsettled map. All methods
//! run on the connection event loop; frames they produce are handed back to
//! the session for writing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use fe2o3_amqp_types::definitions::{
    DeliveryNumber, DeliveryTag, MessageFormat, ReceiverSettleMode, Role, SenderSettleMode,
};
use fe2o3_amqp_types::messaging::DeliveryState;
use fe2o3_amqp_types::performatives::{Attach, Disposition, Flow, Transfer};
use tokio::sync::oneshot;

use crate::control::{AttachedLink, Responder};
use crate::error::Error;
use crate::frames::{Frame, FrameBody};
use crate::link::delivery::{Settlement, TrackerShared};
use crate::link::{LinkCore, LinkState};
use crate::session::SessionTxState;
use crate::Payload;

/// Estimated bytes of frame header plus transfer performative, reserved out
/// of the negotiated max frame size when fragmenting payloads
const TRANSFER_OVERHEAD: usize = 64;

/// A send accepted while the link had no credit or window
pub(crate) struct PendingSend {
    pub payload: Payload,
    pub message_format: MessageFormat,
    pub settled: Option<bool>,
    pub responder: Responder<Settlement>,
}

/// One entry of the unsettled map
pub(crate) struct UnsettledDelivery {
    pub shared: Arc<TrackerShared>,
    pub outcome: Option<oneshot::Sender<Result<Option<DeliveryState>, Error>>>,
}

/// An in-progress streaming delivery
pub(crate) struct StreamingState {
    delivery_id: DeliveryNumber,
    delivery_tag: DeliveryTag,
    first_sent: bool,
    settlement: Option<Settlement>,
}

pub(crate) struct SenderLink {
    pub core: LinkCore,
    pub auto_settle: bool,

    /// Local delivery count; resets with each attach
    delivery_count: u32,
    /// Credit granted by the remote receiver
    credit: u32,
    /// Remote requested drain mode
    drain: bool,

    tag_seq: u64,
    pending: VecDeque<PendingSend>,
    streaming: Option<StreamingState>,
    unsettled: HashMap<DeliveryTag, UnsettledDelivery>,
    tag_by_delivery_id: HashMap<DeliveryNumber, DeliveryTag>,

    pub attach_responder: Option<Responder<AttachedLink>>,
    /// Remote attach echoed a null target: expect a closing detach next
    pub attach_refused: bool,
}

impl SenderLink {
    pub(crate) fn new(core: LinkCore, auto_settle: bool) -> Self {
        Self {
            core,
            auto_settle,
            delivery_count: 0,
            credit: 0,
            drain: false,
            tag_seq: 0,
            pending: VecDeque::new(),
            streaming: None,
            unsettled: HashMap::new(),
            tag_by_delivery_id: HashMap::new(),
            attach_responder: None,
            attach_refused: false,
        }
    }

    /// Next monotonic 8-byte delivery tag
    fn next_tag(&mut self) -> DeliveryTag {
        let tag = self.tag_seq.to_be_bytes().to_vec();
        self.tag_seq = self.tag_seq.wrapping_add(1);
        tag.into()
    }

    /// Applies link fields of an incoming Flow and returns the transfers
    /// (and possibly a drain echo) it unblocks.
    pub(crate) fn on_incoming_flow(
        &mut self,
        flow: &Flow,
        tx: &mut SessionTxState,
        channel: u16,
        max_frame_size: usize,
    ) -> Vec<Frame> {
        if let Some(link_credit) = flow.link_credit {
            let remote_count = flow.delivery_count.unwrap_or(0);
            // credit = remote view of delivery-count, plus its grant, minus
            // what this side has already used
            self.credit = remote_count
                .wrapping_add(link_credit)
                .wrapping_sub(self.delivery_count);
        }
        self.drain = flow.drain;

        let mut frames = self.flush_pending(tx, channel, max_frame_size);

        if self.drain && self.credit > 0 && self.pending.is_empty() {
            // Nothing left to deliver: consume the credit by advancing
            // delivery-count and echo the drain flow
            self.delivery_count = self.delivery_count.wrapping_add(self.credit);
            self.credit = 0;
            self.drain = false;
            frames.push(Frame::new(channel, FrameBody::Flow(self.drain_echo(tx))));
        }

        frames
    }

    fn drain_echo(&self, tx: &SessionTxState) -> Flow {
        Flow {
            next_incoming_id: Some(tx.next_incoming_id),
            incoming_window: tx.incoming_window,
            next_outgoing_id: tx.next_outgoing_id,
            outgoing_window: tx.outgoing_window,
            handle: Some(self.core.output_handle.into()),
            delivery_count: Some(self.delivery_count),
            link_credit: Some(0),
            available: Some(self.pending.len() as u32),
            drain: true,
            echo: false,
            properties: None,
        }
    }

    /// Accepts a send request: transfers immediately when credit and session
    /// window allow, queues otherwise (unless `try_only`).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send(
        &mut self,
        payload: Payload,
        message_format: MessageFormat,
        settled: Option<bool>,
        try_only: bool,
        tx: &mut SessionTxState,
        channel: u16,
        max_frame_size: usize,
        responder: Responder<Settlement>,
    ) -> Vec<Frame> {
        if let Some(cause) = &self.core.failure {
            let _ = responder.send(Err(cause.clone()));
            return Vec::new();
        }
        if let Some(limit) = self.core.remote_max_message_size() {
            if payload.len() as u64 > limit {
                let _ = responder.send(Err(Error::illegal_state(format!(
                    "message of {} bytes exceeds the remote max-message-size {}",
                    payload.len(),
                    limit
                ))));
                return Vec::new();
            }
        }

        let frames_needed = chunk_count(payload.len(), max_frame_size);
        if self.credit == 0 || tx.remote_incoming_window < frames_needed {
            if try_only {
                let _ = responder.send(Err(Error::illegal_state(
                    "send would block: no link credit available",
                )));
            } else {
                self.pending.push_back(PendingSend {
                    payload,
                    message_format,
                    settled,
                    responder,
                });
            }
            return Vec::new();
        }

        let (frames, settlement) =
            self.transfer_delivery(payload, message_format, settled, tx, channel, max_frame_size);
        let _ = responder.send(Ok(settlement));
        frames
    }

    /// Emits queued sends while credit and session window allow
    pub(crate) fn flush_pending(
        &mut self,
        tx: &mut SessionTxState,
        channel: u16,
        max_frame_size: usize,
    ) -> Vec<Frame> {
        let mut frames = Vec::new();
        while self.credit > 0 {
            let frames_needed = match self.pending.front() {
                Some(pending) => chunk_count(pending.payload.len(), max_frame_size),
                None => break,
            };
            if tx.remote_incoming_window < frames_needed {
                break;
            }
            let pending = match self.pending.pop_front() {
                Some(pending) => pending,
                None => break,
            };
            let (mut emitted, settlement) = self.transfer_delivery(
                pending.payload,
                pending.message_format,
                pending.settled,
                tx,
                channel,
                max_frame_size,
            );
            frames.append(&mut emitted);
            let _ = pending.responder.send(Ok(settlement));
        }
        frames
    }

    /// Builds the transfer frames for one complete delivery and records its
    /// tracker
    fn transfer_delivery(
        &mut self,
        payload: Payload,
        message_format: MessageFormat,
        settled: Option<bool>,
        tx: &mut SessionTxState,
        channel: u16,
        max_frame_size: usize,
    ) -> (Vec<Frame>, Settlement) {
        let settled = self.effective_settled(settled);
        let delivery_id = tx.next_delivery_id();
        let delivery_tag = self.next_tag();

        self.credit = self.credit.saturating_sub(1);
        self.delivery_count = self.delivery_count.wrapping_add(1);

        let frames = build_transfer_frames(
            channel,
            self.core.output_handle,
            delivery_id,
            &delivery_tag,
            message_format,
            settled,
            false,
            payload,
            tx,
            max_frame_size,
        );

        let settlement = self.record_delivery(delivery_id, delivery_tag, settled);
        (frames, settlement)
    }

    fn effective_settled(&self, requested: Option<bool>) -> bool {
        match self.core.snd_settle_mode {
            SenderSettleMode::Settled => true,
            SenderSettleMode::Unsettled => false,
            SenderSettleMode::Mixed => requested.unwrap_or(false),
        }
    }

    /// Creates the tracker cell and, for unsettled deliveries, the map entry
    fn record_delivery(
        &mut self,
        delivery_id: DeliveryNumber,
        delivery_tag: DeliveryTag,
        settled: bool,
    ) -> Settlement {
        let shared = TrackerShared::new(delivery_id, delivery_tag.clone());
        let (outcome_tx, outcome_rx) = oneshot::channel();

        if settled {
            // Fire and forget: the future completes without a Disposition
            shared.lock().locally_settled = true;
            let _ = outcome_tx.send(Ok(None));
        } else {
            self.unsettled.insert(
                delivery_tag.clone(),
                UnsettledDelivery {
                    shared: shared.clone(),
                    outcome: Some(outcome_tx),
                },
            );
            self.tag_by_delivery_id.insert(delivery_id, delivery_tag);
        }

        Settlement {
            shared,
            outcome: outcome_rx,
        }
    }

    /// Emits one part of a streaming delivery
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn stream_part(
        &mut self,
        payload: Payload,
        message_format: MessageFormat,
        more: bool,
        aborted: bool,
        tx: &mut SessionTxState,
        channel: u16,
        max_frame_size: usize,
    ) -> Result<(Vec<Frame>, Option<Settlement>), Error> {
        if let Some(cause) = &self.core.failure {
            return Err(cause.clone());
        }

        if tx.remote_incoming_window == 0 {
            return Err(Error::illegal_state(
                "session window exhausted for streaming part",
            ));
        }

        let mut streaming = match self.streaming.take() {
            Some(streaming) => streaming,
            None => {
                if self.credit == 0 {
                    return Err(Error::illegal_state(
                        "streaming delivery needs link credit to start",
                    ));
                }
                let delivery_id = tx.next_delivery_id();
                let delivery_tag = self.next_tag();
                self.credit = self.credit.saturating_sub(1);
                self.delivery_count = self.delivery_count.wrapping_add(1);
                let settlement = self.record_delivery(delivery_id, delivery_tag.clone(), false);
                StreamingState {
                    delivery_id,
                    delivery_tag,
                    first_sent: false,
                    settlement: Some(settlement),
                }
            }
        };

        let first = !streaming.first_sent;
        streaming.first_sent = true;

        let frames = build_streaming_frames(
            channel,
            self.core.output_handle,
            streaming.delivery_id,
            &streaming.delivery_tag,
            message_format,
            first,
            more,
            aborted,
            payload,
            tx,
            max_frame_size,
        );

        if aborted {
            if let Some(entry) = self.unsettled.remove(&streaming.delivery_tag) {
                self.tag_by_delivery_id.remove(&streaming.delivery_id);
                if let Some(outcome) = entry.outcome {
                    let _ = outcome.send(Err(Error::DeliveryAborted));
                }
            }
            return Ok((frames, streaming.settlement.take()));
        }

        if !more {
            return Ok((frames, streaming.settlement.take()));
        }

        self.streaming = Some(streaming);
        Ok((frames, None))
    }

    /// Applies a remote Disposition range to the unsettled map
    pub(crate) fn on_incoming_disposition(
        &mut self,
        first: DeliveryNumber,
        last: DeliveryNumber,
        state: Option<&DeliveryState>,
        remotely_settled: bool,
        channel: u16,
    ) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut id = first;
        loop {
            if let Some(tag) = self.tag_by_delivery_id.get(&id).cloned() {
                if let Some(frame) =
                    self.apply_remote_state(&tag, state.cloned(), remotely_settled, channel)
                {
                    frames.push(frame);
                }
            }
            if id == last {
                break;
            }
            id = id.wrapping_add(1);
        }
        frames
    }

    fn apply_remote_state(
        &mut self,
        tag: &DeliveryTag,
        state: Option<DeliveryState>,
        remotely_settled: bool,
        channel: u16,
    ) -> Option<Frame> {
        let entry = self.unsettled.get_mut(tag)?;

        let terminal = state.as_ref().map(is_terminal).unwrap_or(false);
        {
            let mut cell = entry.shared.lock();
            cell.remote_state = state.clone();
            cell.remotely_settled = remotely_settled;
        }

        let mut settle_frame = None;
        let settle_locally = remotely_settled || (self.auto_settle && terminal);
        if settle_locally {
            let delivery_id = entry.shared.delivery_id;
            entry.shared.lock().locally_settled = true;

            // Under receiver-settle-mode Second the peer waits for this
            // side's settling disposition before discarding its own state
            if !remotely_settled && matches!(self.core.rcv_settle_mode, ReceiverSettleMode::Second)
            {
                settle_frame = Some(Frame::new(
                    channel,
                    FrameBody::Disposition(Disposition {
                        role: Role::Sender,
                        first: delivery_id,
                        last: None,
                        settled: true,
                        state: state.clone(),
                        batchable: false,
                    }),
                ));
            }
        }

        // Completion fires after every cell update above, so an observer of
        // the future also observes the final tracker state
        if remotely_settled
            || terminal
            || matches!(self.core.snd_settle_mode, SenderSettleMode::Settled)
        {
            if let Some(outcome) = entry.outcome.take() {
                let _ = outcome.send(Ok(state));
            }
        }

        if settle_locally {
            let delivery_id = entry.shared.delivery_id;
            self.unsettled.remove(tag);
            self.tag_by_delivery_id.remove(&delivery_id);
        }

        settle_frame
    }

    /// Applies a local disposition requested through a tracker
    pub(crate) fn local_disposition(
        &mut self,
        tag: &DeliveryTag,
        state: Option<DeliveryState>,
        settled: bool,
        channel: u16,
    ) -> Option<Frame> {
        let entry = self.unsettled.get_mut(tag)?;
        let delivery_id = entry.shared.delivery_id;

        {
            let mut cell = entry.shared.lock();
            if let Some(state) = state.clone() {
                cell.local_state = Some(state);
            }
            if settled {
                cell.locally_settled = true;
            }
        }

        let frame = Frame::new(
            channel,
            FrameBody::Disposition(Disposition {
                role: Role::Sender,
                first: delivery_id,
                last: None,
                settled,
                state,
                batchable: false,
            }),
        );

        if settled {
            if let Some(outcome) = entry.outcome.take() {
                let _ = outcome.send(Ok(entry.shared.lock().remote_state.clone()));
            }
            self.unsettled.remove(tag);
            self.tag_by_delivery_id.remove(&delivery_id);
        }

        Some(frame)
    }

    /// Fails every transferred-but-unsettled delivery, keeping queued sends
    /// for re-issue after a reconnect
    pub(crate) fn fail_in_flight(&mut self, cause: &Error) {
        for (_, entry) in self.unsettled.drain() {
            if let Some(outcome) = entry.outcome {
                let _ = outcome.send(Err(cause.clone()));
            }
        }
        self.tag_by_delivery_id.clear();
        self.streaming = None;
    }

    /// Fails everything, queued sends included; used on fatal errors
    pub(crate) fn fail_all(&mut self, cause: &Error) {
        self.fail_in_flight(cause);
        for pending in self.pending.drain(..) {
            let _ = pending.responder.send(Err(cause.clone()));
        }
        if let Some(responder) = self.attach_responder.take() {
            let _ = responder.send(Err(cause.clone()));
        }
        if let Some(responder) = self.core.detach_responder.take() {
            let _ = responder.send(Err(cause.clone()));
        }
    }

    /// Resets protocol state ahead of a re-attach on a fresh transport
    pub(crate) fn reset_for_reattach(&mut self) {
        self.core.state = LinkState::Detached;
        self.core.input_handle = None;
        self.core.remote_attach = None;
        self.delivery_count = 0;
        self.credit = 0;
        self.drain = false;
        self.core.local_attach.initial_delivery_count = Some(0);
    }
}

/// Number of transfer frames a payload of `len` bytes occupies
fn chunk_count(len: usize, max_frame_size: usize) -> u32 {
    let chunk = max_frame_size.saturating_sub(TRANSFER_OVERHEAD).max(1);
    len.div_ceil(chunk).max(1) as u32
}

/// Splits one delivery into transfer frames, all but the last with
/// `more = true`
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_transfer_frames(
    channel: u16,
    handle: u32,
    delivery_id: DeliveryNumber,
    delivery_tag: &DeliveryTag,
    message_format: MessageFormat,
    settled: bool,
    aborted: bool,
    mut payload: Payload,
    tx: &mut SessionTxState,
    max_frame_size: usize,
) -> Vec<Frame> {
    let chunk = max_frame_size.saturating_sub(TRANSFER_OVERHEAD).max(1);
    let mut frames = Vec::with_capacity(chunk_count(payload.len(), max_frame_size) as usize);
    let mut first = true;

    loop {
        let part = payload.split_to(payload.len().min(chunk));
        let last = payload.is_empty();

        let transfer = Transfer {
            handle: handle.into(),
            delivery_id: Some(delivery_id),
            delivery_tag: first.then(|| delivery_tag.clone()),
            message_format: first.then_some(message_format),
            settled: first.then_some(settled),
            more: !last,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted,
            batchable: false,
        };

        tx.consume_outgoing_frame();
        frames.push(Frame::new(
            channel,
            FrameBody::Transfer {
                performative: transfer,
                payload: part,
            },
        ));

        first = false;
        if last {
            break;
        }
    }
    frames
}

/// One frame of a streaming delivery; unlike [`build_transfer_frames`] the
/// payload is never fragmented because each part arrives pre-sized
#[allow(clippy::too_many_arguments)]
fn build_streaming_frames(
    channel: u16,
    handle: u32,
    delivery_id: DeliveryNumber,
    delivery_tag: &DeliveryTag,
    message_format: MessageFormat,
    first: bool,
    more: bool,
    aborted: bool,
    payload: Payload,
    tx: &mut SessionTxState,
    max_frame_size: usize,
) -> Vec<Frame> {
    if !aborted && payload.len() > max_frame_size.saturating_sub(TRANSFER_OVERHEAD) {
        // Oversized parts still fragment
        return build_transfer_frames(
            channel,
            handle,
            delivery_id,
            delivery_tag,
            message_format,
            false,
            false,
            payload,
            tx,
            max_frame_size,
        )
        .into_iter()
        .map(|mut frame| {
            if let FrameBody::Transfer { performative, .. } = &mut frame.body {
                if more {
                    performative.more = true;
                }
            }
            frame
        })
        .collect();
    }

    let transfer = Transfer {
        handle: handle.into(),
        delivery_id: Some(delivery_id),
        delivery_tag: first.then(|| delivery_tag.clone()),
        message_format: first.then_some(message_format),
        settled: first.then_some(false),
        more: more && !aborted,
        rcv_settle_mode: None,
        state: None,
        resume: false,
        aborted,
        batchable: false,
    };

    tx.consume_outgoing_frame();
    vec![Frame::new(
        channel,
        FrameBody::Transfer {
            performative: transfer,
            payload,
        },
    )]
}

fn is_terminal(state: &DeliveryState) -> bool {
    matches!(
        state,
        DeliveryState::Accepted(_)
            | DeliveryState::Rejected(_)
            | DeliveryState::Released(_)
            | DeliveryState::Modified(_)
    )
}

pub(crate) fn attach_refused(attach: &Attach) -> bool {
    attach.target.is_none()
}
