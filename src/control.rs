//! Work items enqueued by user handles onto the connection event loop
//!
//! Every user-facing call becomes one of these: the handle builds a oneshot
//! responder, sends the item, and awaits the responder under its timeout.
//! All fields the engine needs are captured by value so the engine never
//! reaches back into user-held state.

use fe2o3_amqp_types::definitions::{self, DeliveryNumber, DeliveryTag, MessageFormat};
use fe2o3_amqp_types::messaging::DeliveryState;
use fe2o3_amqp_types::performatives::{Attach, Open};
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::link::delivery::{Delivery, Settlement};
use crate::options::{ReceiverOptions, SenderOptions, SessionOptions};
use crate::Payload;

pub(crate) type Responder<T> = oneshot::Sender<Result<T, Error>>;

/// Result of a completed open sequence
#[derive(Debug)]
pub(crate) struct OpenedInfo {
    pub remote_open: Box<Open>,
}

/// Result of a completed Begin exchange
#[derive(Debug)]
pub(crate) struct BegunSession {
    pub channel: u16,
    pub session_id: String,
}

/// Result of a completed Attach exchange
#[derive(Debug)]
pub(crate) struct AttachedLink {
    pub handle: u32,
    pub link_id: String,
    /// The peer's Attach, kept whole: terminus info (including dynamic
    /// addresses) and max-message-size are read out of it
    pub remote_attach: Box<Attach>,
}

/// Attach result plus the delivery queue, for receivers
pub(crate) struct AttachedReceiver {
    pub link: AttachedLink,
    pub deliveries: mpsc::UnboundedReceiver<Result<Delivery, Error>>,
}

impl std::fmt::Debug for AttachedReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedReceiver")
            .field("link", &self.link)
            .finish()
    }
}

/// One unit of work for the event loop
pub(crate) enum WorkItem {
    /// Await the Open exchange; resolves once the connection is usable
    Open { responder: Responder<OpenedInfo> },

    /// Close the connection, optionally with an error condition
    Close {
        error: Option<definitions::Error>,
        responder: Responder<()>,
    },

    /// Begin a new session
    BeginSession {
        options: SessionOptions,
        responder: Responder<BegunSession>,
    },

    /// End a session
    EndSession {
        channel: u16,
        error: Option<definitions::Error>,
        responder: Responder<()>,
    },

    /// Attach a sender link. `address: None` requests the anonymous relay.
    AttachSender {
        channel: u16,
        name: String,
        address: Option<String>,
        options: SenderOptions,
        responder: Responder<AttachedLink>,
    },

    /// Attach a receiver link. `address: None` requires a dynamic source.
    AttachReceiver {
        channel: u16,
        name: String,
        address: Option<String>,
        options: ReceiverOptions,
        responder: Responder<AttachedReceiver>,
    },

    /// Detach or close a link
    DetachLink {
        channel: u16,
        handle: u32,
        closed: bool,
        error: Option<definitions::Error>,
        responder: Responder<()>,
    },

    /// Send one complete, pre-encoded message
    Send {
        channel: u16,
        handle: u32,
        payload: Payload,
        message_format: MessageFormat,
        settled: Option<bool>,
        /// Fail immediately instead of queuing when credit is unavailable
        try_only: bool,
        responder: Responder<Settlement>,
    },

    /// Emit one part of a streaming delivery.
    ///
    /// The first part allocates the delivery id and tag; the part with
    /// `more == false` or `aborted == true` finishes the delivery and
    /// resolves with its settlement.
    StreamPart {
        channel: u16,
        handle: u32,
        payload: Payload,
        message_format: MessageFormat,
        more: bool,
        aborted: bool,
        responder: Responder<Option<Settlement>>,
    },

    /// Grant credit on a receiver link
    AddCredit {
        channel: u16,
        handle: u32,
        credit: u32,
        responder: Responder<()>,
    },

    /// Start a drain cycle; resolves when the drain completes
    Drain {
        channel: u16,
        handle: u32,
        responder: Responder<()>,
    },

    /// Report messages taken by the application, for credit-window top-up
    Consumed {
        channel: u16,
        handle: u32,
        count: u32,
    },

    /// Emit a Disposition for an incoming delivery
    Disposition {
        channel: u16,
        handle: u32,
        delivery_id: DeliveryNumber,
        state: DeliveryState,
        settled: bool,
        responder: Responder<()>,
    },

    /// Apply local state and/or settle an outgoing delivery
    TrackerDisposition {
        channel: u16,
        handle: u32,
        delivery_tag: DeliveryTag,
        state: Option<DeliveryState>,
        settled: bool,
        responder: Responder<()>,
    },
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkItem::Open { .. } => "Open",
            WorkItem::Close { .. } => "Close",
            WorkItem::BeginSession { .. } => "BeginSession",
            WorkItem::EndSession { .. } => "EndSession",
            WorkItem::AttachSender { .. } => "AttachSender",
            WorkItem::AttachReceiver { .. } => "AttachReceiver",
            WorkItem::DetachLink { .. } => "DetachLink",
            WorkItem::Send { .. } => "Send",
            WorkItem::StreamPart { .. } => "StreamPart",
            WorkItem::AddCredit { .. } => "AddCredit",
            WorkItem::Drain { .. } => "Drain",
            WorkItem::Consumed { .. } => "Consumed",
            WorkItem::Disposition { .. } => "Disposition",
            WorkItem::TrackerDisposition { .. } => "TrackerDisposition",
        };
        f.write_str(name)
    }
}
