//! Links: user-facing handles and engine-side state machines
//!
//! `sender`/`receiver` hold the handles users interact with; `sender_link`
//! and `receiver_link` hold the per-link protocol state owned by the event
//! loop. The two sides only meet through work items and shared tracker
//! cells.

pub(crate) mod delivery;
pub(crate) mod receiver_link;
pub(crate) mod sender_link;

pub mod receiver;
pub mod sender;

pub use delivery::{Delivery, Sendable, SettlementFut, Tracker};
pub use receiver::Receiver;
pub use sender::{Sender, StreamingDelivery};

use fe2o3_amqp_types::definitions::{ReceiverSettleMode, SenderSettleMode};
use fe2o3_amqp_types::messaging::{Source, Target};
use fe2o3_amqp_types::performatives::Attach;
use fe2o3_amqp_types::primitives::Symbol;

use crate::options::{SourceOptions, TargetOptions};

/// Local endpoint state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    /// Initial state, also the state entered after a full detach
    Detached,
    /// Attach sent, waiting for the peer's
    AttachSent,
    /// Both attaches exchanged
    Attached,
    /// Detach sent, waiting for the peer's
    DetachSent,
}

/// Fields common to both link roles, owned by the event loop
#[derive(Debug)]
pub(crate) struct LinkCore {
    pub name: String,
    pub link_id: String,
    pub state: LinkState,
    pub output_handle: u32,
    pub input_handle: Option<u32>,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    /// Attach performative replayed verbatim on reconnect
    pub local_attach: Box<Attach>,
    pub remote_attach: Option<Box<Attach>>,
    /// Failure recorded for this link; later operations fail fast with it
    pub failure: Option<crate::error::Error>,
    pub detach_responder: Option<crate::control::Responder<()>>,
}

impl LinkCore {
    pub(crate) fn new(name: String, link_id: String, output_handle: u32, attach: Attach) -> Self {
        Self {
            name,
            link_id,
            state: LinkState::Detached,
            output_handle,
            snd_settle_mode: attach.snd_settle_mode.clone(),
            rcv_settle_mode: attach.rcv_settle_mode.clone(),
            input_handle: None,
            local_attach: Box::new(attach),
            remote_attach: None,
            failure: None,
            detach_responder: None,
        }
    }

    /// Attach frame body for the initial attach or a re-attach
    pub(crate) fn attach_performative(&self) -> Attach {
        let mut attach = (*self.local_attach).clone();
        attach.handle = self.output_handle.into();
        attach
    }

    pub(crate) fn remote_max_message_size(&self) -> Option<u64> {
        self.remote_attach
            .as_ref()
            .and_then(|attach| attach.max_message_size)
            .filter(|size| *size > 0)
    }
}

pub(crate) fn make_source(address: Option<String>, options: &SourceOptions) -> Source {
    let mut builder = Source::builder()
        .durable(options.durability.clone())
        .expiry_policy(options.expiry_policy.clone())
        .dynamic(options.dynamic);
    if let Some(address) = address {
        builder = builder.address(address);
    }
    if !options.capabilities.is_empty() {
        builder = builder.capabilities(options.capabilities.clone());
    }
    builder.build()
}

pub(crate) fn make_target(address: Option<String>, options: &TargetOptions) -> Target {
    let mut builder = Target::builder()
        .durable(options.durability.clone())
        .expiry_policy(options.expiry_policy.clone())
        .dynamic(options.dynamic);
    if let Some(address) = address {
        builder = builder.address(address);
    }
    if !options.capabilities.is_empty() {
        builder = builder.capabilities(options.capabilities.clone());
    }
    builder.build()
}

/// `None` when empty, so optional capability lists stay absent on the wire
pub(crate) fn capabilities_field(capabilities: &[Symbol]) -> Option<Vec<Symbol>> {
    match capabilities.is_empty() {
        true => None,
        false => Some(capabilities.to_vec()),
    }
}
