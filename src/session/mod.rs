//! Session state: channels, windows, link tables, frame routing
//!
//! One [`SessionInner`] lives inside the connection event loop per open
//! session. It owns the two session windows, the delivery-id sequences and
//! the link table, and turns incoming performatives plus user work items
//! into outgoing frames.

pub(crate) mod handle;

pub use handle::Session;

use std::collections::{HashMap, HashSet};

use fe2o3_amqp_types::definitions::{self, AmqpError, DeliveryNumber, Role, SessionError};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Detach, Disposition, End, Flow, Transfer,
};
use slab::Slab;
use tracing::{debug, trace};

use crate::control::{AttachedLink, BegunSession, Responder};
use crate::error::Error;
use crate::frames::{Frame, FrameBody};
use crate::link::receiver_link::{self, ReceiverLink};
use crate::link::sender_link::{self, SenderLink};
use crate::link::{LinkCore, LinkState};
use crate::options::SessionOptions;
use crate::Payload;

/// 2.5.5 session states, reduced to the ones a client endpoint visits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Unmapped,
    BeginSent,
    Mapped,
    EndSent,
    /// End sent carrying an error; incoming frames are dropped until the
    /// peer's End arrives
    Discarding,
}

/// Transfer-number and window bookkeeping, split out so link code can
/// debit it without borrowing the whole session
#[derive(Debug)]
pub(crate) struct SessionTxState {
    pub next_incoming_id: u32,
    pub incoming_window: u32,
    pub initial_incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub remote_incoming_window: u32,
    pub remote_outgoing_window: u32,
    next_outgoing_delivery_id: u32,
}

impl SessionTxState {
    fn new(options: &SessionOptions) -> Self {
        Self {
            next_incoming_id: 0,
            incoming_window: options.incoming_window,
            initial_incoming_window: options.incoming_window,
            next_outgoing_id: 0,
            outgoing_window: options.outgoing_window,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            next_outgoing_delivery_id: 0,
        }
    }

    /// Allocates the delivery-id for a new outgoing delivery
    pub(crate) fn next_delivery_id(&mut self) -> DeliveryNumber {
        let id = self.next_outgoing_delivery_id;
        self.next_outgoing_delivery_id = id.wrapping_add(1);
        id
    }

    /// Accounts for one outgoing transfer frame
    pub(crate) fn consume_outgoing_frame(&mut self) {
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        self.remote_incoming_window = self.remote_incoming_window.saturating_sub(1);
    }
}

pub(crate) enum LinkEndpoint {
    Sender(SenderLink),
    Receiver(ReceiverLink),
}

impl LinkEndpoint {
    fn core(&self) -> &LinkCore {
        match self {
            LinkEndpoint::Sender(link) => &link.core,
            LinkEndpoint::Receiver(link) => &link.core,
        }
    }

    fn core_mut(&mut self) -> &mut LinkCore {
        match self {
            LinkEndpoint::Sender(link) => &mut link.core,
            LinkEndpoint::Receiver(link) => &mut link.core,
        }
    }
}

pub(crate) struct SessionInner {
    pub id: String,
    pub state: SessionState,
    pub outgoing_channel: u16,
    pub incoming_channel: Option<u16>,
    pub tx: SessionTxState,
    options: SessionOptions,
    max_frame_size: usize,

    /// Expected delivery-id of the next new incoming delivery
    next_incoming_delivery_id: Option<DeliveryNumber>,

    links: Slab<LinkEndpoint>,
    link_by_name: HashMap<String, usize>,
    link_by_input_handle: HashMap<u32, usize>,
    /// Names detached with `closed = true`; they may not re-attach here
    closed_link_names: HashSet<String>,
    link_seq: u64,

    pub begin_responder: Option<Responder<BegunSession>>,
    pub end_responder: Option<Responder<()>>,
}

impl SessionInner {
    pub(crate) fn new(
        id: String,
        outgoing_channel: u16,
        options: SessionOptions,
        max_frame_size: usize,
    ) -> Self {
        Self {
            id,
            state: SessionState::Unmapped,
            outgoing_channel,
            incoming_channel: None,
            tx: SessionTxState::new(&options),
            options,
            max_frame_size,
            next_incoming_delivery_id: None,
            links: Slab::new(),
            link_by_name: HashMap::new(),
            link_by_input_handle: HashMap::new(),
            closed_link_names: HashSet::new(),
            link_seq: 0,
            begin_responder: None,
            end_responder: None,
        }
    }

    pub(crate) fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /* ------------------------------ begin / end ----------------------------- */

    pub(crate) fn begin_frame(&mut self) -> Frame {
        self.state = SessionState::BeginSent;
        let begin = Begin {
            remote_channel: self.incoming_channel,
            next_outgoing_id: self.tx.next_outgoing_id,
            incoming_window: self.tx.incoming_window,
            outgoing_window: self.tx.outgoing_window,
            handle_max: self.options.handle_max.into(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: self.options.properties.clone().map(Into::into),
        };
        Frame::new(self.outgoing_channel, FrameBody::Begin(begin))
    }

    pub(crate) fn on_incoming_begin(&mut self, channel: u16, begin: &Begin) -> Result<(), Error> {
        match self.state {
            SessionState::BeginSent => self.state = SessionState::Mapped,
            _ => {
                return Err(Error::protocol(
                    AmqpError::IllegalState,
                    "Begin arrived outside of the begin handshake",
                ))
            }
        }
        self.incoming_channel = Some(channel);
        self.tx.next_incoming_id = begin.next_outgoing_id;
        self.tx.remote_incoming_window = begin.incoming_window;
        self.tx.remote_outgoing_window = begin.outgoing_window;

        if let Some(responder) = self.begin_responder.take() {
            let _ = responder.send(Ok(BegunSession {
                channel: self.outgoing_channel,
                session_id: self.id.clone(),
            }));
        }
        debug!(session = %self.id, channel = self.outgoing_channel, "session mapped");
        Ok(())
    }

    pub(crate) fn end_frame(&mut self, error: Option<definitions::Error>) -> Frame {
        self.state = match error {
            Some(_) => SessionState::Discarding,
            None => SessionState::EndSent,
        };
        Frame::new(self.outgoing_channel, FrameBody::End(End { error }))
    }

    /// Returns the frames to write in response (an echoed End when the
    /// remote initiated the end)
    pub(crate) fn on_incoming_end(&mut self, end: End) -> Vec<Frame> {
        let mut frames = Vec::new();
        let cause = Error::ResourceClosed {
            message: format!("session {} ended by remote peer", self.id),
            error: end.error,
        };

        match self.state {
            SessionState::Mapped => {
                // Remote initiated: echo the End and unmap
                frames.push(Frame::new(
                    self.outgoing_channel,
                    FrameBody::End(End { error: None }),
                ));
            }
            SessionState::EndSent | SessionState::Discarding => {}
            _ => {}
        }
        self.state = SessionState::Unmapped;

        if let Some(responder) = self.end_responder.take() {
            let _ = responder.send(Ok(()));
        }
        self.fail_links(&cause);
        frames
    }

    /* -------------------------------- attach -------------------------------- */

    /// Inserts a freshly built link endpoint and returns its Attach frame
    pub(crate) fn attach_link(&mut self, mut endpoint: LinkEndpoint) -> Vec<Frame> {
        let entry = self.links.vacant_entry();
        let handle = entry.key() as u32;
        {
            let core = endpoint.core_mut();
            core.output_handle = handle;
            core.local_attach.handle = handle.into();
            core.state = LinkState::AttachSent;
        }

        let frame = Frame::new(
            self.outgoing_channel,
            FrameBody::Attach(Box::new(endpoint.core().attach_performative())),
        );
        self.link_by_name
            .insert(endpoint.core().name.clone(), entry.key());
        entry.insert(endpoint);
        vec![frame]
    }

    /// Shared admission checks for a new link name
    pub(crate) fn check_attach(&self, name: &str) -> Result<(), Error> {
        if self.state != SessionState::Mapped {
            return Err(Error::illegal_state(format!(
                "session {} is not mapped",
                self.id
            )));
        }
        if self.link_by_name.contains_key(name) {
            return Err(Error::illegal_state(format!(
                "link name {:?} already attached in this session",
                name
            )));
        }
        if self.closed_link_names.contains(name) {
            return Err(Error::illegal_state(format!(
                "link name {:?} was closed in this session and may not re-attach",
                name
            )));
        }
        if self.links.len() as u32 >= self.options.handle_max.saturating_add(1) {
            return Err(Error::illegal_state("session handle-max exceeded"));
        }
        Ok(())
    }

    /// Allocates the identifier for the next link in this session
    pub(crate) fn allocate_link_id(&mut self) -> String {
        let id = crate::util::child_id(&self.id, self.link_seq);
        self.link_seq += 1;
        id
    }

    pub(crate) fn on_incoming_attach(&mut self, attach: Box<Attach>) -> Result<Vec<Frame>, Error> {
        let index = *self.link_by_name.get(&attach.name).ok_or_else(|| {
            Error::protocol(
                SessionError::UnattachedHandle,
                format!("Attach for unknown link name {:?}", attach.name),
            )
        })?;
        let input_handle = u32::from(attach.handle.clone());
        self.link_by_input_handle.insert(input_handle, index);

        let mut frames = Vec::new();
        let channel = self.outgoing_channel;
        if let Some(endpoint) = self.links.get_mut(index) {
            let core = endpoint.core_mut();
            core.input_handle = Some(input_handle);
            core.state = match core.state {
                LinkState::AttachSent => LinkState::Attached,
                other => other,
            };

            match endpoint {
                LinkEndpoint::Sender(link) => {
                    if sender_link::attach_refused(&attach) {
                        // The peer echoed a null target; its closing Detach
                        // carries the reason and completes the attach
                        link.attach_refused = true;
                        link.core.remote_attach = Some(attach);
                    } else {
                        let info = attached_link_info(&link.core, &attach);
                        link.core.remote_attach = Some(attach);
                        if let Some(responder) = link.attach_responder.take() {
                            let _ = responder.send(Ok(info));
                        }
                    }
                }
                LinkEndpoint::Receiver(link) => {
                    if receiver_link::attach_refused(&attach) {
                        link.attach_refused = true;
                        link.core.remote_attach = Some(attach);
                    } else {
                        link.set_initial_delivery_count(
                            attach.initial_delivery_count.unwrap_or(0),
                        );
                        let info = attached_link_info(&link.core, &attach);
                        link.core.remote_attach = Some(attach);
                        link.complete_attach(info);
                        if let Some(flow) = link.reissue_credit(&self.tx, channel) {
                            frames.push(flow);
                        }
                    }
                }
            }
        }
        Ok(frames)
    }

    /* --------------------------------- flow --------------------------------- */

    pub(crate) fn on_incoming_flow(&mut self, flow: Flow) -> Result<Vec<Frame>, Error> {
        // Session-level window update first
        self.tx.remote_outgoing_window = flow.outgoing_window;
        self.tx.remote_incoming_window = match flow.next_incoming_id {
            Some(next_incoming_id) => next_incoming_id
                .wrapping_add(flow.incoming_window)
                .wrapping_sub(self.tx.next_outgoing_id),
            None => flow.incoming_window,
        };

        let mut frames = Vec::new();
        let channel = self.outgoing_channel;

        match flow.handle.clone() {
            Some(handle) => {
                let index = self.link_index_for_input_handle(u32::from(handle))?;
                match self.links.get_mut(index) {
                    Some(LinkEndpoint::Sender(link)) => {
                        frames.extend(link.on_incoming_flow(
                            &flow,
                            &mut self.tx,
                            channel,
                            self.max_frame_size,
                        ));
                    }
                    Some(LinkEndpoint::Receiver(link)) => link.on_incoming_flow(&flow),
                    None => {}
                }
            }
            None => {
                // Window may have opened: give every sender a chance to move
                // its queue
                frames.extend(self.flush_senders());
            }
        }
        Ok(frames)
    }

    /// Flushes pending sends on every sender link
    pub(crate) fn flush_senders(&mut self) -> Vec<Frame> {
        let channel = self.outgoing_channel;
        let max_frame_size = self.max_frame_size;
        let mut frames = Vec::new();
        for (_, endpoint) in self.links.iter_mut() {
            if let LinkEndpoint::Sender(link) = endpoint {
                frames.extend(link.flush_pending(&mut self.tx, channel, max_frame_size));
            }
        }
        frames
    }

    /* ------------------------------- transfer -------------------------------- */

    pub(crate) fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Payload,
    ) -> Result<Vec<Frame>, Error> {
        // Per-frame session accounting
        self.tx.next_incoming_id = self.tx.next_incoming_id.wrapping_add(1);
        self.tx.incoming_window = self.tx.incoming_window.saturating_sub(1);

        let index = self.link_index_for_input_handle(u32::from(transfer.handle.clone()))?;

        // New deliveries must arrive in delivery-id order
        let opens_new_delivery = match self.links.get(index) {
            Some(LinkEndpoint::Receiver(link)) => !link.reassembly_in_progress(),
            _ => false,
        };
        if opens_new_delivery {
            if let (Some(id), Some(expected)) =
                (transfer.delivery_id, self.next_incoming_delivery_id)
            {
                if id != expected {
                    return Err(Error::protocol(
                        AmqpError::NotAllowed,
                        format!(
                            "transfer delivery-id {} does not match expected {}",
                            id, expected
                        ),
                    ));
                }
            }
            if let Some(id) = transfer.delivery_id {
                self.next_incoming_delivery_id = Some(id.wrapping_add(1));
            }
        }

        let channel = self.outgoing_channel;
        let mut frames = Vec::new();

        let link_result = match self.links.get_mut(index) {
            Some(LinkEndpoint::Receiver(link)) => {
                link.on_incoming_transfer(transfer, payload, &self.tx, channel)
            }
            Some(LinkEndpoint::Sender(_)) => {
                return Err(Error::protocol(
                    SessionError::ErrantLink,
                    "Transfer addressed to a sender link",
                ));
            }
            None => Ok(None),
        };
        match link_result {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => {}
            Err(err) if is_link_condition(&err) => {
                // A link-level violation detaches the link, not the session
                frames.extend(self.detach_with_protocol_error(index, err));
                return Ok(frames);
            }
            Err(err) => return Err(err),
        }

        // Replenish the session incoming window once half of it is used
        if self.tx.incoming_window < self.tx.initial_incoming_window / 2 {
            self.tx.incoming_window = self.tx.initial_incoming_window;
            frames.push(self.session_flow());
            trace!(session = %self.id, "incoming window replenished");
        }

        Ok(frames)
    }

    fn session_flow(&self) -> Frame {
        Frame::new(
            self.outgoing_channel,
            FrameBody::Flow(Flow {
                next_incoming_id: Some(self.tx.next_incoming_id),
                incoming_window: self.tx.incoming_window,
                next_outgoing_id: self.tx.next_outgoing_id,
                outgoing_window: self.tx.outgoing_window,
                handle: None,
                delivery_count: None,
                link_credit: None,
                available: None,
                drain: false,
                echo: false,
                properties: None,
            }),
        )
    }

    /* ------------------------------ disposition ------------------------------ */

    pub(crate) fn on_incoming_disposition(&mut self, disposition: Disposition) -> Vec<Frame> {
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        let channel = self.outgoing_channel;
        let mut frames = Vec::new();

        match disposition.role {
            // The peer speaks as receiver: it settles our outgoing
            // deliveries
            Role::Receiver => {
                for (_, endpoint) in self.links.iter_mut() {
                    if let LinkEndpoint::Sender(link) = endpoint {
                        frames.extend(link.on_incoming_disposition(
                            first,
                            last,
                            disposition.state.as_ref(),
                            disposition.settled,
                            channel,
                        ));
                    }
                }
            }
            // The peer speaks as sender: second-settle-mode acknowledgements
            Role::Sender => {
                for (_, endpoint) in self.links.iter_mut() {
                    if let LinkEndpoint::Receiver(link) = endpoint {
                        link.on_incoming_disposition(first, last, disposition.settled);
                    }
                }
            }
        }
        frames
    }

    /* -------------------------------- detach --------------------------------- */

    pub(crate) fn on_incoming_detach(&mut self, detach: Detach) -> Vec<Frame> {
        let input_handle = u32::from(detach.handle.clone());
        let index = match self.link_by_input_handle.get(&input_handle) {
            Some(index) => *index,
            // Detach for a link already gone: dropped silently
            None => return Vec::new(),
        };

        let mut frames = Vec::new();
        let channel = self.outgoing_channel;

        let endpoint = match self.links.get_mut(index) {
            Some(endpoint) => endpoint,
            None => return Vec::new(),
        };

        let name = endpoint.core().name.clone();
        let was_detach_sent = endpoint.core().state == LinkState::DetachSent;
        let cause = Error::ResourceClosed {
            message: format!("link {:?} detached by remote peer", name),
            error: detach.error.clone(),
        };

        if !was_detach_sent {
            // Remote initiated: echo the detach
            frames.push(Frame::new(
                channel,
                FrameBody::Detach(Detach {
                    handle: endpoint.core().output_handle.into(),
                    closed: detach.closed,
                    error: None,
                }),
            ));
        }

        endpoint.core_mut().state = LinkState::Detached;
        // The local detach waiter, if any, completes successfully; only the
        // link's other users see the closure cause
        let local_detach = endpoint.core_mut().detach_responder.take();
        match endpoint {
            LinkEndpoint::Sender(link) => link.fail_all(&cause),
            LinkEndpoint::Receiver(link) => link.fail_all(&cause),
        }
        if let Some(responder) = local_detach {
            let _ = responder.send(Ok(()));
        }

        if detach.closed {
            self.closed_link_names.insert(name.clone());
        }
        self.remove_link(index, &name, input_handle);
        frames
    }

    pub(crate) fn detach_link(
        &mut self,
        handle: u32,
        closed: bool,
        error: Option<definitions::Error>,
        responder: Responder<()>,
    ) -> Vec<Frame> {
        let index = handle as usize;
        let endpoint = match self.links.get_mut(index) {
            Some(endpoint) => endpoint,
            None => {
                // Already gone: detach is idempotent
                let _ = responder.send(Ok(()));
                return Vec::new();
            }
        };

        match endpoint.core().state {
            LinkState::Attached | LinkState::AttachSent => {
                endpoint.core_mut().state = LinkState::DetachSent;
                endpoint.core_mut().detach_responder = Some(responder);
                vec![Frame::new(
                    self.outgoing_channel,
                    FrameBody::Detach(Detach {
                        handle: handle.into(),
                        closed,
                        error,
                    }),
                )]
            }
            LinkState::DetachSent => {
                // A close is already on the wire; share its completion
                let _ = responder.send(Ok(()));
                Vec::new()
            }
            LinkState::Detached => {
                let _ = responder.send(Ok(()));
                Vec::new()
            }
        }
    }

    fn detach_with_protocol_error(&mut self, index: usize, err: Error) -> Vec<Frame> {
        let channel = self.outgoing_channel;
        let mut frames = Vec::new();
        if let Some(endpoint) = self.links.get_mut(index) {
            let condition = match &err {
                Error::Protocol { condition, .. } => condition.clone(),
                _ => AmqpError::InternalError.into(),
            };
            let handle = endpoint.core().output_handle;
            let name = endpoint.core().name.clone();
            endpoint.core_mut().state = LinkState::DetachSent;
            endpoint.core_mut().failure = Some(err.clone());
            match endpoint {
                LinkEndpoint::Sender(link) => link.fail_all(&err),
                LinkEndpoint::Receiver(link) => link.fail_all(&err),
            }
            debug!(link = %name, "detaching link after protocol violation");
            frames.push(Frame::new(
                channel,
                FrameBody::Detach(Detach {
                    handle: handle.into(),
                    closed: true,
                    error: Some(definitions::Error::new(condition, Some(err.to_string()), None)),
                }),
            ));
        }
        frames
    }

    /* ----------------------------- link work items ---------------------------- */

    /// Splits borrows so link methods can debit the session window
    pub(crate) fn sender_context(
        &mut self,
        handle: u32,
    ) -> Result<(&mut SenderLink, &mut SessionTxState, u16, usize), Error> {
        let channel = self.outgoing_channel;
        let max_frame_size = self.max_frame_size;
        match self.links.get_mut(handle as usize) {
            Some(LinkEndpoint::Sender(link)) => Ok((link, &mut self.tx, channel, max_frame_size)),
            _ => Err(Error::resource_closed("sender link is closed")),
        }
    }

    pub(crate) fn receiver_context(
        &mut self,
        handle: u32,
    ) -> Result<(&mut ReceiverLink, &SessionTxState, u16), Error> {
        let channel = self.outgoing_channel;
        match self.links.get_mut(handle as usize) {
            Some(LinkEndpoint::Receiver(link)) => Ok((link, &self.tx, channel)),
            _ => Err(Error::resource_closed("receiver link is closed")),
        }
    }

    /* ------------------------- failure and reconnect ------------------------- */

    /// Fails every link and responder with the recorded cause
    pub(crate) fn fail_all(&mut self, cause: &Error) {
        if let Some(responder) = self.begin_responder.take() {
            let _ = responder.send(Err(cause.clone()));
        }
        if let Some(responder) = self.end_responder.take() {
            let _ = responder.send(Err(cause.clone()));
        }
        self.fail_links(cause);
        self.state = SessionState::Unmapped;
    }

    fn fail_links(&mut self, cause: &Error) {
        for (_, endpoint) in self.links.iter_mut() {
            match endpoint {
                LinkEndpoint::Sender(link) => link.fail_all(cause),
                LinkEndpoint::Receiver(link) => link.fail_all(cause),
            }
        }
    }

    /// Resets protocol state for replay on a fresh transport.
    ///
    /// In-flight deliveries fail with `cause`; queued sends and already
    /// delivered messages survive.
    pub(crate) fn reset_for_replay(&mut self, cause: &Error) {
        // An end that was in flight when the transport died is as ended as
        // it will ever be
        if matches!(self.state, SessionState::EndSent | SessionState::Discarding) {
            if let Some(responder) = self.end_responder.take() {
                let _ = responder.send(Ok(()));
            }
        }
        self.state = SessionState::Unmapped;
        self.incoming_channel = None;
        self.tx = SessionTxState::new(&self.options);
        self.next_incoming_delivery_id = None;
        self.link_by_input_handle.clear();

        for (_, endpoint) in self.links.iter_mut() {
            match endpoint {
                LinkEndpoint::Sender(link) => {
                    link.fail_in_flight(cause);
                    link.reset_for_reattach();
                }
                LinkEndpoint::Receiver(link) => {
                    link.reset_for_reattach(cause);
                }
            }
        }
    }

    /// Re-attach frames for every surviving link, sent once the replayed
    /// Begin has been answered
    pub(crate) fn replay_attaches(&mut self) -> Vec<Frame> {
        let channel = self.outgoing_channel;
        let mut frames = Vec::new();
        for (_, endpoint) in self.links.iter_mut() {
            let core = endpoint.core_mut();
            core.state = LinkState::AttachSent;
            frames.push(Frame::new(
                channel,
                FrameBody::Attach(Box::new(core.attach_performative())),
            ));
        }
        frames
    }

    /* -------------------------------- helpers -------------------------------- */

    fn link_index_for_input_handle(&self, input_handle: u32) -> Result<usize, Error> {
        self.link_by_input_handle
            .get(&input_handle)
            .copied()
            .ok_or_else(|| {
                Error::protocol(
                    SessionError::UnattachedHandle,
                    format!("frame for unknown link handle {}", input_handle),
                )
            })
    }

    fn remove_link(&mut self, index: usize, name: &str, input_handle: u32) {
        self.link_by_name.remove(name);
        self.link_by_input_handle.remove(&input_handle);
        if self.links.contains(index) {
            self.links.remove(index);
        }
    }
}

/// Whether the error names a link-scoped condition
fn is_link_condition(err: &Error) -> bool {
    matches!(
        err,
        Error::Protocol {
            condition: fe2o3_amqp_types::definitions::ErrorCondition::LinkError(_),
            ..
        }
    )
}

pub(crate) fn attached_link_info(core: &LinkCore, remote_attach: &Attach) -> AttachedLink {
    AttachedLink {
        handle: core.output_handle,
        link_id: core.link_id.clone(),
        remote_attach: Box::new(remote_attach.clone()),
    }
}
