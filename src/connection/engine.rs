//! The connection event loop
//!
//! One engine task per connection owns the transport, the connection state
//! machine, every session and link, and all timers. User handles reach it
//! only through the work-item channel; nothing here ever blocks outside the
//! `select!`.

use std::collections::HashMap;

use fe2o3_amqp_types::definitions::{self, AmqpError};
use fe2o3_amqp_types::performatives::{Begin, Close, End, Open};
use futures_util::StreamExt;
use slab::Slab;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::control::{OpenedInfo, Responder, WorkItem};
use crate::error::Error;
use crate::frames::{Frame, FrameBody};
use crate::link::receiver_link::ReceiverLink;
use crate::link::sender_link::SenderLink;
use crate::link::{capabilities_field, make_source, make_target, LinkCore};
use crate::options::{ConnectionOptions, ReceiverOptions, SenderOptions};
use crate::sasl_profile::SaslProfile;
use crate::session::{LinkEndpoint, SessionInner, SessionState};
use crate::transport::{protocol_header::ProtocolHeader, IoStream, Transport};
use crate::util::Running;

use super::heartbeat::HeartBeat;
use super::reconnect::ReconnectState;
use super::ConnectionEvent;

/// Capability a peer must offer before senders may attach with a null
/// target address
pub(crate) const ANONYMOUS_RELAY: &str = "ANONYMOUS-RELAY";

/// Connection endpoint states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    /// No transport established (initial, or between reconnect attempts)
    Start,
    /// Open sent, waiting for the peer's
    OpenSent,
    /// Open exchanged; frames flow
    Opened,
    /// Close sent, waiting for the peer's
    CloseSent,
    /// Fully closed
    End,
}

/// How the inner event loop ended
enum LoopExit {
    /// Clean close handshake completed
    Closed,
    /// Every user handle is gone; abandon without a Close frame
    ControlDropped,
    /// Transport or protocol failure
    Failure(Error),
}

/// How to dial the next endpoint
pub(crate) enum Dialer {
    Tcp,
    #[cfg(feature = "rustls")]
    Tls {
        config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>,
    },
    /// A caller-supplied stream (WebSocket adapters land here); reconnect
    /// cannot re-dial it
    Supplied(Option<IoStream>),
}

pub(crate) struct ConnectionEngine {
    connection_id: String,
    container_id: String,
    options: ConnectionOptions,
    dialer: Dialer,
    reconnect: ReconnectState,

    control_rx: mpsc::Receiver<WorkItem>,
    events: mpsc::UnboundedSender<ConnectionEvent>,

    state: ConnectionState,
    remote_open: Option<Box<Open>>,
    agreed_max_frame_size: usize,
    heartbeat: HeartBeat,
    /// Host dialed for the current transport; used as Open hostname unless a
    /// virtual host overrides it
    current_host: String,

    sessions: Slab<SessionInner>,
    /// Incoming channel number to session index
    channel_index: HashMap<u16, usize>,
    session_seq: u64,

    open_waiters: Vec<Responder<OpenedInfo>>,
    close_waiters: Vec<Responder<()>>,
    /// Work deferred until the connection (or a session) can take it
    deferred: Vec<WorkItem>,

    ever_connected: bool,
    replaying: bool,
}

impl ConnectionEngine {
    pub(crate) fn new(
        connection_id: String,
        container_id: String,
        host: String,
        port: u16,
        options: ConnectionOptions,
        dialer: Dialer,
        control_rx: mpsc::Receiver<WorkItem>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let reconnect = ReconnectState::new(
            options.reconnect.clone(),
            (host.clone(), port),
            options.alternate_hosts.clone(),
        );
        let agreed_max_frame_size = options.max_frame_size as usize;
        Self {
            connection_id,
            container_id,
            options,
            dialer,
            reconnect,
            control_rx,
            events,
            state: ConnectionState::Start,
            remote_open: None,
            agreed_max_frame_size,
            heartbeat: HeartBeat::never(),
            current_host: String::new(),
            sessions: Slab::new(),
            channel_index: HashMap::new(),
            session_seq: 0,
            open_waiters: Vec::new(),
            close_waiters: Vec::new(),
            deferred: Vec::new(),
            ever_connected: false,
            replaying: false,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let mut transport = match self.establish().await {
                Ok(Some(transport)) => transport,
                // Close or handle loss during backoff
                Ok(None) => return,
                Err(err) => match self.handle_failure(err) {
                    Ok(()) => continue,
                    Err(cause) => return self.moribund(cause).await,
                },
            };

            match self.event_loop(&mut transport).await {
                LoopExit::Closed => {
                    debug!(connection = %self.connection_id, "connection closed");
                    return self
                        .moribund(Error::resource_closed("connection is closed"))
                        .await;
                }
                LoopExit::ControlDropped => {
                    trace!(connection = %self.connection_id, "all handles dropped");
                    return;
                }
                LoopExit::Failure(err) => match self.handle_failure(err) {
                    Ok(()) => continue,
                    Err(cause) => return self.moribund(cause).await,
                },
            }
        }
    }

    /// Keeps answering work items with the recorded failure cause until
    /// every handle is gone, so late callers fail fast with the real reason
    /// instead of a generic closed-channel error
    async fn moribund(&mut self, cause: Error) {
        while let Some(item) = self.control_rx.recv().await {
            match item {
                WorkItem::Close { responder, .. } => {
                    let _ = responder.send(Ok(()));
                }
                item => fail_work_item(item, &cause),
            }
        }
    }

    /* ------------------------------ connecting ------------------------------ */

    /// Dials the next endpoint, runs SASL and the header exchange, and sends
    /// Open. Returns `Ok(None)` when the connection was closed while waiting
    /// out the backoff delay.
    async fn establish(&mut self) -> Result<Option<Transport>, Error> {
        let delay = self.reconnect.delay();
        if !delay.is_zero() && self.sleep_interruptibly(delay).await {
            return Ok(None);
        }

        let (host, port) = self.reconnect.next_endpoint();
        debug!(connection = %self.connection_id, host = %host, port, "connecting");

        let io = self.dial(&host, port).await?;
        let io = match self.options.sasl.clone() {
            Some(profile) => self.negotiate_sasl(io, &host, profile).await?,
            None => io,
        };

        let mut io = io;
        Transport::negotiate(&mut io, ProtocolHeader::amqp()).await?;

        let mut transport = Transport::bind(
            io,
            self.options.max_frame_size as usize,
            self.options.idle_timeout,
        );

        self.current_host = host;
        transport.send_frame(self.open_frame()).await?;
        self.state = ConnectionState::OpenSent;
        Ok(Some(transport))
    }

    async fn dial(&mut self, host: &str, port: u16) -> Result<IoStream, Error> {
        const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

        match &mut self.dialer {
            Dialer::Tcp => {
                let stream = tokio::time::timeout(
                    DIAL_TIMEOUT,
                    tokio::net::TcpStream::connect((host, port)),
                )
                .await
                .map_err(|_| {
                    Error::from(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                })??;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream) as IoStream)
            }
            #[cfg(feature = "rustls")]
            Dialer::Tls { config } => {
                let config = config.clone();
                let stream = tokio::time::timeout(
                    DIAL_TIMEOUT,
                    tokio::net::TcpStream::connect((host, port)),
                )
                .await
                .map_err(|_| {
                    Error::from(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                })??;
                stream.set_nodelay(true)?;
                crate::transport::tls::connect(stream, host, config).await
            }
            Dialer::Supplied(stream) => stream.take().ok_or_else(|| {
                Error::resource_closed(
                    "caller-supplied stream cannot be re-dialed after a failure",
                )
            }),
        }
    }

    async fn negotiate_sasl(
        &self,
        io: IoStream,
        host: &str,
        profile: SaslProfile,
    ) -> Result<IoStream, Error> {
        let hostname = self.options.virtual_host.as_deref().unwrap_or(host);
        Transport::connect_sasl(io, Some(hostname), profile).await
    }

    fn open_frame(&self) -> Frame {
        let hostname = self
            .options
            .virtual_host
            .clone()
            .unwrap_or_else(|| self.current_host.clone());
        let open = Open {
            container_id: self.container_id.clone(),
            hostname: Some(hostname),
            max_frame_size: self.options.max_frame_size.into(),
            channel_max: self.options.channel_max.into(),
            // Advertise half the enforced threshold so a punctual peer
            // never trips it
            idle_time_out: self
                .options
                .idle_timeout
                .map(|timeout| (timeout.as_millis() / 2) as u32),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: capabilities_field(&self.options.offered_capabilities)
                .map(Into::into),
            desired_capabilities: capabilities_field(&self.options.desired_capabilities)
                .map(Into::into),
            properties: self.options.properties.clone().map(Into::into),
        };
        Frame::new(0, FrameBody::Open(Box::new(open)))
    }

    /// Sleeps out the backoff delay while keeping the control channel
    /// drained. Returns true when the loop should stop.
    async fn sleep_interruptibly(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                item = self.control_rx.recv() => match item {
                    Some(WorkItem::Close { responder, .. }) => {
                        let _ = responder.send(Ok(()));
                        self.fail_everything(&Error::resource_closed(
                            "connection closed during reconnect",
                        ));
                        return true;
                    }
                    Some(item) => self.deferred.push(item),
                    None => return true,
                },
            }
        }
    }

    /* ------------------------------ event loop ------------------------------ */

    async fn event_loop(&mut self, transport: &mut Transport) -> LoopExit {
        loop {
            let step = tokio::select! {
                Some(()) = self.heartbeat.next() => self.on_heartbeat(transport).await,
                incoming = transport.next() => match incoming {
                    Some(Ok(frame)) => self.on_incoming(transport, frame).await,
                    Some(Err(err)) => Err(err),
                    None => Err(Error::from(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "transport closed by peer",
                    ))),
                },
                item = self.control_rx.recv() => match item {
                    Some(item) => self.on_work_item(transport, item).await,
                    None => return LoopExit::ControlDropped,
                },
            };

            match step {
                Ok(Running::Continue) => {}
                Ok(Running::Stop) => return LoopExit::Closed,
                Err(err) => return LoopExit::Failure(err),
            }
        }
    }

    async fn on_heartbeat(&mut self, transport: &mut Transport) -> Result<Running, Error> {
        match self.state {
            ConnectionState::Opened | ConnectionState::OpenSent => {
                trace!(connection = %self.connection_id, "heartbeat");
                transport.send_frame(Frame::empty()).await?;
                Ok(Running::Continue)
            }
            _ => Ok(Running::Continue),
        }
    }

    /* ------------------------------- incoming ------------------------------- */

    async fn on_incoming(
        &mut self,
        transport: &mut Transport,
        frame: Frame,
    ) -> Result<Running, Error> {
        let Frame { channel, body } = frame;

        match body {
            FrameBody::Open(open) => self.on_remote_open(transport, open).await,
            FrameBody::Begin(begin) => self.on_remote_begin(transport, channel, begin).await,
            FrameBody::Close(close) => self.on_remote_close(transport, close).await,
            FrameBody::End(end) => self.on_remote_end(transport, channel, end).await,
            FrameBody::Attach(attach) => {
                let result = self
                    .with_session(channel, |session| session.on_incoming_attach(attach))?;
                match result {
                    Ok(frames) => {
                        self.write_frames(transport, frames).await?;
                        Ok(Running::Continue)
                    }
                    Err(err) => self.session_error(transport, channel, err).await,
                }
            }
            FrameBody::Flow(flow) => {
                let result =
                    self.with_session(channel, |session| session.on_incoming_flow(flow))?;
                match result {
                    Ok(frames) => {
                        self.write_frames(transport, frames).await?;
                        Ok(Running::Continue)
                    }
                    Err(err) => self.session_error(transport, channel, err).await,
                }
            }
            FrameBody::Transfer {
                performative,
                payload,
            } => {
                let result = self.with_session(channel, |session| {
                    session.on_incoming_transfer(performative, payload)
                })?;
                match result {
                    Ok(frames) => {
                        self.write_frames(transport, frames).await?;
                        Ok(Running::Continue)
                    }
                    Err(err) => self.session_error(transport, channel, err).await,
                }
            }
            FrameBody::Disposition(disposition) => {
                let frames = self
                    .with_session(channel, |session| {
                        Ok::<_, Error>(session.on_incoming_disposition(disposition))
                    })??;
                self.write_frames(transport, frames).await?;
                Ok(Running::Continue)
            }
            FrameBody::Detach(detach) => {
                let frames = self
                    .with_session(channel, |session| {
                        Ok::<_, Error>(session.on_incoming_detach(detach))
                    })??;
                self.write_frames(transport, frames).await?;
                Ok(Running::Continue)
            }
            FrameBody::Empty => Ok(Running::Continue),
        }
    }

    async fn on_remote_open(
        &mut self,
        transport: &mut Transport,
        open: Box<Open>,
    ) -> Result<Running, Error> {
        if self.state == ConnectionState::CloseSent {
            // Pipelined close: record the open, stay on course for Closed
            self.remote_open = Some(open);
            return Ok(Running::Continue);
        }
        if self.state != ConnectionState::OpenSent {
            return Err(Error::protocol(
                AmqpError::IllegalState,
                "Open arrived outside of the open handshake",
            ));
        }

        self.agreed_max_frame_size =
            (self.options.max_frame_size.min(open.max_frame_size.0.max(512))) as usize;
        transport.set_max_frame_size(self.agreed_max_frame_size);
        for (_, session) in self.sessions.iter_mut() {
            session.set_max_frame_size(self.agreed_max_frame_size);
        }

        // Keep the peer alive: empty frames at half its advertised timeout
        self.heartbeat = match open.idle_time_out {
            Some(millis) if millis > 0 => {
                HeartBeat::new(std::time::Duration::from_millis((millis / 2).max(1) as u64))
            }
            _ => HeartBeat::never(),
        };

        self.state = ConnectionState::Opened;
        self.remote_open = Some(open);
        self.reconnect.reset_attempts();

        debug!(connection = %self.connection_id, host = %self.current_host, "connection opened");

        for responder in self.open_waiters.drain(..) {
            if let Some(remote_open) = &self.remote_open {
                let _ = responder.send(Ok(OpenedInfo {
                    remote_open: remote_open.clone(),
                }));
            }
        }

        if self.replaying {
            self.replaying = false;
            self.emit(ConnectionEvent::Reconnected {
                host: self.current_host.clone(),
            });
            // Re-establish the session topology; links follow once each
            // Begin is answered
            let mut begin_frames = Vec::new();
            for (_, session) in self.sessions.iter_mut() {
                begin_frames.push(session.begin_frame());
            }
            self.write_frames(transport, begin_frames).await?;
        } else if !self.ever_connected {
            self.ever_connected = true;
            self.emit(ConnectionEvent::Connected {
                host: self.current_host.clone(),
            });
        }

        let deferred = std::mem::take(&mut self.deferred);
        for item in deferred {
            self.on_work_item(transport, item).await?;
        }
        Ok(Running::Continue)
    }

    async fn on_remote_begin(
        &mut self,
        transport: &mut Transport,
        channel: u16,
        begin: Begin,
    ) -> Result<Running, Error> {
        let outgoing_channel = begin.remote_channel.ok_or_else(|| {
            Error::protocol(
                AmqpError::NotAllowed,
                "Begin response is missing the remote-channel field",
            )
        })?;
        let index = outgoing_channel as usize;
        if !self.sessions.contains(index) {
            return Err(Error::protocol(
                AmqpError::NotFound,
                format!("Begin references unknown local channel {}", outgoing_channel),
            ));
        }
        self.channel_index.insert(channel, index);

        let session = &mut self.sessions[index];
        session.on_incoming_begin(channel, &begin)?;
        // No-op on a fresh session; re-attaches every surviving link after a
        // reconnect
        let frames = session.replay_attaches();
        self.write_frames(transport, frames).await?;
        Ok(Running::Continue)
    }

    async fn on_remote_end(
        &mut self,
        transport: &mut Transport,
        channel: u16,
        end: End,
    ) -> Result<Running, Error> {
        let index = match self.channel_index.remove(&channel) {
            Some(index) => index,
            None => {
                return Err(Error::protocol(
                    AmqpError::NotFound,
                    format!("End references unknown channel {}", channel),
                ))
            }
        };
        if self.sessions.contains(index) {
            let frames = {
                let session = &mut self.sessions[index];
                session.on_incoming_end(end)
            };
            self.sessions.remove(index);
            self.write_frames(transport, frames).await?;
        }
        Ok(Running::Continue)
    }

    async fn on_remote_close(
        &mut self,
        transport: &mut Transport,
        close: Close,
    ) -> Result<Running, Error> {
        match self.state {
            ConnectionState::CloseSent => {
                // Our close completed
                self.state = ConnectionState::End;
                let cause = Error::resource_closed("connection is closed");
                for responder in self.open_waiters.drain(..) {
                    let _ = responder.send(Err(cause.clone()));
                }
                for responder in self.close_waiters.drain(..) {
                    let _ = responder.send(Ok(()));
                }
                self.fail_sessions(&cause);
                Ok(Running::Stop)
            }
            _ => {
                // Remote-initiated close: echo it, then treat the condition
                // as this connection's failure cause
                let _ = transport.send_frame(Frame::new(0, FrameBody::Close(Close { error: None }))).await;
                self.state = ConnectionState::End;
                Err(Error::ConnectionRemotelyClosed { error: close.error })
            }
        }
    }

    /* ------------------------------ work items ------------------------------ */

    async fn on_work_item(
        &mut self,
        transport: &mut Transport,
        item: WorkItem,
    ) -> Result<Running, Error> {
        match item {
            WorkItem::Open { responder } => {
                match self.state {
                    ConnectionState::Opened => {
                        if let Some(remote_open) = &self.remote_open {
                            let _ = responder.send(Ok(OpenedInfo {
                                remote_open: remote_open.clone(),
                            }));
                        }
                    }
                    ConnectionState::End => {
                        let _ = responder.send(Err(Error::resource_closed(
                            "connection is closed",
                        )));
                    }
                    _ => self.open_waiters.push(responder),
                }
                Ok(Running::Continue)
            }

            WorkItem::Close { error, responder } => {
                match self.state {
                    ConnectionState::End => {
                        let _ = responder.send(Ok(()));
                        Ok(Running::Continue)
                    }
                    ConnectionState::CloseSent => {
                        self.close_waiters.push(responder);
                        Ok(Running::Continue)
                    }
                    _ => {
                        // Closing before the open completed abandons the
                        // open waiters
                        let cause = Error::resource_closed("connection closed by user");
                        for waiter in self.open_waiters.drain(..) {
                            let _ = waiter.send(Err(cause.clone()));
                        }
                        transport
                            .send_frame(Frame::new(0, FrameBody::Close(Close { error })))
                            .await?;
                        self.state = ConnectionState::CloseSent;
                        self.close_waiters.push(responder);
                        Ok(Running::Continue)
                    }
                }
            }

            WorkItem::BeginSession { options, responder } => {
                if self.state != ConnectionState::Opened {
                    self.deferred.push(WorkItem::BeginSession { options, responder });
                    return Ok(Running::Continue);
                }
                if self.sessions.len() > self.options.channel_max as usize {
                    let _ = responder.send(Err(Error::illegal_state(
                        "channel-max exhausted, no channel available for a new session",
                    )));
                    return Ok(Running::Continue);
                }
                let entry = self.sessions.vacant_entry();
                let channel = entry.key() as u16;
                let session_id = crate::util::child_id(&self.connection_id, self.session_seq);
                self.session_seq += 1;

                let mut session = SessionInner::new(
                    session_id,
                    channel,
                    options,
                    self.agreed_max_frame_size,
                );
                session.begin_responder = Some(responder);
                let frame = session.begin_frame();
                entry.insert(session);
                self.write_frames(transport, vec![frame]).await?;
                Ok(Running::Continue)
            }

            WorkItem::EndSession {
                channel,
                error,
                responder,
            } => {
                let index = channel as usize;
                if !self.sessions.contains(index) {
                    let _ = responder.send(Ok(()));
                    return Ok(Running::Continue);
                }
                let session = &mut self.sessions[index];
                match session.state {
                    SessionState::Mapped => {
                        session.end_responder = Some(responder);
                        let frame = session.end_frame(error);
                        self.write_frames(transport, vec![frame]).await?;
                    }
                    SessionState::EndSent | SessionState::Discarding => {
                        match session.end_responder.is_some() {
                            // The first end call owns the handshake; later
                            // calls complete with it
                            true => {
                                let _ = responder.send(Ok(()));
                            }
                            false => session.end_responder = Some(responder),
                        }
                    }
                    _ => {
                        let _ = responder.send(Ok(()));
                    }
                }
                Ok(Running::Continue)
            }

            WorkItem::AttachSender {
                channel,
                name,
                address,
                options,
                responder,
            } => {
                if self.state != ConnectionState::Opened {
                    self.deferred.push(WorkItem::AttachSender {
                        channel,
                        name,
                        address,
                        options,
                        responder,
                    });
                    return Ok(Running::Continue);
                }
                let frames =
                    self.attach_sender_now(channel, name, address, options, responder);
                self.write_frames(transport, frames).await?;
                Ok(Running::Continue)
            }

            WorkItem::AttachReceiver {
                channel,
                name,
                address,
                options,
                responder,
            } => {
                if self.state != ConnectionState::Opened {
                    self.deferred.push(WorkItem::AttachReceiver {
                        channel,
                        name,
                        address,
                        options,
                        responder,
                    });
                    return Ok(Running::Continue);
                }
                let frames =
                    self.attach_receiver_now(channel, name, address, options, responder);
                self.write_frames(transport, frames).await?;
                Ok(Running::Continue)
            }

            WorkItem::DetachLink {
                channel,
                handle,
                closed,
                error,
                responder,
            } => {
                let index = channel as usize;
                if !self.sessions.contains(index) {
                    let _ = responder.send(Ok(()));
                    return Ok(Running::Continue);
                }
                let frames = self.sessions[index].detach_link(handle, closed, error, responder);
                self.write_frames(transport, frames).await?;
                Ok(Running::Continue)
            }

            WorkItem::Send {
                channel,
                handle,
                payload,
                message_format,
                settled,
                try_only,
                responder,
            } => {
                match self.sender_context(channel, handle) {
                    Ok((link, tx, ch, max_frame_size)) => {
                        let frames = link.send(
                            payload,
                            message_format,
                            settled,
                            try_only,
                            tx,
                            ch,
                            max_frame_size,
                            responder,
                        );
                        self.write_frames(transport, frames).await?;
                    }
                    Err(err) => {
                        let _ = responder.send(Err(err));
                    }
                }
                Ok(Running::Continue)
            }

            WorkItem::StreamPart {
                channel,
                handle,
                payload,
                message_format,
                more,
                aborted,
                responder,
            } => {
                match self.sender_context(channel, handle) {
                    Ok((link, tx, ch, max_frame_size)) => {
                        match link.stream_part(
                            payload,
                            message_format,
                            more,
                            aborted,
                            tx,
                            ch,
                            max_frame_size,
                        ) {
                            Ok((frames, settlement)) => {
                                self.write_frames(transport, frames).await?;
                                let _ = responder.send(Ok(settlement));
                            }
                            Err(err) => {
                                let _ = responder.send(Err(err));
                            }
                        }
                    }
                    Err(err) => {
                        let _ = responder.send(Err(err));
                    }
                }
                Ok(Running::Continue)
            }

            WorkItem::AddCredit {
                channel,
                handle,
                credit,
                responder,
            } => {
                match self.receiver_context(channel, handle) {
                    Ok((link, tx, ch)) => match link.add_credit(credit, tx, ch) {
                        Ok(frame) => {
                            let _ = responder.send(Ok(()));
                            self.write_frames(transport, frame.into_iter().collect())
                                .await?;
                        }
                        Err(err) => {
                            let _ = responder.send(Err(err));
                        }
                    },
                    Err(err) => {
                        let _ = responder.send(Err(err));
                    }
                }
                Ok(Running::Continue)
            }

            WorkItem::Drain {
                channel,
                handle,
                responder,
            } => {
                match self.receiver_context(channel, handle) {
                    Ok((link, tx, ch)) => {
                        let frame = link.drain(responder, tx, ch);
                        self.write_frames(transport, frame.into_iter().collect())
                            .await?;
                    }
                    Err(err) => {
                        let _ = responder.send(Err(err));
                    }
                }
                Ok(Running::Continue)
            }

            WorkItem::Consumed {
                channel,
                handle,
                count,
            } => {
                if let Ok((link, tx, ch)) = self.receiver_context(channel, handle) {
                    let frame = link.consumed(count, tx, ch);
                    self.write_frames(transport, frame.into_iter().collect())
                        .await?;
                }
                Ok(Running::Continue)
            }

            WorkItem::Disposition {
                channel,
                handle,
                delivery_id,
                state,
                settled,
                responder,
            } => {
                match self.receiver_context(channel, handle) {
                    Ok((link, _tx, ch)) => {
                        let frame = link.disposition(delivery_id, state, settled, ch, responder);
                        self.write_frames(transport, frame.into_iter().collect())
                            .await?;
                    }
                    Err(err) => {
                        let _ = responder.send(Err(err));
                    }
                }
                Ok(Running::Continue)
            }

            WorkItem::TrackerDisposition {
                channel,
                handle,
                delivery_tag,
                state,
                settled,
                responder,
            } => {
                match self.sender_context(channel, handle) {
                    Ok((link, _tx, ch, _max)) => {
                        let frame = link.local_disposition(&delivery_tag, state, settled, ch);
                        // A missing entry means the delivery is already
                        // settled on both sides; the call is idempotent
                        let _ = responder.send(Ok(()));
                        self.write_frames(transport, frame.into_iter().collect())
                            .await?;
                    }
                    Err(err) => {
                        let _ = responder.send(Err(err));
                    }
                }
                Ok(Running::Continue)
            }
        }
    }

    fn attach_sender_now(
        &mut self,
        channel: u16,
        name: String,
        address: Option<String>,
        options: SenderOptions,
        responder: Responder<crate::control::AttachedLink>,
    ) -> Vec<Frame> {
        // Null target addresses lean on the anonymous relay
        if address.is_none() && !self.remote_offers(ANONYMOUS_RELAY) {
            let _ = responder.send(Err(Error::UnsupportedOperation {
                message: "the remote peer does not offer ANONYMOUS-RELAY".to_string(),
            }));
            return Vec::new();
        }

        let index = channel as usize;
        if !self.sessions.contains(index) {
            let _ = responder.send(Err(Error::resource_closed("session is closed")));
            return Vec::new();
        }
        let session = &mut self.sessions[index];
        if let Err(err) = session.check_attach(&name) {
            let _ = responder.send(Err(err));
            return Vec::new();
        }

        let link_id = session.allocate_link_id();
        let attach = fe2o3_amqp_types::performatives::Attach {
            name: name.clone(),
            handle: 0u32.into(),
            role: fe2o3_amqp_types::definitions::Role::Sender,
            snd_settle_mode: options.snd_settle_mode.clone(),
            rcv_settle_mode: options.rcv_settle_mode.clone(),
            source: Some(make_source(None, &options.source).into()),
            target: Some(Box::new(fe2o3_amqp_types::messaging::TargetArchetype::Target(
                make_target(address, &options.target),
            ))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: capabilities_field(&options.offered_capabilities)
                .map(Into::into),
            desired_capabilities: capabilities_field(&options.desired_capabilities)
                .map(Into::into),
            properties: options.properties.clone().map(Into::into),
        };

        let core = LinkCore::new(name, link_id, 0, attach);
        let mut link = SenderLink::new(core, options.auto_settle);
        link.attach_responder = Some(responder);
        session.attach_link(LinkEndpoint::Sender(link))
    }

    fn attach_receiver_now(
        &mut self,
        channel: u16,
        name: String,
        address: Option<String>,
        options: ReceiverOptions,
        responder: Responder<crate::control::AttachedReceiver>,
    ) -> Vec<Frame> {
        let index = channel as usize;
        if !self.sessions.contains(index) {
            let _ = responder.send(Err(Error::resource_closed("session is closed")));
            return Vec::new();
        }

        if address.is_none() && !options.source.dynamic {
            let _ = responder.send(Err(Error::illegal_state(
                "receiver needs a source address unless the source is dynamic",
            )));
            return Vec::new();
        }

        let session = &mut self.sessions[index];
        if let Err(err) = session.check_attach(&name) {
            let _ = responder.send(Err(err));
            return Vec::new();
        }

        let link_id = session.allocate_link_id();
        let attach = fe2o3_amqp_types::performatives::Attach {
            name: name.clone(),
            handle: 0u32.into(),
            role: fe2o3_amqp_types::definitions::Role::Receiver,
            snd_settle_mode: options.snd_settle_mode.clone(),
            rcv_settle_mode: options.rcv_settle_mode.clone(),
            source: Some(make_source(address, &options.source).into()),
            target: Some(Box::new(fe2o3_amqp_types::messaging::TargetArchetype::Target(
                make_target(None, &options.target),
            ))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: capabilities_field(&options.offered_capabilities)
                .map(Into::into),
            desired_capabilities: capabilities_field(&options.desired_capabilities)
                .map(Into::into),
            properties: options.properties.clone().map(Into::into),
        };

        let core = LinkCore::new(name, link_id, 0, attach);
        let mut link = ReceiverLink::new(core, options.credit_window);
        link.attach_responder = Some(responder);
        session.attach_link(LinkEndpoint::Receiver(link))
    }

    /* ------------------------------- plumbing ------------------------------- */

    fn remote_offers(&self, capability: &str) -> bool {
        self.remote_open
            .as_ref()
            .and_then(|open| open.offered_capabilities.as_ref())
            .map(|capabilities| {
                capabilities
                    .iter()
                    .any(|symbol| symbol.as_str() == capability)
            })
            .unwrap_or(false)
    }

    /// Routes a frame to the session mapped on its incoming channel
    fn with_session<T>(
        &mut self,
        channel: u16,
        f: impl FnOnce(&mut SessionInner) -> T,
    ) -> Result<T, Error> {
        let index = self.channel_index.get(&channel).copied().ok_or_else(|| {
            Error::protocol(
                AmqpError::NotFound,
                format!("frame for unknown channel {}", channel),
            )
        })?;
        match self.sessions.get_mut(index) {
            Some(session) => Ok(f(session)),
            None => Err(Error::protocol(
                AmqpError::NotFound,
                format!("frame for unmapped channel {}", channel),
            )),
        }
    }

    fn sender_context(
        &mut self,
        channel: u16,
        handle: u32,
    ) -> Result<
        (
            &mut SenderLink,
            &mut crate::session::SessionTxState,
            u16,
            usize,
        ),
        Error,
    > {
        let index = channel as usize;
        match self.sessions.get_mut(index) {
            Some(session) => session.sender_context(handle),
            None => Err(Error::resource_closed("session is closed")),
        }
    }

    fn receiver_context(
        &mut self,
        channel: u16,
        handle: u32,
    ) -> Result<(&mut ReceiverLink, &crate::session::SessionTxState, u16), Error> {
        let index = channel as usize;
        match self.sessions.get_mut(index) {
            Some(session) => session.receiver_context(handle),
            None => Err(Error::resource_closed("session is closed")),
        }
    }

    /// Ends one session after a session-level protocol violation
    async fn session_error(
        &mut self,
        transport: &mut Transport,
        channel: u16,
        err: Error,
    ) -> Result<Running, Error> {
        warn!(connection = %self.connection_id, channel, error = %err, "session error");
        let index = match self.channel_index.remove(&channel) {
            Some(index) => index,
            None => return Err(err),
        };
        if self.sessions.contains(index) {
            let mut session = self.sessions.remove(index);
            let condition = match &err {
                Error::Protocol { condition, .. } => condition.clone(),
                _ => AmqpError::InternalError.into(),
            };
            let frame = session.end_frame(Some(definitions::Error::new(
                condition,
                Some(err.to_string()),
                None,
            )));
            session.fail_all(&err);
            self.write_frames(transport, vec![frame]).await?;
        }
        Ok(Running::Continue)
    }

    async fn write_frames(
        &mut self,
        transport: &mut Transport,
        frames: Vec<Frame>,
    ) -> Result<(), Error> {
        if frames.is_empty() {
            return Ok(());
        }
        // One flush per batch: performative and payload fragments coalesce
        // into a single write
        for frame in frames {
            transport.feed_frame(frame).await?;
        }
        transport.flush_frames().await
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /* ------------------------------- failure -------------------------------- */

    /// Decides between reconnecting and tearing everything down.
    /// `Ok(())` means run another connect cycle; `Err` carries the terminal
    /// failure cause.
    fn handle_failure(&mut self, err: Error) -> Result<(), Error> {
        let err = err.into_security_if_unauthorized();

        let close_requested = !self.close_waiters.is_empty();
        let recoverable = err.is_recoverable()
            && self.reconnect.enabled()
            && !close_requested
            && self.reconnect.attempt_allowed();

        if recoverable {
            warn!(connection = %self.connection_id, error = %err, "connection interrupted, will reconnect");
            if self.ever_connected && !self.replaying {
                self.emit(ConnectionEvent::Interrupted { error: err.clone() });
            }
            if self.ever_connected {
                self.replaying = true;
            }
            self.state = ConnectionState::Start;
            self.remote_open = None;
            self.heartbeat = HeartBeat::never();
            self.channel_index.clear();

            // Deliveries transferred but not yet settled fail as remotely
            // closed; sends still queued on credit survive the failover
            let cause = match &err {
                Error::Io { .. } => Error::ConnectionRemotelyClosed { error: None },
                other => other.clone(),
            };
            for (_, session) in self.sessions.iter_mut() {
                session.reset_for_replay(&cause);
            }
            Ok(())
        } else {
            error!(connection = %self.connection_id, error = %err, "connection failed");
            // A failure during a user-requested close is just the close
            // finishing the hard way
            if !close_requested {
                self.emit(ConnectionEvent::Failed { error: err.clone() });
            }
            self.fail_everything(&err);
            Err(err)
        }
    }

    fn fail_everything(&mut self, cause: &Error) {
        self.state = ConnectionState::End;
        for responder in self.open_waiters.drain(..) {
            let _ = responder.send(Err(cause.clone()));
        }
        for responder in self.close_waiters.drain(..) {
            // A close future completes once the connection is gone, however
            // it went
            let _ = responder.send(Ok(()));
        }
        for item in self.deferred.drain(..) {
            fail_work_item(item, cause);
        }
        self.fail_sessions(cause);
    }

    fn fail_sessions(&mut self, cause: &Error) {
        for (_, session) in self.sessions.iter_mut() {
            session.fail_all(cause);
        }
        self.sessions.clear();
        self.channel_index.clear();
    }
}

/// Answers a deferred work item with the connection's failure cause
fn fail_work_item(item: WorkItem, cause: &Error) {
    match item {
        WorkItem::Open { responder } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::Close { responder, .. } => {
            let _ = responder.send(Ok(()));
        }
        WorkItem::BeginSession { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::EndSession { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::AttachSender { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::AttachReceiver { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::DetachLink { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::Send { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::StreamPart { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::AddCredit { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::Drain { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::Consumed { .. } => {}
        WorkItem::Disposition { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
        WorkItem::TrackerDisposition { responder, .. } => {
            let _ = responder.send(Err(cause.clone()));
        }
    }
}
