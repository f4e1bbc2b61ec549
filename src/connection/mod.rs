//! The user-facing connection handle and its lifecycle events

pub(crate) mod engine;
pub(crate) mod heartbeat;
pub(crate) mod reconnect;

pub use reconnect::ReconnectOptions;

use std::time::Duration;

use fe2o3_amqp_types::definitions;
use fe2o3_amqp_types::messaging::SerializableBody;
use fe2o3_amqp_types::performatives::Open;
use fe2o3_amqp_types::primitives::Symbol;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::control::{OpenedInfo, Responder, WorkItem};
use crate::error::Error;
use crate::link::delivery::Sendable;
use crate::link::{Receiver, Sender, Tracker};
use crate::options::{
    ConnectionOptions, ReceiverOptions, SenderOptions, SessionOptions,
};
use crate::session::Session;
use crate::transport::IoStream;

use engine::{ConnectionEngine, Dialer};

/// Lifecycle notifications, delivered in order and exactly once per
/// transition
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The first open handshake completed
    Connected {
        /// Host that answered
        host: String,
    },
    /// An established connection failed; reconnection is under way
    Interrupted {
        /// The failure that interrupted the connection
        error: Error,
    },
    /// A reconnect attempt succeeded and the topology was re-established
    Reconnected {
        /// Host that answered
        host: String,
    },
    /// The connection is gone for good
    Failed {
        /// The terminal failure
        error: Error,
    },
}

/// Per-operation timeouts snapshot handed to child handles
#[derive(Debug, Clone)]
pub(crate) struct OpTimeouts {
    pub request: Duration,
    pub close: Duration,
    pub send: Option<Duration>,
}

/// Sends a work item and awaits its responder under a timeout
pub(crate) async fn request<T>(
    control: &mpsc::Sender<WorkItem>,
    timeout: Duration,
    build: impl FnOnce(Responder<T>) -> WorkItem,
) -> Result<T, Error> {
    let (responder, rx) = oneshot::channel();
    control
        .send(build(responder))
        .await
        .map_err(|_| Error::resource_closed("connection is closed"))?;
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => Err(Error::OperationTimedOut),
        Ok(Err(_)) => Err(Error::resource_closed("connection is closed")),
        Ok(Ok(result)) => result,
    }
}

/// Same as [`request`] but willing to wait forever
pub(crate) async fn request_unbounded<T>(
    control: &mpsc::Sender<WorkItem>,
    build: impl FnOnce(Responder<T>) -> WorkItem,
) -> Result<T, Error> {
    let (responder, rx) = oneshot::channel();
    control
        .send(build(responder))
        .await
        .map_err(|_| Error::resource_closed("connection is closed"))?;
    rx.await
        .map_err(|_| Error::resource_closed("connection is closed"))?
}

/// One AMQP connection: a facade over its event-loop task
///
/// Obtained from [`Container::connect`](crate::Container::connect). All
/// methods are safe to call from any task; they enqueue work for the event
/// loop and await its answer.
pub struct Connection {
    id: String,
    control: mpsc::Sender<WorkItem>,
    events_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    remote_open: Box<Open>,
    timeouts: OpTimeouts,
    default_session: tokio::sync::OnceCell<Session>,
    default_sender: tokio::sync::OnceCell<Sender>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

impl Connection {
    /// Spawns the engine, waits for the open handshake, and returns the
    /// handle. Used by `Container::connect`.
    pub(crate) async fn establish(
        container_id: String,
        host: &str,
        port: u16,
        options: ConnectionOptions,
        supplied: Option<IoStream>,
    ) -> Result<Self, Error> {
        let connection_id = crate::util::next_connection_seq().to_string();
        let open_timeout = options.open_timeout;
        let timeouts = OpTimeouts {
            request: options.request_timeout,
            close: options.close_timeout,
            send: options.send_timeout,
        };

        let dialer = match supplied {
            Some(io) => Dialer::Supplied(Some(io)),
            None => {
                #[cfg(feature = "rustls")]
                {
                    match options.tls_config.clone() {
                        Some(config) => Dialer::Tls { config },
                        None => Dialer::Tcp,
                    }
                }
                #[cfg(not(feature = "rustls"))]
                {
                    Dialer::Tcp
                }
            }
        };

        let (control_tx, control_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let engine = ConnectionEngine::new(
            connection_id.clone(),
            container_id,
            host.to_string(),
            port,
            options,
            dialer,
            control_rx,
            events_tx,
        );
        // The task stops by itself once every control sender is gone, so the
        // join handle does not need to be kept. Dropping a Connection
        // without close() therefore sends no Close frame.
        tokio::spawn(engine.run());

        let opened: Result<OpenedInfo, Error> =
            request(&control_tx, open_timeout, |responder| WorkItem::Open {
                responder,
            })
            .await;

        let opened = match opened {
            // An Open immediately followed by a Close (a rejected open) can
            // resolve the first wait before the failure lands; a second
            // round-trip observes the recorded cause instead
            Ok(_) => {
                request(&control_tx, open_timeout, |responder| WorkItem::Open {
                    responder,
                })
                .await
            }
            Err(err) => Err(err),
        };

        let info = match opened {
            Ok(info) => info,
            Err(err) => {
                // Ask the engine to wind down; it may already be gone
                let (responder, _rx) = oneshot::channel();
                let _ = control_tx.try_send(WorkItem::Close {
                    error: None,
                    responder,
                });
                return Err(err);
            }
        };

        debug!(connection = %connection_id, "connection established");
        Ok(Self {
            id: connection_id,
            control: control_tx,
            events_rx: Some(events_rx),
            remote_open: info.remote_open,
            timeouts,
            default_session: tokio::sync::OnceCell::new(),
            default_sender: tokio::sync::OnceCell::new(),
        })
    }

    /// Identifier of this connection, unique within the process
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Container id announced by the remote peer
    pub fn remote_container_id(&self) -> &str {
        &self.remote_open.container_id
    }

    /// Capabilities offered by the remote peer in its Open
    pub fn remote_offered_capabilities(&self) -> Vec<Symbol> {
        self.remote_open
            .offered_capabilities
            .as_ref()
            .map(|capabilities| capabilities.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Takes the lifecycle event stream. Returns `None` after the first
    /// call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.take()
    }

    /// Opens a new session with default options
    pub async fn open_session(&self) -> Result<Session, Error> {
        self.open_session_with(SessionOptions::default()).await
    }

    /// Opens a new session
    pub async fn open_session_with(&self, options: SessionOptions) -> Result<Session, Error> {
        let begun = request(&self.control, self.timeouts.request, |responder| {
            WorkItem::BeginSession { options, responder }
        })
        .await?;
        Ok(Session::new(
            begun.session_id,
            begun.channel,
            self.control.clone(),
            self.timeouts.clone(),
        ))
    }

    /// The lazily created default session backing the connection-level
    /// sender and receiver shortcuts
    pub async fn default_session(&self) -> Result<&Session, Error> {
        self.default_session
            .get_or_try_init(|| self.open_session())
            .await
    }

    /// Opens a sender on the default session
    pub async fn open_sender(&self, address: impl Into<String>) -> Result<Sender, Error> {
        self.default_session().await?.open_sender(address).await
    }

    /// Opens a sender with options on the default session
    pub async fn open_sender_with(
        &self,
        address: impl Into<String>,
        options: SenderOptions,
    ) -> Result<Sender, Error> {
        self.default_session()
            .await?
            .open_sender_with(address, options)
            .await
    }

    /// Opens an anonymous-relay sender on the default session
    pub async fn open_anonymous_sender(&self) -> Result<Sender, Error> {
        self.default_session().await?.open_anonymous_sender().await
    }

    /// Opens a receiver on the default session
    pub async fn open_receiver(&self, address: impl Into<String>) -> Result<Receiver, Error> {
        self.default_session().await?.open_receiver(address).await
    }

    /// Opens a receiver with options on the default session
    pub async fn open_receiver_with(
        &self,
        address: impl Into<String>,
        options: ReceiverOptions,
    ) -> Result<Receiver, Error> {
        self.default_session()
            .await?
            .open_receiver_with(address, options)
            .await
    }

    /// The lazily created anonymous default sender used by
    /// [`send`](Connection::send). Messages must carry their destination in
    /// the properties `to` field.
    pub async fn default_sender(&self) -> Result<&Sender, Error> {
        self.default_sender
            .get_or_try_init(|| async {
                self.default_session().await?.open_anonymous_sender().await
            })
            .await
    }

    /// Sends through the anonymous default sender
    pub async fn send<T: SerializableBody>(
        &self,
        sendable: impl Into<Sendable<T>>,
    ) -> Result<Tracker, Error> {
        self.default_sender().await?.send(sendable).await
    }

    /// Closes the connection. Idempotent: later calls (and concurrent ones)
    /// complete with the same handshake.
    pub async fn close(&self) -> Result<(), Error> {
        self.close_inner(None).await
    }

    /// Closes the connection with an error condition
    pub async fn close_with_error(&self, error: definitions::Error) -> Result<(), Error> {
        self.close_inner(Some(error)).await
    }

    async fn close_inner(&self, error: Option<definitions::Error>) -> Result<(), Error> {
        let result = request(&self.control, self.timeouts.close, |responder| {
            WorkItem::Close { error, responder }
        })
        .await;
        match result {
            // The engine exiting mid-request still means closed
            Err(Error::ResourceClosed { .. }) => Ok(()),
            other => other,
        }
    }
}

