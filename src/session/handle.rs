//! The user-facing session handle

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fe2o3_amqp_types::definitions;
use tokio::sync::mpsc;

use crate::connection::{request, OpTimeouts};
use crate::control::WorkItem;
use crate::error::Error;
use crate::link::{Receiver, Sender};
use crate::options::{ReceiverOptions, SenderOptions, SourceOptions};

/// One AMQP session: a channel inside a connection
///
/// Obtained from [`Connection::open_session`](crate::Connection::open_session).
pub struct Session {
    id: String,
    channel: u16,
    control: mpsc::Sender<WorkItem>,
    timeouts: OpTimeouts,
    link_name_seq: Arc<AtomicU64>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        id: String,
        channel: u16,
        control: mpsc::Sender<WorkItem>,
        timeouts: OpTimeouts,
    ) -> Self {
        Self {
            id,
            channel,
            control,
            timeouts,
            link_name_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Identifier of this session, `<connection>:<n>`
    pub fn id(&self) -> &str {
        &self.id
    }

    fn generated_name(&self, role: &str) -> String {
        let seq = self.link_name_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", role, self.id, seq)
    }

    /// Opens a sender to `address` with default options
    pub async fn open_sender(&self, address: impl Into<String>) -> Result<Sender, Error> {
        self.open_sender_with(address, SenderOptions::default())
            .await
    }

    /// Opens a sender to `address`
    pub async fn open_sender_with(
        &self,
        address: impl Into<String>,
        options: SenderOptions,
    ) -> Result<Sender, Error> {
        self.attach_sender(Some(address.into()), options).await
    }

    /// Opens a sender with a null target address, routed by the remote
    /// anonymous relay. Fails with
    /// [`Error::UnsupportedOperation`] when the peer does not offer the
    /// capability.
    pub async fn open_anonymous_sender(&self) -> Result<Sender, Error> {
        self.open_anonymous_sender_with(SenderOptions::default())
            .await
    }

    /// Opens an anonymous-relay sender with options
    pub async fn open_anonymous_sender_with(
        &self,
        options: SenderOptions,
    ) -> Result<Sender, Error> {
        self.attach_sender(None, options).await
    }

    async fn attach_sender(
        &self,
        address: Option<String>,
        options: SenderOptions,
    ) -> Result<Sender, Error> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| self.generated_name("sender"));
        let channel = self.channel;
        let attached = request(&self.control, self.timeouts.request, |responder| {
            WorkItem::AttachSender {
                channel,
                name: name.clone(),
                address: address.clone(),
                options,
                responder,
            }
        })
        .await?;

        Ok(Sender::new(
            name,
            address,
            attached,
            self.control.clone(),
            self.channel,
            self.timeouts.clone(),
        ))
    }

    /// Opens a receiver from `address` with default options
    pub async fn open_receiver(&self, address: impl Into<String>) -> Result<Receiver, Error> {
        self.open_receiver_with(address, ReceiverOptions::default())
            .await
    }

    /// Opens a receiver from `address`
    pub async fn open_receiver_with(
        &self,
        address: impl Into<String>,
        options: ReceiverOptions,
    ) -> Result<Receiver, Error> {
        self.attach_receiver(Some(address.into()), options).await
    }

    /// Opens a receiver on a dynamic node: the remote allocates an address
    /// and reports it back, available as
    /// [`Receiver::source_address`]
    pub async fn open_dynamic_receiver(
        &self,
        mut options: ReceiverOptions,
    ) -> Result<Receiver, Error> {
        options.source = SourceOptions {
            dynamic: true,
            ..options.source
        };
        self.attach_receiver(None, options).await
    }

    async fn attach_receiver(
        &self,
        address: Option<String>,
        options: ReceiverOptions,
    ) -> Result<Receiver, Error> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| self.generated_name("receiver"));
        let credit_window = options.credit_window;
        let channel = self.channel;
        let attached = request(&self.control, self.timeouts.request, |responder| {
            WorkItem::AttachReceiver {
                channel,
                name: name.clone(),
                address,
                options,
                responder,
            }
        })
        .await?;

        Ok(Receiver::new(
            name,
            attached,
            credit_window,
            self.control.clone(),
            self.channel,
            self.timeouts.clone(),
        ))
    }

    /// Ends the session. Idempotent.
    pub async fn close(&self) -> Result<(), Error> {
        self.close_inner(None).await
    }

    /// Ends the session with an error condition
    pub async fn close_with_error(&self, error: definitions::Error) -> Result<(), Error> {
        self.close_inner(Some(error)).await
    }

    async fn close_inner(&self, error: Option<definitions::Error>) -> Result<(), Error> {
        let channel = self.channel;
        let result = request(&self.control, self.timeouts.close, |responder| {
            WorkItem::EndSession {
                channel,
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
