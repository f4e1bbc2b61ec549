//! An imperative AMQP 1.0 client
//!
//! `siderite` multiplexes blocking-style messaging calls onto a single
//! framed byte stream: one event-loop task per connection drives the AMQP
//! connection/session/link state machines, session and link flow control,
//! multi-transfer delivery reassembly and settlement tracking, while user
//! handles stay plain `async` methods on [`Connection`], [`Session`],
//! [`Sender`] and [`Receiver`].
//!
//! ```rust,ignore
//! use siderite::{Container, ConnectionOptions};
//! use siderite::messaging::Message;
//!
//! let container = Container::new("example-client");
//! let connection = container
//!     .connect("localhost", 5672, ConnectionOptions::default())
//!     .await?;
//! let session = connection.open_session().await?;
//!
//! let sender = session.open_sender("examples").await?;
//! let mut tracker = sender
//!     .send(Message::builder().value("Hello World").build())
//!     .await?;
//! tracker.settlement().await?;
//!
//! let mut receiver = session.open_receiver("examples").await?;
//! let delivery = receiver.recv().await?;
//! receiver.accept(&delivery).await?;
//! connection.close().await?;
//! ```
//!
//! Failover is opt-in through [`ReconnectOptions`]; when enabled, the
//! engine rebuilds the full session and link topology on the next healthy
//! endpoint and reports progress on the [`ConnectionEvent`] stream.
//!
//! Performative types and the wire codec come from [`fe2o3_amqp_types`] and
//! [`serde_amqp`]; this crate contains the protocol engine only.

#![deny(missing_docs, missing_debug_implementations)]

mod connection;
mod container;
mod control;
mod error;
mod frames;
mod link;
mod options;
mod sasl_profile;
mod session;
mod transport;
mod util;

pub use connection::{Connection, ConnectionEvent, ReconnectOptions};
pub use container::Container;
pub use error::Error;
pub use link::{
    Delivery, Receiver, Sendable, Sender, SettlementFut, StreamingDelivery, Tracker,
};
pub use options::{
    ConnectionOptions, ReceiverOptions, SenderOptions, SessionOptions, SourceOptions,
    TargetOptions, DEFAULT_CREDIT_WINDOW, DEFAULT_MAX_FRAME_SIZE, DEFAULT_SESSION_WINDOW,
};
pub use sasl_profile::SaslProfile;
pub use session::Session;
pub use transport::AsyncIo;

/// Undecoded message bytes moved between the codec boundary and the
/// transport without copying
pub(crate) type Payload = bytes::Bytes;

// The typed performatives, message sections and delivery states users
// interact with come straight from the codec crates.
pub use fe2o3_amqp_types::messaging;
pub use fe2o3_amqp_types::definitions;
