//! The container: process-level root of the client object model

use crate::connection::Connection;
use crate::error::Error;
use crate::options::ConnectionOptions;
use crate::transport::AsyncIo;

/// A messaging container
///
/// The container id is stable across every connection it opens, which is
/// what lets a broker correlate them. Containers are cheap; they hold no
/// background state.
///
/// ```rust,ignore
/// let container = Container::new("billing-service");
/// let connection = container
///     .connect("broker.example.com", 5672, ConnectionOptions::default())
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Container {
    id: String,
}

impl Container {
    /// Creates a container with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// The container id carried in every Open this container sends
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connects to `host:port` over TCP (or TLS when configured) and
    /// completes the open handshake
    pub async fn connect(
        &self,
        host: impl Into<String>,
        port: u16,
        options: ConnectionOptions,
    ) -> Result<Connection, Error> {
        let host = host.into();
        Connection::establish(self.id.clone(), &host, port, options, None).await
    }

    /// Connects over a caller-supplied byte stream (a WebSocket adapter,
    /// an in-memory pipe). Reconnection is unavailable: the stream cannot
    /// be re-dialed.
    pub async fn connect_with_stream(
        &self,
        stream: impl AsyncIo + 'static,
        host: impl Into<String>,
        port: u16,
        options: ConnectionOptions,
    ) -> Result<Connection, Error> {
        let host = host.into();
        Connection::establish(self.id.clone(), &host, port, options, Some(Box::new(stream)))
            .await
    }
}

impl Default for Container {
    fn default() -> Self {
        Self {
            id: format!("siderite-{}", crate::util::next_connection_seq()),
        }
    }
}
