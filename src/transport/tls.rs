//! TLS layering over a dialed TCP stream

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::error::Error;
use crate::transport::IoStream;

/// Wraps `stream` in a client-side TLS session for `domain`
pub(crate) async fn connect(
    stream: TcpStream,
    domain: &str,
    config: Arc<ClientConfig>,
) -> Result<IoStream, Error> {
    let connector = TlsConnector::from(config);
    let server_name = ServerName::try_from(domain.to_string()).map_err(|_| Error::Security {
        message: format!("invalid TLS server name {:?}", domain),
    })?;
    let tls_stream = connector.connect(server_name, stream).await?;
    Ok(Box::new(tls_stream))
}
