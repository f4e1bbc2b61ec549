//! Byte-pipe adapter: framing, header negotiation, SASL layer, idle timeout
//!
//! Two-layer framing: a [`LengthDelimitedCodec`] owns the 4-byte size prefix
//! and re-slicing of partial reads; the inner [`FrameCodec`] maps one
//! complete chunk to one typed [`Frame`]. The transport works over any
//! `AsyncRead + AsyncWrite` stream, which is how TCP, TLS and
//! WebSocket-style byte pipes are all served by the same code.

pub(crate) mod protocol_header;

#[cfg(feature = "rustls")]
pub(crate) mod tls;

use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Future, Sink, SinkExt, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use fe2o3_amqp_types::definitions::{AmqpError, MIN_MAX_FRAME_SIZE};

use crate::error::Error;
use crate::frames::amqp::FrameCodec;
use crate::frames::sasl::SaslFrameCodec;
use crate::frames::{Frame, SaslFrame};
use crate::sasl_profile::{map_outcome, Negotiation, SaslProfile};
use crate::util::IdleTimeout;

use protocol_header::ProtocolHeader;

/// Boxed byte stream the engine reads and writes.
///
/// The engine re-dials on reconnect, so it cannot be generic over one
/// concrete stream type; every dialed stream is boxed behind this alias.
pub(crate) type IoStream = Box<dyn AsyncIo>;

/// Object-safe supertrait for boxed transports
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

fn length_delimited(max_frame_size: usize) -> tokio_util::codec::length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .big_endian()
        .length_field_length(4)
        .max_frame_length(max_frame_size)
        // the length field counts itself
        .length_adjustment(-4);
    builder
}

pin_project! {
    /// Framed AMQP transport over a byte stream
    pub(crate) struct Transport {
        #[pin]
        framed: Framed<IoStream, LengthDelimitedCodec>,
        #[pin]
        idle_timeout: Option<IdleTimeout>,
    }
}

impl Transport {
    /// Wraps a negotiated stream.
    ///
    /// `idle_timeout` is the local limit on remote silence; `None` or zero
    /// disables enforcement.
    pub fn bind(io: IoStream, max_frame_size: usize, idle_timeout: Option<Duration>) -> Self {
        let framed = length_delimited(max_frame_size).new_framed(io);
        let idle_timeout = idle_timeout
            .filter(|duration| !duration.is_zero())
            .map(IdleTimeout::new);
        Self {
            framed,
            idle_timeout,
        }
    }

    /// Renegotiates the maximum frame length after the Open exchange
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) -> &mut Self {
        self.framed.codec_mut().set_max_frame_length(max_frame_size);
        self
    }

    /// Installs or replaces the remote-silence limit
    pub fn set_idle_timeout(&mut self, duration: Duration) -> &mut Self {
        self.idle_timeout = match duration.is_zero() {
            true => None,
            false => Some(IdleTimeout::new(duration)),
        };
        self
    }

    /// Exchanges AMQP protocol headers on a raw stream
    pub async fn negotiate(io: &mut IoStream, proposed: ProtocolHeader) -> Result<ProtocolHeader, Error> {
        let outgoing: [u8; 8] = proposed.into();
        io.write_all(&outgoing).await?;
        io.flush().await?;

        let mut incoming = [0u8; 8];
        io.read_exact(&mut incoming).await?;
        let header = ProtocolHeader::try_from(incoming).map_err(|bytes| {
            Error::protocol(
                AmqpError::NotImplemented,
                format!("unexpected protocol header {:?}", bytes),
            )
        })?;
        if header != proposed {
            return Err(Error::protocol(
                AmqpError::NotImplemented,
                format!("protocol header mismatch: {:?}", header),
            ));
        }
        Ok(header)
    }

    /// Runs the SASL layer on a raw stream, consuming it and handing the
    /// stream back once the outcome is OK.
    ///
    /// States: expect mechanisms, send init, expect outcome. Challenges are
    /// rejected by the profile since neither ANONYMOUS nor PLAIN uses them.
    pub async fn connect_sasl(
        mut io: IoStream,
        hostname: Option<&str>,
        mut profile: SaslProfile,
    ) -> Result<IoStream, Error> {
        Self::negotiate(&mut io, ProtocolHeader::sasl()).await?;

        loop {
            let frame = read_sasl_frame(&mut io).await?;
            match profile.on_frame(frame, hostname)? {
                Negotiation::Init(init) => {
                    write_sasl_frame(&mut io, SaslFrame::Init(init)).await?;
                }
                Negotiation::Outcome(outcome) => {
                    map_outcome(outcome)?;
                    return Ok(io);
                }
            }
        }
    }
}

/// Reads one length-delimited SASL frame directly off the stream.
///
/// Done with explicit reads rather than a `Framed` so that no read-ahead
/// bytes are buffered away from the AMQP layer that follows.
async fn read_sasl_frame(io: &mut IoStream) -> Result<SaslFrame, Error> {
    let size = io.read_u32().await? as usize;
    if size < 8 || size > MIN_MAX_FRAME_SIZE {
        return Err(Error::protocol(
            AmqpError::FrameSizeTooSmall,
            format!("SASL frame size {} out of bounds", size),
        ));
    }
    let mut buf = BytesMut::zeroed(size - 4);
    io.read_exact(&mut buf).await?;

    let mut codec = SaslFrameCodec::default();
    codec
        .decode(&mut buf)?
        .ok_or_else(|| Error::protocol(AmqpError::DecodeError, "truncated SASL frame"))
}

async fn write_sasl_frame(io: &mut IoStream, frame: SaslFrame) -> Result<(), Error> {
    let mut codec = SaslFrameCodec::default();
    let mut body = BytesMut::new();
    codec.encode(frame, &mut body)?;

    let mut buf = BytesMut::with_capacity(body.len() + 4);
    bytes::BufMut::put_u32(&mut buf, (body.len() + 4) as u32);
    buf.extend_from_slice(&body);
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

impl Sink<Frame> for Transport {
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        let mut buf = BytesMut::new();
        let mut encoder = FrameCodec::default();
        encoder.encode(item, &mut buf).map_err(Error::from)?;

        let this = self.project();
        this.framed
            .start_send(Bytes::from(buf))
            .map_err(Into::into)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_close(cx).map_err(Into::into)
    }
}

impl Stream for Transport {
    type Item = Result<Frame, Error>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed.poll_next(cx) {
            Poll::Ready(next) => {
                // Any traffic from the peer counts against its idle timeout
                if let Some(mut timeout) = this.idle_timeout.as_pin_mut() {
                    timeout.reset();
                }

                match next {
                    Some(Ok(mut chunk)) => {
                        let mut decoder = FrameCodec::default();
                        Poll::Ready(
                            decoder
                                .decode(&mut chunk)
                                .map_err(Error::from)
                                .transpose(),
                        )
                    }
                    Some(Err(err)) => Poll::Ready(Some(Err(err.into()))),
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => {
                if let Some(timeout) = this.idle_timeout.as_pin_mut() {
                    if timeout.poll(cx).is_ready() {
                        // The peer has been silent past its advertised limit
                        return Poll::Ready(Some(Err(Error::protocol(
                            AmqpError::ResourceLimitExceeded,
                            "remote idle timeout expired",
                        ))));
                    }
                }
                Poll::Pending
            }
        }
    }
}

/// Convenience wrappers used by the engine when sending several frames in
/// one event-loop turn: feed every frame, flush once.
impl Transport {
    pub async fn feed_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.feed(frame).await
    }

    pub async fn flush_frames(&mut self) -> Result<(), Error> {
        SinkExt::<Frame>::flush(self).await
    }

    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        self.send(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FrameBody;
    use futures_util::StreamExt;

    fn boxed(io: impl AsyncIo + 'static) -> IoStream {
        Box::new(io)
    }

    #[tokio::test]
    async fn header_negotiation_succeeds_on_echo() {
        let mock = tokio_test::io::Builder::new()
            .write(b"AMQP\x00\x01\x00\x00")
            .read(b"AMQP\x00\x01\x00\x00")
            .build();
        let mut io = boxed(mock);
        Transport::negotiate(&mut io, ProtocolHeader::amqp())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn header_negotiation_rejects_mismatch() {
        let mock = tokio_test::io::Builder::new()
            .write(b"AMQP\x00\x01\x00\x00")
            .read(b"AMQP\x03\x01\x00\x00")
            .build();
        let mut io = boxed(mock);
        let result = Transport::negotiate(&mut io, ProtocolHeader::amqp()).await;
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[tokio::test]
    async fn empty_frame_on_the_wire() {
        let mock = tokio_test::io::Builder::new()
            .write(&[0x00, 0x00, 0x00, 0x08])
            .write(&[0x02, 0x00, 0x00, 0x00])
            .build();
        let mut transport = Transport::bind(boxed(mock), MIN_MAX_FRAME_SIZE, None);
        transport.send_frame(Frame::empty()).await.unwrap();
    }

    #[tokio::test]
    async fn decodes_incoming_empty_frame() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0x00, 0x00, 0x00, 0x08, 0x02, 0x00, 0x00, 0x00])
            .build();
        let mut transport = Transport::bind(boxed(mock), MIN_MAX_FRAME_SIZE, None);
        let frame = transport.next().await.unwrap().unwrap();
        assert!(matches!(frame.body, FrameBody::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_trips_idle_timeout() {
        // A mock with a pending read: the peer never speaks
        let mock = tokio_test::io::Builder::new()
            .wait(Duration::from_secs(60))
            .build();
        let mut transport = Transport::bind(
            boxed(mock),
            MIN_MAX_FRAME_SIZE,
            Some(Duration::from_millis(100)),
        );

        let result = tokio::time::timeout(Duration::from_secs(1), transport.next())
            .await
            .expect("idle timeout should fire before the wait elapses");
        match result {
            Some(Err(Error::Protocol { condition, .. })) => {
                assert_eq!(
                    condition,
                    fe2o3_amqp_types::definitions::ErrorCondition::AmqpError(
                        AmqpError::ResourceLimitExceeded
                    )
                );
            }
            other => panic!("expected idle timeout error, got {:?}", other),
        }
    }
}
