//! Frame codecs for the AMQP and SASL layers
//!
//! Frames are length-delimited on the wire; the outer
//! [`LengthDelimitedCodec`](tokio_util::codec::LengthDelimitedCodec) owned by
//! the transport strips the 4-byte size prefix, so the codecs here see one
//! complete frame per buffer: a 4-byte header (doff, type, channel) followed
//! by an optional performative and payload. Everything below the performative
//! level is delegated to `serde_amqp`.

pub(crate) mod amqp;
pub(crate) mod sasl;

pub(crate) use amqp::{Frame, FrameBody};
pub(crate) use sasl::SaslFrame;

/// Frame type byte for AMQP frames
pub(crate) const FRAME_TYPE_AMQP: u8 = 0x00;

/// Frame type byte for SASL frames
pub(crate) const FRAME_TYPE_SASL: u8 = 0x01;

/// Errors raised while encoding or decoding a single frame
#[derive(Debug, thiserror::Error)]
pub(crate) enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_amqp::Error),

    #[error("unsupported frame type 0x{0:02x}")]
    UnsupportedFrameType(u8),

    #[error("malformed frame header")]
    MalformedHeader,
}

impl From<FrameError> for crate::error::Error {
    fn from(err: FrameError) -> Self {
        use fe2o3_amqp_types::definitions::ConnectionError;
        match err {
            FrameError::Io(err) => err.into(),
            FrameError::Codec(err) => err.into(),
            FrameError::UnsupportedFrameType(_) | FrameError::MalformedHeader => {
                crate::error::Error::protocol(ConnectionError::FramingError, err.to_string())
            }
        }
    }
}
