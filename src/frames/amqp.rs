//! AMQP frame type and its encoder/decoder

use bytes::{Buf, BufMut, BytesMut};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};
use serde::{Deserialize, Serialize};
use serde_amqp::{de::Deserializer, read::IoReader};
use tokio_util::codec::{Decoder, Encoder};

use crate::Payload;

use super::{FrameError, FRAME_TYPE_AMQP};

/// One AMQP frame: a channel number and a body
#[derive(Debug)]
pub(crate) struct Frame {
    pub channel: u16,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(channel: u16, body: FrameBody) -> Self {
        Self { channel, body }
    }

    /// The empty frame used as a heartbeat
    pub fn empty() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }
}

/// Body of an AMQP frame
///
/// Transfer keeps its payload out of the performative so the undecoded
/// message bytes can be passed along without copying.
#[derive(Debug)]
pub(crate) enum FrameBody {
    Open(Box<Open>),
    Begin(Begin),
    Attach(Box<Attach>),
    Flow(Flow),
    Transfer {
        performative: Transfer,
        payload: Payload,
    },
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
    /// A frame with no body, exchanged only for keep-alive
    Empty,
}

/// Encoder/decoder between [`Frame`] and the bytes inside one
/// length-delimited chunk
#[derive(Debug, Default)]
pub(crate) struct FrameCodec {}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use serde_amqp::ser::Serializer;

        // The extended header is never used, so doff is always 2
        dst.put_u8(2);
        dst.put_u8(FRAME_TYPE_AMQP);
        dst.put_u16(item.channel);

        let mut serializer = Serializer::from(dst.writer());
        match item.body {
            FrameBody::Open(performative) => performative.serialize(&mut serializer)?,
            FrameBody::Begin(performative) => performative.serialize(&mut serializer)?,
            FrameBody::Attach(performative) => performative.serialize(&mut serializer)?,
            FrameBody::Flow(performative) => performative.serialize(&mut serializer)?,
            FrameBody::Transfer {
                performative,
                payload,
            } => {
                performative.serialize(&mut serializer)?;
                dst.put(payload);
            }
            FrameBody::Disposition(performative) => performative.serialize(&mut serializer)?,
            FrameBody::Detach(performative) => performative.serialize(&mut serializer)?,
            FrameBody::End(performative) => performative.serialize(&mut serializer)?,
            FrameBody::Close(performative) => performative.serialize(&mut serializer)?,
            FrameBody::Empty => {}
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.remaining() < 4 {
            return Err(FrameError::MalformedHeader);
        }
        let doff = src.get_u8();
        let ftype = src.get_u8();
        let channel = src.get_u16();

        if ftype != FRAME_TYPE_AMQP {
            return Err(FrameError::UnsupportedFrameType(ftype));
        }
        if doff != 2 {
            return Err(FrameError::MalformedHeader);
        }

        if src.is_empty() {
            return Ok(Some(Frame::new(channel, FrameBody::Empty)));
        }

        let reader = IoReader::new(src.reader());
        let mut deserializer = Deserializer::new(reader);
        let performative: Performative = Deserialize::deserialize(&mut deserializer)?;

        let body = match performative {
            Performative::Open(p) => FrameBody::Open(Box::new(p)),
            Performative::Begin(p) => FrameBody::Begin(p),
            Performative::Attach(p) => FrameBody::Attach(Box::new(p)),
            Performative::Flow(p) => FrameBody::Flow(p),
            Performative::Transfer(p) => FrameBody::Transfer {
                performative: p,
                // Whatever follows the performative is the (partial) message
                payload: src.split().freeze(),
            },
            Performative::Disposition(p) => FrameBody::Disposition(p),
            Performative::Detach(p) => FrameBody::Detach(p),
            Performative::End(p) => FrameBody::End(p),
            Performative::Close(p) => FrameBody::Close(p),
        };

        Ok(Some(Frame::new(channel, body)))
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use fe2o3_amqp_types::performatives::{Begin, Flow, Open, Transfer};
    use tokio_util::codec::{Decoder, Encoder};

    use super::{Frame, FrameBody, FrameCodec};

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn open_roundtrip() {
        let open = Open {
            container_id: "client-1".into(),
            hostname: Some("localhost".into()),
            max_frame_size: 4096.into(),
            channel_max: 15.into(),
            idle_time_out: Some(30_000),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };

        let decoded = roundtrip(Frame::new(0, FrameBody::Open(Box::new(open))));
        match decoded.body {
            FrameBody::Open(open) => {
                assert_eq!(open.container_id, "client-1");
                assert_eq!(open.max_frame_size.0, 4096);
                assert_eq!(open.idle_time_out, Some(30_000));
            }
            other => panic!("expected Open, got {:?}", other),
        }
    }

    #[test]
    fn begin_roundtrip_preserves_channel() {
        let begin = Begin {
            remote_channel: None,
            next_outgoing_id: 0,
            incoming_window: 100,
            outgoing_window: 100,
            handle_max: 7u32.into(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };

        let decoded = roundtrip(Frame::new(5, FrameBody::Begin(begin)));
        assert_eq!(decoded.channel, 5);
        match decoded.body {
            FrameBody::Begin(begin) => assert_eq!(begin.incoming_window, 100),
            other => panic!("expected Begin, got {:?}", other),
        }
    }

    #[test]
    fn flow_roundtrip() {
        let flow = Flow {
            next_incoming_id: Some(1),
            incoming_window: 50,
            next_outgoing_id: 2,
            outgoing_window: 50,
            handle: Some(0u32.into()),
            delivery_count: Some(0),
            link_credit: Some(10),
            available: None,
            drain: true,
            echo: false,
            properties: None,
        };

        let decoded = roundtrip(Frame::new(1, FrameBody::Flow(flow)));
        match decoded.body {
            FrameBody::Flow(flow) => {
                assert_eq!(flow.link_credit, Some(10));
                assert!(flow.drain);
            }
            other => panic!("expected Flow, got {:?}", other),
        }
    }

    #[test]
    fn transfer_payload_survives_unchanged() {
        let transfer = Transfer {
            handle: 0u32.into(),
            delivery_id: Some(0),
            delivery_tag: Some(vec![0, 0, 0, 0, 0, 0, 0, 1].into()),
            message_format: Some(0),
            settled: Some(false),
            more: true,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        };
        let payload = Bytes::from_static(b"partial message bytes");

        let decoded = roundtrip(Frame::new(2, FrameBody::Transfer {
            performative: transfer,
            payload: payload.clone(),
        }));
        match decoded.body {
            FrameBody::Transfer {
                performative,
                payload: decoded_payload,
            } => {
                assert!(performative.more);
                assert_eq!(decoded_payload, payload);
            }
            other => panic!("expected Transfer, got {:?}", other),
        }
    }

    #[test]
    fn empty_frame_roundtrip() {
        let decoded = roundtrip(Frame::empty());
        assert!(matches!(decoded.body, FrameBody::Empty));
    }
}
