//! In-process scripted AMQP peer used by the integration tests
//!
//! Speaks raw frames over loopback TCP so every test is hermetic. The peer
//! is deliberately dumb: each helper reads or writes exactly the frames the
//! calling test script expects, panicking loudly on anything else.

#![allow(dead_code)]

use bytes::Bytes;
use fe2o3_amqp_types::definitions::{self, Role};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Close, Disposition, Flow, Open, Performative,
};
use fe2o3_amqp_types::primitives::Symbol;
use fe2o3_amqp_types::sasl::{SaslCode, SaslMechanisms, SaslOutcome};
use serde::Deserialize;
use serde_amqp::{de::Deserializer, read::IoReader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const AMQP_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', 0x00, 1, 0, 0];
pub const SASL_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', 0x03, 1, 0, 0];

/// Address carried by an Attach's target, if any.
///
/// Reads the terminus at the wire level so the helper does not care how the
/// client library represents it in memory.
pub fn target_address(attach: &Attach) -> Option<String> {
    let bytes = serde_amqp::to_vec(&attach.target).expect("target must encode");
    let target: Option<fe2o3_amqp_types::messaging::Target> =
        serde_amqp::from_slice(&bytes).expect("target must decode");
    target.and_then(|target| target.address)
}

pub struct TestPeer {
    listener: TcpListener,
}

impl TestPeer {
    pub async fn bind() -> (Self, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (Self { listener }, port)
    }

    pub async fn accept(&self) -> PeerConnection {
        let (stream, _) = self.listener.accept().await.unwrap();
        stream.set_nodelay(true).unwrap();
        PeerConnection { stream }
    }
}

/// One frame as the peer sees it
#[derive(Debug)]
pub enum PeerFrame {
    Empty,
    Amqp {
        channel: u16,
        performative: Performative,
        payload: Bytes,
    },
}

pub struct PeerConnection {
    stream: TcpStream,
}

impl PeerConnection {
    /// Reads the client's AMQP header and echoes it
    pub async fn exchange_amqp_header(&mut self) {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header, AMQP_HEADER, "client did not send the AMQP header");
        self.stream.write_all(&AMQP_HEADER).await.unwrap();
    }

    /// Runs the server side of a SASL exchange offering `mechanisms`,
    /// answering the client's Init with `code`. Returns the Init's initial
    /// response bytes.
    pub async fn exchange_sasl(
        &mut self,
        mechanisms: &[&str],
        code: SaslCode,
    ) -> (String, Option<Vec<u8>>) {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header, SASL_HEADER, "client did not send the SASL header");
        self.stream.write_all(&SASL_HEADER).await.unwrap();

        let offer = SaslMechanisms {
            sasl_server_mechanisms: mechanisms
                .iter()
                .map(|m| Symbol::from(*m))
                .collect::<Vec<_>>()
                .into(),
        };
        self.send_sasl_body(&serde_amqp::to_vec(&offer).unwrap()).await;

        let body = self.read_raw_frame(0x01).await;
        let mut cursor = std::io::Cursor::new(&body[..]);
        let reader = IoReader::new(&mut cursor);
        let mut deserializer = Deserializer::new(reader);
        let init = fe2o3_amqp_types::sasl::SaslInit::deserialize(&mut deserializer).unwrap();

        let outcome = SaslOutcome {
            code,
            additional_data: None,
        };
        self.send_sasl_body(&serde_amqp::to_vec(&outcome).unwrap()).await;

        (
            init.mechanism.as_str().to_string(),
            init.initial_response.map(|binary| binary.to_vec()),
        )
    }

    async fn send_sasl_body(&mut self, body: &[u8]) {
        let size = (body.len() + 8) as u32;
        let mut frame = Vec::with_capacity(size as usize);
        frame.extend_from_slice(&size.to_be_bytes());
        frame.extend_from_slice(&[0x02, 0x01, 0x00, 0x00]);
        frame.extend_from_slice(body);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Reads one length-delimited frame of the given type byte, returning
    /// the bytes after the 4-byte frame header
    async fn read_raw_frame(&mut self, frame_type: u8) -> Vec<u8> {
        let size = self.stream.read_u32().await.unwrap() as usize;
        assert!(size >= 8, "frame too small: {}", size);
        let mut rest = vec![0u8; size - 4];
        self.stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest[0], 0x02, "unexpected doff");
        assert_eq!(rest[1], frame_type, "unexpected frame type");
        rest.split_off(4)
    }

    /// Reads one AMQP frame
    pub async fn read_frame(&mut self) -> PeerFrame {
        let size = self.stream.read_u32().await.unwrap() as usize;
        assert!(size >= 8, "frame too small: {}", size);
        let mut rest = vec![0u8; size - 4];
        self.stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest[1], 0x00, "expected an AMQP frame");
        let channel = u16::from_be_bytes([rest[2], rest[3]]);
        let body = rest.split_off(4);

        if body.is_empty() {
            return PeerFrame::Empty;
        }

        let mut cursor = std::io::Cursor::new(&body[..]);
        let reader = IoReader::new(&mut cursor);
        let mut deserializer = Deserializer::new(reader);
        let performative = Performative::deserialize(&mut deserializer).unwrap();
        let consumed = cursor.position() as usize;
        let payload = Bytes::copy_from_slice(&body[consumed..]);

        PeerFrame::Amqp {
            channel,
            performative,
            payload,
        }
    }

    /// Reads frames until one carries a performative, skipping heartbeats
    pub async fn read_performative(&mut self) -> (u16, Performative, Bytes) {
        loop {
            match self.read_frame().await {
                PeerFrame::Empty => continue,
                PeerFrame::Amqp {
                    channel,
                    performative,
                    payload,
                } => return (channel, performative, payload),
            }
        }
    }

    /// Writes one AMQP frame
    pub async fn send_performative(&mut self, channel: u16, performative: Performative) {
        self.send_with_payload(channel, performative, &[]).await;
    }

    pub async fn send_with_payload(
        &mut self,
        channel: u16,
        performative: Performative,
        payload: &[u8],
    ) {
        let body = serde_amqp::to_vec(&performative).unwrap();
        let size = (body.len() + payload.len() + 8) as u32;
        let mut frame = Vec::with_capacity(size as usize);
        frame.extend_from_slice(&size.to_be_bytes());
        frame.push(0x02);
        frame.push(0x00);
        frame.extend_from_slice(&channel.to_be_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn send_empty_frame(&mut self) {
        let mut frame = Vec::with_capacity(8);
        frame.extend_from_slice(&8u32.to_be_bytes());
        frame.extend_from_slice(&[0x02, 0x00, 0x00, 0x00]);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Drops the TCP stream, simulating a peer crash
    pub fn drop_connection(self) {}

    /* --------------------------- scripted helpers --------------------------- */

    /// Answers the client's Open with one offering `capabilities`
    pub async fn expect_open_and_respond(&mut self, capabilities: &[&str]) -> Open {
        let (_, performative, _) = self.read_performative().await;
        let client_open = match performative {
            Performative::Open(open) => open,
            other => panic!("expected Open, got {:?}", other),
        };

        let offered = match capabilities.is_empty() {
            true => None,
            false => Some(
                capabilities
                    .iter()
                    .map(|c| Symbol::from(*c))
                    .collect::<Vec<_>>()
                    .into(),
            ),
        };
        self.send_performative(
            0,
            Performative::Open(Open {
                container_id: "test-peer".to_string(),
                hostname: None,
                max_frame_size: 65_536.into(),
                channel_max: 255.into(),
                idle_time_out: None,
                outgoing_locales: None,
                incoming_locales: None,
                offered_capabilities: offered,
                desired_capabilities: None,
                properties: None,
            }),
        )
        .await;
        client_open
    }

    /// Answers the client's Begin, binding the peer side to `channel`
    pub async fn expect_begin_and_respond(&mut self) -> u16 {
        let (channel, performative, _) = self.read_performative().await;
        match performative {
            Performative::Begin(_) => {}
            other => panic!("expected Begin, got {:?}", other),
        }
        self.send_performative(
            channel,
            Performative::Begin(Begin {
                remote_channel: Some(channel),
                next_outgoing_id: 0,
                incoming_window: 5_000,
                outgoing_window: 5_000,
                handle_max: u32::MAX.into(),
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
            }),
        )
        .await;
        channel
    }

    /// Answers the client's Attach with a role-reversed echo. Returns the
    /// client's Attach.
    pub async fn expect_attach_and_respond(&mut self) -> (u16, Attach) {
        let (channel, performative, _) = self.read_performative().await;
        let client_attach = match performative {
            Performative::Attach(attach) => attach,
            other => panic!("expected Attach, got {:?}", other),
        };

        let echo_role = match client_attach.role {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        };
        let mut echo = client_attach.clone();
        echo.handle = 0u32.into();
        echo.initial_delivery_count = match echo_role {
            Role::Sender => Some(0),
            Role::Receiver => None,
        };
        echo.role = echo_role;
        self.send_performative(channel, Performative::Attach(echo)).await;
        (channel, client_attach)
    }

    /// Grants link credit to the client's sender (peer acting as receiver)
    pub async fn grant_credit(&mut self, channel: u16, credit: u32) {
        self.send_performative(
            channel,
            Performative::Flow(Flow {
                next_incoming_id: Some(0),
                incoming_window: 5_000,
                next_outgoing_id: 0,
                outgoing_window: 5_000,
                handle: Some(0u32.into()),
                delivery_count: Some(0),
                link_credit: Some(credit),
                available: None,
                drain: false,
                echo: false,
                properties: None,
            }),
        )
        .await;
    }

    /// Settles a delivery range with the given outcome
    pub async fn settle(
        &mut self,
        channel: u16,
        first: u32,
        state: fe2o3_amqp_types::messaging::DeliveryState,
    ) {
        self.send_performative(
            channel,
            Performative::Disposition(Disposition {
                role: Role::Receiver,
                first,
                last: None,
                settled: true,
                state: Some(state),
                batchable: false,
            }),
        )
        .await;
    }

    /// Completes the close handshake from the peer side
    pub async fn expect_close_and_respond(&mut self) {
        loop {
            match self.read_frame().await {
                PeerFrame::Empty => continue,
                PeerFrame::Amqp {
                    performative: Performative::Close(_),
                    ..
                } => break,
                // The client may flush End frames for its sessions first
                PeerFrame::Amqp {
                    performative: Performative::End(_),
                    ..
                } => continue,
                PeerFrame::Amqp {
                    performative: Performative::Detach(_),
                    ..
                } => continue,
                other => panic!("expected Close, got {:?}", other),
            }
        }
        self.send_performative(0, Performative::Close(Close { error: None })).await;
    }

    /// Rejects the open handshake: Open answered, then Close with `error`
    pub async fn reject_open(&mut self, error: definitions::Error) {
        self.expect_open_and_respond(&[]).await;
        self.send_performative(0, Performative::Close(Close { error: Some(error) }))
            .await;
    }
}
