//! SASL frame type and its encoder/decoder
//!
//! SASL frames share the outer length-delimited framing with AMQP frames but
//! carry frame type 0x01 and ignore the channel bytes.

use bytes::{Buf, BufMut, BytesMut};
use fe2o3_amqp_types::sasl::{SaslChallenge, SaslInit, SaslMechanisms, SaslOutcome, SaslResponse};
use serde::{
    de::{self, VariantAccess},
    ser, Deserialize, Serialize,
};
use serde_amqp::read::IoReader;
use tokio_util::codec::{Decoder, Encoder};

use super::{FrameError, FRAME_TYPE_SASL};

/// Body of a SASL frame
#[derive(Debug)]
pub(crate) enum SaslFrame {
    Mechanisms(SaslMechanisms),
    Init(SaslInit),
    Challenge(SaslChallenge),
    Response(SaslResponse),
    Outcome(SaslOutcome),
}

/// Encoder/decoder for [`SaslFrame`]
#[derive(Debug, Default)]
pub(crate) struct SaslFrameCodec {}

impl Encoder<SaslFrame> for SaslFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: SaslFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use serde_amqp::ser::Serializer;

        // No extended header, so doff is 2; bytes 6-7 are ignored and zeroed
        dst.put_u8(0x02);
        dst.put_u8(FRAME_TYPE_SASL);
        dst.put_u16(0x0000);

        let mut serializer = Serializer::from(dst.writer());
        item.serialize(&mut serializer)?;
        Ok(())
    }
}

impl Decoder for SaslFrameCodec {
    type Item = SaslFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        use serde_amqp::de::Deserializer;

        if src.remaining() < 4 {
            return Err(FrameError::MalformedHeader);
        }
        let doff = src.get_u8();
        let ftype = src.get_u8();
        let _ignored = src.get_u16();

        if ftype != FRAME_TYPE_SASL {
            return Err(FrameError::UnsupportedFrameType(ftype));
        }
        if doff != 2 {
            return Err(FrameError::MalformedHeader);
        }

        let reader = IoReader::new(src.reader());
        let mut deserializer = Deserializer::new(reader);
        let frame: SaslFrame = Deserialize::deserialize(&mut deserializer)?;
        Ok(Some(frame))
    }
}

impl ser::Serialize for SaslFrame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            SaslFrame::Mechanisms(value) => value.serialize(serializer),
            SaslFrame::Init(value) => value.serialize(serializer),
            SaslFrame::Challenge(value) => value.serialize(serializer),
            SaslFrame::Response(value) => value.serialize(serializer),
            SaslFrame::Outcome(value) => value.serialize(serializer),
        }
    }
}

// Deserialization keys off the composite descriptor, which serde_amqp
// presents as an enum variant identifier (symbol name or numeric code).

enum Field {
    Mechanisms,
    Init,
    Challenge,
    Response,
    Outcome,
}

struct FieldVisitor {}

impl de::Visitor<'_> for FieldVisitor {
    type Value = Field;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("SASL frame body descriptor")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "amqp:sasl-mechanisms:list" => Ok(Field::Mechanisms),
            "amqp:sasl-init:list" => Ok(Field::Init),
            "amqp:sasl-challenge:list" => Ok(Field::Challenge),
            "amqp:sasl-response:list" => Ok(Field::Response),
            "amqp:sasl-outcome:list" => Ok(Field::Outcome),
            _ => Err(de::Error::custom("unknown SASL frame descriptor name")),
        }
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            0x0000_0000_0000_0040 => Ok(Field::Mechanisms),
            0x0000_0000_0000_0041 => Ok(Field::Init),
            0x0000_0000_0000_0042 => Ok(Field::Challenge),
            0x0000_0000_0000_0043 => Ok(Field::Response),
            0x0000_0000_0000_0044 => Ok(Field::Outcome),
            _ => Err(de::Error::custom("unknown SASL frame descriptor code")),
        }
    }
}

impl<'de> de::Deserialize<'de> for Field {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_identifier(FieldVisitor {})
    }
}

struct Visitor {}

impl<'de> de::Visitor<'de> for Visitor {
    type Value = SaslFrame;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("SASL frame body")
    }

    fn visit_enum<A>(self, data: A) -> Result<Self::Value, A::Error>
    where
        A: de::EnumAccess<'de>,
    {
        let (field, variant) = data.variant()?;
        match field {
            Field::Mechanisms => Ok(SaslFrame::Mechanisms(variant.newtype_variant()?)),
            Field::Init => Ok(SaslFrame::Init(variant.newtype_variant()?)),
            Field::Challenge => Ok(SaslFrame::Challenge(variant.newtype_variant()?)),
            Field::Response => Ok(SaslFrame::Response(variant.newtype_variant()?)),
            Field::Outcome => Ok(SaslFrame::Outcome(variant.newtype_variant()?)),
        }
    }
}

impl<'de> de::Deserialize<'de> for SaslFrame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        const VARIANTS: &[&str] = &[
            "amqp:sasl-mechanisms:list",
            "amqp:sasl-init:list",
            "amqp:sasl-challenge:list",
            "amqp:sasl-response:list",
            "amqp:sasl-outcome:list",
        ];
        deserializer.deserialize_enum("sasl::SaslFrame", VARIANTS, Visitor {})
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use fe2o3_amqp_types::primitives::Symbol;
    use fe2o3_amqp_types::sasl::{SaslCode, SaslMechanisms, SaslOutcome};
    use tokio_util::codec::{Decoder, Encoder};

    use super::{SaslFrame, SaslFrameCodec};

    #[test]
    fn mechanisms_roundtrip() {
        let mechanisms = SaslMechanisms {
            sasl_server_mechanisms: vec![Symbol::from("PLAIN"), Symbol::from("ANONYMOUS")].into(),
        };

        let mut codec = SaslFrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(SaslFrame::Mechanisms(mechanisms), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        match decoded {
            SaslFrame::Mechanisms(m) => {
                assert_eq!(m.sasl_server_mechanisms.len(), 2);
                assert_eq!(m.sasl_server_mechanisms[0], Symbol::from("PLAIN"));
            }
            other => panic!("expected Mechanisms, got {:?}", other),
        }
    }

    #[test]
    fn outcome_roundtrip() {
        let outcome = SaslOutcome {
            code: SaslCode::Auth,
            additional_data: None,
        };

        let mut codec = SaslFrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(SaslFrame::Outcome(outcome), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert!(matches!(
            decoded,
            SaslFrame::Outcome(SaslOutcome {
                code: SaslCode::Auth,
                ..
            })
        ));
    }
}
