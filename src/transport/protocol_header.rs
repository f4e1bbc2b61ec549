//! The 8-byte protocol header exchanged before any frame

const PREFIX: &[u8; 4] = b"AMQP";

/// Protocol layer announced by a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolId {
    Amqp = 0x0,
    Tls = 0x2,
    Sasl = 0x3,
}

impl TryFrom<u8> for ProtocolId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Amqp),
            0x2 => Ok(Self::Tls),
            0x3 => Ok(Self::Sasl),
            other => Err(other),
        }
    }
}

/// `"AMQP" id major minor revision`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProtocolHeader {
    pub id: ProtocolId,
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl Default for ProtocolHeader {
    fn default() -> Self {
        Self {
            id: ProtocolId::Amqp,
            major: fe2o3_amqp_types::definitions::MAJOR,
            minor: fe2o3_amqp_types::definitions::MINOR,
            revision: fe2o3_amqp_types::definitions::REVISION,
        }
    }
}

impl ProtocolHeader {
    pub fn amqp() -> Self {
        Self::default()
    }

    pub fn sasl() -> Self {
        Self {
            id: ProtocolId::Sasl,
            ..Default::default()
        }
    }
}

impl From<ProtocolHeader> for [u8; 8] {
    fn from(value: ProtocolHeader) -> Self {
        [
            PREFIX[0],
            PREFIX[1],
            PREFIX[2],
            PREFIX[3],
            value.id as u8,
            value.major,
            value.minor,
            value.revision,
        ]
    }
}

impl TryFrom<[u8; 8]> for ProtocolHeader {
    type Error = [u8; 8];

    fn try_from(v: [u8; 8]) -> Result<Self, Self::Error> {
        if &v[..4] != PREFIX {
            return Err(v);
        }
        let id = ProtocolId::try_from(v[4]).map_err(|_| v)?;
        Ok(Self {
            id,
            major: v[5],
            minor: v[6],
            revision: v[7],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amqp_header_bytes() {
        let bytes: [u8; 8] = ProtocolHeader::amqp().into();
        assert_eq!(bytes, [b'A', b'M', b'Q', b'P', 0x00, 1, 0, 0]);
    }

    #[test]
    fn sasl_header_roundtrip() {
        let bytes: [u8; 8] = ProtocolHeader::sasl().into();
        assert_eq!(bytes[4], 0x03);
        let parsed = ProtocolHeader::try_from(bytes).unwrap();
        assert_eq!(parsed, ProtocolHeader::sasl());
    }

    #[test]
    fn garbage_is_rejected() {
        let bytes = *b"HTTP/1.1";
        assert!(ProtocolHeader::try_from(bytes).is_err());
    }
}
