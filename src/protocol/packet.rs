//! Packet framing and serialization.
//!
//! Defines the booster wire envelope and a [`tokio_util::codec`] adapter that
//! buffers partial reads until a whole packet is available.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use super::{
    Encoding, Header, Message, ModuleId, MODULE_CLOSING_TAG, MODULE_OPENING_TAG,
    PACKET_CLOSING_TAG, PACKET_OPENING_TAG, SEPARATOR,
};
use crate::error::{Error, Result};

/// Largest accepted module body.
pub const MAX_MODULE_SIZE: usize = 4 * 1024 * 1024;

/// Bytes preceding a module body: '[' + id(2) + ':' + enc(1) + len(4).
const MODULE_PREFIX_SIZE: usize = 9;

/// A named section of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Module identifier
    pub id: ModuleId,
    /// Encoding of `body`
    pub encoding: Encoding,
    /// Serialized typed value
    pub body: Bytes,
}

impl Module {
    /// Serialize `value` into a new module.
    pub fn new<T: Serialize>(id: ModuleId, value: &T, encoding: Encoding) -> Result<Self> {
        Ok(Self {
            id,
            encoding,
            body: Bytes::from(encoding.encode(value)?),
        })
    }

    /// Deserialize the module body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.encoding.decode(&self.body)
    }

    fn wire_size(&self) -> usize {
        MODULE_PREFIX_SIZE + self.body.len() + 1
    }
}

/// A booster protocol packet.
///
/// Modules are kept ordered by identifier so the header is always written
/// first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    modules: BTreeMap<ModuleId, Module>,
}

impl Packet {
    /// Create an empty packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a packet holding only a header.
    pub fn with_header(header: &Header, encoding: Encoding) -> Result<Self> {
        let mut p = Self::new();
        p.add_module(ModuleId::Header, header, encoding)?;
        Ok(p)
    }

    /// Create a packet holding a header and a payload.
    pub fn compose<T: Serialize>(header: &Header, payload: &T, encoding: Encoding) -> Result<Self> {
        let mut p = Self::with_header(header, encoding)?;
        p.add_module(ModuleId::Payload, payload, encoding)?;
        Ok(p)
    }

    /// Serialize `value` and add it as module `id`.
    ///
    /// Fails if the packet already holds a module with that identifier.
    pub fn add_module<T: Serialize>(
        &mut self,
        id: ModuleId,
        value: &T,
        encoding: Encoding,
    ) -> Result<&Module> {
        if self.modules.contains_key(&id) {
            return Err(Error::InvalidMessage(format!("module {:?} already present", id)));
        }
        let module = Module::new(id, value, encoding)?;
        Ok(self.modules.entry(id).or_insert(module))
    }

    /// Get a module by identifier.
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(&id)
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// True if the packet has no modules.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Decode the header module.
    pub fn header(&self) -> Result<Header> {
        self.module(ModuleId::Header)
            .ok_or_else(|| Error::malformed("missing header module"))?
            .decode()
    }

    /// Message kind, read from the header.
    pub fn message(&self) -> Result<Message> {
        Ok(self.header()?.message)
    }

    /// Decode the payload module.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        self.module(ModuleId::Payload)
            .ok_or_else(|| Error::InvalidMessage("missing payload module".into()))?
            .decode()
    }

    /// Get the total wire size of this packet.
    pub fn wire_size(&self) -> usize {
        2 + self.modules.values().map(Module::wire_size).sum::<usize>()
    }

    /// Serialize the packet to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the wire form of the packet to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_size());
        buf.put_u8(PACKET_OPENING_TAG);
        for module in self.modules.values() {
            buf.put_u8(MODULE_OPENING_TAG);
            buf.put_slice(module.id.as_bytes());
            buf.put_u8(SEPARATOR);
            buf.put_u8(module.encoding as u8);
            buf.put_u32(module.body.len() as u32);
            buf.put_slice(&module.body);
            buf.put_u8(MODULE_CLOSING_TAG);
        }
        buf.put_u8(PACKET_CLOSING_TAG);
    }

    /// Deserialize a packet from the front of `data`.
    ///
    /// Returns the packet and the number of bytes consumed. A truncated
    /// packet is reported as [`Error::MalformedPacket`]; stream readers should
    /// go through [`PacketCodec`] which waits for more bytes instead.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        match frame_len(data)? {
            Some(n) => Ok((Self::decode_frame(&data[..n])?, n)),
            None => Err(Error::malformed(format!(
                "truncated packet: {} bytes",
                data.len()
            ))),
        }
    }

    /// Decode a buffer already known to hold exactly one well-framed packet.
    fn decode_frame(frame: &[u8]) -> Result<Self> {
        let mut data = &frame[1..frame.len() - 1];
        let mut packet = Self::new();

        while data.has_remaining() {
            data.advance(1); // opening tag
            let id = ModuleId::from_bytes(&data[..2])?;
            data.advance(3); // id + separator
            let encoding = Encoding::try_from(data.get_u8())?;
            let len = data.get_u32() as usize;
            let body = Bytes::copy_from_slice(&data[..len]);
            data.advance(len + 1); // body + closing tag

            if packet.modules.contains_key(&id) {
                return Err(Error::malformed(format!("duplicate module {:?}", id)));
            }
            packet.modules.insert(id, Module { id, encoding, body });
        }

        Ok(packet)
    }
}

/// Scan `buf` for one complete packet without decoding module bodies.
///
/// Returns `Ok(None)` while the packet is incomplete, the frame length once
/// the closing tag is found, and an error as soon as the bytes seen so far
/// cannot be a packet.
fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != PACKET_OPENING_TAG {
        return Err(Error::malformed(format!(
            "expected packet opening tag, got 0x{:02x}",
            buf[0]
        )));
    }

    let mut pos = 1;
    loop {
        let Some(&tag) = buf.get(pos) else {
            return Ok(None);
        };
        match tag {
            PACKET_CLOSING_TAG => return Ok(Some(pos + 1)),
            MODULE_OPENING_TAG => {}
            other => {
                return Err(Error::malformed(format!(
                    "unbalanced tags: unexpected 0x{:02x} at {}",
                    other, pos
                )))
            }
        }

        if buf.len() < pos + MODULE_PREFIX_SIZE {
            return Ok(None);
        }
        ModuleId::from_bytes(&buf[pos + 1..pos + 3])?;
        if buf[pos + 3] != SEPARATOR {
            return Err(Error::malformed("missing module separator"));
        }
        let len = u32::from_be_bytes([buf[pos + 5], buf[pos + 6], buf[pos + 7], buf[pos + 8]])
            as usize;
        if len > MAX_MODULE_SIZE {
            return Err(Error::malformed(format!("module too large: {} bytes", len)));
        }

        let close = pos + MODULE_PREFIX_SIZE + len;
        match buf.get(close) {
            None => return Ok(None),
            Some(&MODULE_CLOSING_TAG) => pos = close + 1,
            Some(_) => return Err(Error::malformed("unbalanced tags: module not closed")),
        }
    }
}

/// Stream codec for booster packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match frame_len(src)? {
            Some(n) => {
                let frame = src.split_to(n);
                Packet::decode_frame(&frame).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Heartbeat, Hello, NodeStatus, TunnelEvent, TunnelOperation, TunnelStatus};

    fn hello_packet() -> Packet {
        Packet::compose(
            &Header::hello(),
            &Hello {
                bport: "4000".into(),
                pport: "1080".into(),
            },
            Encoding::Json,
        )
        .unwrap()
    }

    #[test]
    fn test_packet_encode_decode() {
        let original = hello_packet();
        let encoded = original.encode();

        assert_eq!(encoded[0], PACKET_OPENING_TAG);
        assert_eq!(encoded[encoded.len() - 1], PACKET_CLOSING_TAG);
        assert_eq!(&encoded[2..4], b"HE");

        let (decoded, n) = Packet::decode(&encoded).unwrap();
        assert_eq!(n, encoded.len());
        assert_eq!(decoded, original);
        assert_eq!(decoded.message().unwrap(), Message::Hello);

        let hello: Hello = decoded.payload().unwrap();
        assert_eq!(hello.bport, "4000");
        assert_eq!(hello.pport, "1080");
    }

    #[test]
    fn test_tag_characters_inside_strings() {
        let status = NodeStatus {
            id: "]<>[:".into(),
            baddr: "<<<".into(),
            paddr: ">>>".into(),
            active: true,
            tunnels: vec![TunnelStatus {
                id: "t".into(),
                target: "[::1]:80".into(),
                acks: 1,
                copies: 2,
            }],
        };
        let p = Packet::compose(&Header::node_status(), &status, Encoding::Json).unwrap();

        let (decoded, _) = Packet::decode(&p.encode()).unwrap();
        assert_eq!(decoded.payload::<NodeStatus>().unwrap(), status);
    }

    #[test]
    fn test_control_packet_has_no_payload() {
        let p = Packet::with_header(&Header::tunnel_notify(), Encoding::Json).unwrap();
        let (decoded, _) = Packet::decode(&p.encode()).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.message().unwrap(), Message::Notify);
        assert!(decoded.payload::<TunnelEvent>().is_err());
    }

    #[test]
    fn test_missing_header() {
        let mut p = Packet::new();
        p.add_module(
            ModuleId::Payload,
            &TunnelEvent {
                target: "a:1".into(),
                event: TunnelOperation::Add,
            },
            Encoding::Json,
        )
        .unwrap();

        let (decoded, _) = Packet::decode(&p.encode()).unwrap();
        assert!(matches!(decoded.header(), Err(Error::MalformedPacket(_))));
    }

    #[test]
    fn test_duplicate_module_rejected() {
        let mut p = hello_packet();
        assert!(p
            .add_module(ModuleId::Header, &Header::heartbeat(), Encoding::Json)
            .is_err());
    }

    #[test]
    fn test_decode_invalid() {
        // Not a packet
        assert!(matches!(
            Packet::decode(b"hello"),
            Err(Error::MalformedPacket(_))
        ));

        // Truncated
        let encoded = hello_packet().encode();
        assert!(matches!(
            Packet::decode(&encoded[..encoded.len() - 3]),
            Err(Error::MalformedPacket(_))
        ));

        // Unknown module identifier
        let mut bad = encoded.to_vec();
        bad[2] = b'X';
        assert!(matches!(
            Packet::decode(&bad),
            Err(Error::MalformedPacket(_))
        ));

        // Module closing tag replaced
        let mut bad = encoded.to_vec();
        let header_len = u32::from_be_bytes([bad[6], bad[7], bad[8], bad[9]]) as usize;
        bad[1 + MODULE_PREFIX_SIZE + header_len] = b'x';
        assert!(matches!(
            Packet::decode(&bad),
            Err(Error::MalformedPacket(_))
        ));

        // Unsupported encoding
        let mut bad = encoded.to_vec();
        bad[5] = 9;
        assert!(matches!(
            Packet::decode(&bad),
            Err(Error::UnsupportedEncoding(9))
        ));
    }

    #[test]
    fn test_codec_buffers_partial_reads() {
        let hb = Packet::compose(
            &Header::heartbeat(),
            &Heartbeat {
                id: "n1".into(),
                hops: 0,
                ttl: chrono::Utc::now(),
            },
            Encoding::Json,
        )
        .unwrap();

        let mut wire = BytesMut::new();
        hello_packet().encode_into(&mut wire);
        hb.encode_into(&mut wire);
        let wire = wire.freeze();

        let mut codec = PacketCodec;
        let mut src = BytesMut::new();
        let mut out = Vec::new();

        // feed one byte at a time
        for b in wire.iter() {
            src.put_u8(*b);
            while let Some(p) = codec.decode(&mut src).unwrap() {
                out.push(p);
            }
        }

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message().unwrap(), Message::Hello);
        assert_eq!(out[1], hb);
        assert!(src.is_empty());
    }

    #[test]
    fn test_wire_size() {
        let p = hello_packet();
        assert_eq!(p.wire_size(), p.encode().len());
    }
}
