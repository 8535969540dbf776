//! Generic netlink wire format
//!
//! Encoding and decoding of netlink messages carrying a generic netlink
//! header and a flat attribute set. Integers are in host byte order as the
//! kernel expects; attributes are padded to 4-byte boundaries.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::frame::MacAddr;
use crate::{RelayError, Result};

/// Size of `struct nlmsghdr`
pub const NLMSG_HDRLEN: usize = 16;

/// Size of `struct genlmsghdr`
pub const GENL_HDRLEN: usize = 4;

/// Size of `struct nlattr`
pub const NLA_HDRLEN: usize = 4;

/// Netlink alignment
pub const NL_ALIGNTO: usize = 4;

pub const NLMSG_NOOP: u16 = 0x1;
pub const NLMSG_ERROR: u16 = 0x2;
pub const NLMSG_DONE: u16 = 0x3;
pub const NLMSG_OVERRUN: u16 = 0x4;

/// First message type available to families
pub const NLMSG_MIN_TYPE: u16 = 0x10;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_MULTI: u16 = 0x2;
pub const NLM_F_ACK: u16 = 0x4;

/// Attribute type bits that are flags rather than part of the type
const NLA_TYPE_MASK: u16 = !((1 << 15) | (1 << 14));

/// Largest message the stream decoder accepts from a peer
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Round a length up to the netlink alignment
pub const fn nl_align(len: usize) -> usize {
    (len + NL_ALIGNTO - 1) & !(NL_ALIGNTO - 1)
}

/// Netlink message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NlMsgHeader {
    /// Total length including this header
    pub len: u32,
    /// Message type (family id for generic netlink)
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHeader {
    /// Parse a header from the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < NLMSG_HDRLEN {
            return Err(RelayError::MalformedMessage(format!(
                "netlink header needs {} bytes, got {}",
                NLMSG_HDRLEN,
                data.len()
            )));
        }
        let mut buf = &data[..NLMSG_HDRLEN];
        Ok(Self {
            len: buf.get_u32_ne(),
            msg_type: buf.get_u16_ne(),
            flags: buf.get_u16_ne(),
            seq: buf.get_u32_ne(),
            pid: buf.get_u32_ne(),
        })
    }

    /// Serialize header to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32_ne(self.len);
        buf.put_u16_ne(self.msg_type);
        buf.put_u16_ne(self.flags);
        buf.put_u32_ne(self.seq);
        buf.put_u32_ne(self.pid);
    }
}

/// A single netlink attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u16,
    pub value: Bytes,
}

impl Attribute {
    pub fn new(kind: u16, value: impl Into<Bytes>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn u32(kind: u16, value: u32) -> Self {
        Self::new(kind, value.to_ne_bytes().to_vec())
    }

    pub fn u64(kind: u16, value: u64) -> Self {
        Self::new(kind, value.to_ne_bytes().to_vec())
    }

    pub fn mac(kind: u16, value: MacAddr) -> Self {
        Self::new(kind, value.octets().to_vec())
    }

    /// NUL-terminated string attribute
    pub fn string(kind: u16, value: &str) -> Self {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        Self::new(kind, data)
    }

    /// Encoded size including header and padding
    pub fn size(&self) -> usize {
        nl_align(NLA_HDRLEN + self.value.len())
    }

    /// Serialize attribute to buffer
    pub fn serialize(&self, buf: &mut impl BufMut) {
        let len = NLA_HDRLEN + self.value.len();
        buf.put_u16_ne(len as u16);
        buf.put_u16_ne(self.kind);
        buf.put_slice(&self.value);
        buf.put_bytes(0, nl_align(len) - len);
    }
}

/// Ordered attribute set of a generic netlink message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
    attrs: Vec<Attribute>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a flat attribute stream
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut attrs = Vec::new();
        let mut offset = 0;

        while data.len() - offset >= NLA_HDRLEN {
            let mut hdr = &data[offset..offset + NLA_HDRLEN];
            let len = hdr.get_u16_ne() as usize;
            let kind = hdr.get_u16_ne() & NLA_TYPE_MASK;

            if len < NLA_HDRLEN || offset + len > data.len() {
                return Err(RelayError::MalformedMessage(format!(
                    "attribute {} has invalid length {} at offset {}",
                    kind, len, offset
                )));
            }

            let value = Bytes::copy_from_slice(&data[offset + NLA_HDRLEN..offset + len]);
            attrs.push(Attribute { kind, value });
            offset += nl_align(len).min(data.len() - offset);
        }

        Ok(Self { attrs })
    }

    pub fn push(&mut self, attr: Attribute) {
        self.attrs.push(attr);
    }

    /// Builder-style push
    pub fn with(mut self, attr: Attribute) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Payload of the first attribute of the given type
    pub fn get(&self, kind: u16) -> Option<&Bytes> {
        self.attrs.iter().find(|a| a.kind == kind).map(|a| &a.value)
    }

    pub fn contains(&self, kind: u16) -> bool {
        self.get(kind).is_some()
    }

    pub fn get_u16(&self, kind: u16) -> Option<u16> {
        let value = self.get(kind)?;
        let bytes: [u8; 2] = value.get(..2)?.try_into().ok()?;
        Some(u16::from_ne_bytes(bytes))
    }

    pub fn get_u32(&self, kind: u16) -> Option<u32> {
        let value = self.get(kind)?;
        let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
        Some(u32::from_ne_bytes(bytes))
    }

    pub fn get_u64(&self, kind: u16) -> Option<u64> {
        let value = self.get(kind)?;
        let bytes: [u8; 8] = value.get(..8)?.try_into().ok()?;
        Some(u64::from_ne_bytes(bytes))
    }

    pub fn get_mac(&self, kind: u16) -> Option<MacAddr> {
        self.get(kind).and_then(|v| MacAddr::from_slice(v).ok())
    }

    /// Replace the payload of an existing attribute, or append it
    pub fn set(&mut self, attr: Attribute) {
        match self.attrs.iter_mut().find(|a| a.kind == attr.kind) {
            Some(existing) => existing.value = attr.value,
            None => self.attrs.push(attr),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Encoded size of all attributes
    pub fn size(&self) -> usize {
        self.attrs.iter().map(Attribute::size).sum()
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        for attr in &self.attrs {
            attr.serialize(buf);
        }
    }
}

/// Generic netlink message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenlMessage {
    /// Family id, carried in the netlink message type
    pub family: u16,
    pub command: u8,
    pub version: u8,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    pub attrs: AttributeSet,
}

impl GenlMessage {
    /// Create a request message with no attributes
    pub fn new(family: u16, command: u8, version: u8) -> Self {
        Self {
            family,
            command,
            version,
            flags: NLM_F_REQUEST,
            seq: 0,
            pid: 0,
            attrs: AttributeSet::new(),
        }
    }

    /// Builder-style attribute append
    pub fn with_attr(mut self, attr: Attribute) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Total encoded length
    pub fn size(&self) -> usize {
        NLMSG_HDRLEN + GENL_HDRLEN + self.attrs.size()
    }

    /// Encode the full message including the netlink header
    pub fn encode(&self) -> Bytes {
        let len = self.size();
        let mut buf = BytesMut::with_capacity(len);
        NlMsgHeader {
            len: len as u32,
            msg_type: self.family,
            flags: self.flags,
            seq: self.seq,
            pid: self.pid,
        }
        .serialize(&mut buf);
        buf.put_u8(self.command);
        buf.put_u8(self.version);
        buf.put_u16_ne(0);
        self.attrs.serialize(&mut buf);
        buf.freeze()
    }

    fn parse_body(header: NlMsgHeader, body: &[u8]) -> Result<Self> {
        if body.len() < GENL_HDRLEN {
            return Err(RelayError::MalformedMessage(
                "message too short for generic netlink header".to_string(),
            ));
        }
        Ok(Self {
            family: header.msg_type,
            command: body[0],
            version: body[1],
            flags: header.flags,
            seq: header.seq,
            pid: header.pid,
            attrs: AttributeSet::parse(&body[GENL_HDRLEN..])?,
        })
    }
}

/// A decoded netlink message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetlinkMessage {
    /// Error or acknowledgement (code 0)
    Error { code: i32, header: NlMsgHeader },
    /// End of a multipart dump
    Done,
    /// Generic netlink family message
    Genl(GenlMessage),
    /// Any other control message
    Other { msg_type: u16 },
}

impl NetlinkMessage {
    /// Netlink message type
    pub fn msg_type(&self) -> u16 {
        match self {
            NetlinkMessage::Error { .. } => NLMSG_ERROR,
            NetlinkMessage::Done => NLMSG_DONE,
            NetlinkMessage::Genl(msg) => msg.family,
            NetlinkMessage::Other { msg_type } => *msg_type,
        }
    }
}

/// Decode one message from the start of `data`.
///
/// Returns the message and the number of bytes it occupied (aligned).
pub fn decode_message(data: &[u8]) -> Result<(NetlinkMessage, usize)> {
    let header = NlMsgHeader::parse(data)?;
    let len = header.len as usize;

    if len < NLMSG_HDRLEN || len > data.len() {
        return Err(RelayError::MalformedMessage(format!(
            "netlink length {} outside 16..={}",
            len,
            data.len()
        )));
    }

    let body = &data[NLMSG_HDRLEN..len];
    let consumed = nl_align(len).min(data.len());

    let message = match header.msg_type {
        NLMSG_ERROR => {
            if body.len() < 4 {
                return Err(RelayError::MalformedMessage("truncated error message".to_string()));
            }
            let mut buf = body;
            NetlinkMessage::Error {
                code: buf.get_i32_ne(),
                header,
            }
        }
        NLMSG_DONE => NetlinkMessage::Done,
        t if t >= NLMSG_MIN_TYPE => NetlinkMessage::Genl(GenlMessage::parse_body(header, body)?),
        t => NetlinkMessage::Other { msg_type: t },
    };

    Ok((message, consumed))
}

/// Decode every message in a datagram
pub fn decode_all(mut data: &[u8]) -> Result<Vec<NetlinkMessage>> {
    let mut messages = Vec::new();
    while data.len() >= NLMSG_HDRLEN {
        let (message, consumed) = decode_message(data)?;
        messages.push(message);
        data = &data[consumed..];
    }
    Ok(messages)
}

/// Reassembles netlink messages from a byte stream.
///
/// Peers exchange complete netlink messages over TCP; `nlmsg_len` delimits
/// them.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered and not yet decoded
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pop the next complete message, if one is buffered.
    ///
    /// A length that can never be satisfied is an error; the caller should
    /// drop the stream.
    pub fn next_message(&mut self) -> Result<Option<NetlinkMessage>> {
        if self.buf.len() < NLMSG_HDRLEN {
            return Ok(None);
        }

        let len = NlMsgHeader::parse(&self.buf)?.len as usize;
        if !(NLMSG_HDRLEN..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(RelayError::MalformedMessage(format!(
                "stream message length {} out of range",
                len
            )));
        }

        let total = nl_align(len);
        if self.buf.len() < len {
            return Ok(None);
        }

        let (message, _) = decode_message(&self.buf[..len])?;
        let advance = total.min(self.buf.len());
        self.buf.advance(advance);
        Ok(Some(message))
    }
}
