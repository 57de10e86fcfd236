//! Channel Access datagram framing.
//!
//! A datagram is a sequence of messages, each a 16 byte big-endian header
//! followed by `body_len` bytes of payload:
//!
//! ```text
//!  0      2          4           6       8        12       16
//!  | cmd  | body_len | data_type | count | param1 | param2 |
//! ```
//!
//! Beacons forwarded by the repeater carry the announcing server's IPv4
//! address in `param2`; every other message treats it as a plain u32.
//! Decoding never fails: malformed input is logged and dropped.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::protocol::{
    CMD_BEACON, CMD_REPEATER_CONFIRM, CMD_SEARCH, CMD_VERSION,
};

/// Size of every message header in bytes
pub const HEADER_SIZE: usize = 16;

/// How the trailing four header bytes are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLayout {
    Plain,
    Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param2 {
    Value(u32),
    Address(Ipv4Addr),
}

impl Param2 {
    pub fn as_addr(&self) -> Ipv4Addr {
        match self {
            Param2::Value(v) => Ipv4Addr::from(*v),
            Param2::Address(addr) => *addr,
        }
    }
}

/// Header layout and accepted commands for one socket
#[derive(Debug, Clone, Copy)]
pub struct Framing {
    pub valid_commands: &'static [u16],
    pub layout: HeaderLayout,
}

/// Framing for datagrams received from the beacon repeater
pub const BEACON_FRAMING: Framing = Framing {
    valid_commands: &[CMD_BEACON, CMD_REPEATER_CONFIRM],
    layout: HeaderLayout::Address,
};

/// Framing for client search datagrams
pub const SEARCH_FRAMING: Framing = Framing {
    valid_commands: &[CMD_VERSION, CMD_SEARCH],
    layout: HeaderLayout::Plain,
};

/// A body longer than the 16 bit length field can describe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyTooLarge(pub usize);

impl fmt::Display for BodyTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message body of {} bytes exceeds {}", self.0, u16::MAX)
    }
}

impl std::error::Error for BodyTooLarge {}

/// One message parsed out of a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub command: u16,
    pub body_len: u16,
    pub data_type: u16,
    pub count: u16,
    pub param1: u32,
    pub param2: Param2,
    pub body: Bytes,
}

impl RawMessage {
    /// Message without a body
    pub fn header(command: u16, data_type: u16, count: u16, param1: u32, param2: Param2) -> Self {
        Self {
            command,
            body_len: 0,
            data_type,
            count,
            param1,
            param2,
            body: Bytes::new(),
        }
    }

    /// Build a message, deriving `body_len` from the body
    pub fn new(
        command: u16,
        data_type: u16,
        count: u16,
        param1: u32,
        param2: Param2,
        body: impl Into<Bytes>,
    ) -> Result<Self, BodyTooLarge> {
        let body = body.into();
        let body_len = u16::try_from(body.len()).map_err(|_| BodyTooLarge(body.len()))?;
        Ok(Self {
            body_len,
            body,
            ..Self::header(command, data_type, count, param1, param2)
        })
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE + self.body.len());
        buf.put_u16(self.command);
        buf.put_u16(self.body_len);
        buf.put_u16(self.data_type);
        buf.put_u16(self.count);
        buf.put_u32(self.param1);
        match self.param2 {
            Param2::Value(v) => buf.put_u32(v),
            Param2::Address(addr) => buf.put_slice(&addr.octets()),
        }
        buf.put_slice(&self.body);
    }
}

/// Concatenate messages into a single datagram
pub fn encode(messages: &[RawMessage]) -> Bytes {
    let mut buf = BytesMut::new();
    for msg in messages {
        msg.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Split a datagram into messages.
///
/// Unknown commands are skipped. A message whose declared body runs past the
/// end of the datagram stops decoding; messages before it are still returned.
pub fn decode(datagram: &[u8], framing: &Framing, src: SocketAddr) -> Vec<RawMessage> {
    let mut buf = datagram;
    let mut messages = Vec::new();

    while buf.remaining() >= HEADER_SIZE {
        let command = buf.get_u16();
        let body_len = buf.get_u16();
        let data_type = buf.get_u16();
        let count = buf.get_u16();
        let param1 = buf.get_u32();
        let param2 = match framing.layout {
            HeaderLayout::Plain => Param2::Value(buf.get_u32()),
            HeaderLayout::Address => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Param2::Address(Ipv4Addr::from(octets))
            }
        };

        let len = body_len as usize;
        if len > buf.remaining() {
            tracing::warn!(
                %src,
                command,
                body_len,
                available = buf.remaining(),
                "Truncated datagram"
            );
            return messages;
        }
        let body = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);

        if !framing.valid_commands.contains(&command) {
            tracing::debug!(%src, command, "Unexpected CA message");
            continue;
        }

        messages.push(RawMessage {
            command,
            body_len,
            data_type,
            count,
            param1,
            param2,
            body,
        });
    }

    if buf.has_remaining() {
        tracing::warn!(%src, extra = buf.remaining(), "Extra bytes in datagram");
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CMD_REPEATER_REGISTER;

    fn src() -> SocketAddr {
        "127.0.0.1:5064".parse().unwrap()
    }

    fn search(name: &str, cid: u32) -> RawMessage {
        let mut body = name.as_bytes().to_vec();
        body.resize(name.len().div_ceil(8) * 8, 0);
        RawMessage::new(CMD_SEARCH, 5, 11, cid, Param2::Value(cid), body).unwrap()
    }

    #[test]
    fn test_messages_decode_in_order() {
        let msgs = vec![
            RawMessage::header(CMD_VERSION, 0, 11, 0, Param2::Value(0)),
            search("pv:one", 1),
            search("pv:second", 2),
        ];
        let datagram = encode(&msgs);

        let decoded = decode(&datagram, &SEARCH_FRAMING, src());
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn test_truncated_body_stops_decoding() {
        let good = search("pv:ok", 1);
        let mut buf = BytesMut::new();
        good.encode_into(&mut buf);
        // declares 64 bytes of body but carries 8
        let mut bad = search("pv:bad", 2);
        bad.body_len = 64;
        bad.encode_into(&mut buf);
        search("pv:after", 3).encode_into(&mut buf);

        let decoded = decode(&buf, &SEARCH_FRAMING, src());
        assert_eq!(decoded, vec![good]);
    }

    #[test]
    fn test_unknown_command_skipped() {
        let first = search("pv:a", 1);
        let stray = RawMessage::new(42, 0, 0, 0, Param2::Value(0), vec![1u8; 8]).unwrap();
        let last = search("pv:b", 2);
        let datagram = encode(&[first.clone(), stray, last.clone()]);

        let decoded = decode(&datagram, &SEARCH_FRAMING, src());
        assert_eq!(decoded, vec![first, last]);
    }

    #[test]
    fn test_trailing_bytes_keep_parsed_messages() {
        let msg = search("pv:a", 1);
        let mut buf = BytesMut::new();
        msg.encode_into(&mut buf);
        buf.put_slice(&[0xff; 5]);

        let decoded = decode(&buf, &SEARCH_FRAMING, src());
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn test_address_layout() {
        let addr = Ipv4Addr::new(10, 0, 0, 66);
        let beacon = RawMessage::header(CMD_BEACON, 13, 5064, 7, Param2::Address(addr));
        let datagram = encode(&[beacon.clone()]);

        let decoded = decode(&datagram, &BEACON_FRAMING, src());
        assert_eq!(decoded, vec![beacon]);
        assert_eq!(decoded[0].param2.as_addr(), addr);

        // same bytes read through the plain layout
        let plain = decode(&datagram, &Framing { valid_commands: &[CMD_BEACON], layout: HeaderLayout::Plain }, src());
        assert_eq!(plain[0].param2, Param2::Value(u32::from(addr)));
    }

    #[test]
    fn test_registration_is_not_accepted_on_beacon_socket() {
        let reg = RawMessage::header(CMD_REPEATER_REGISTER, 0, 0, 0, Param2::Address(Ipv4Addr::LOCALHOST));
        assert_eq!(encode(&[reg.clone()]).len(), HEADER_SIZE);
        assert!(decode(&encode(&[reg]), &BEACON_FRAMING, src()).is_empty());
    }

    #[test]
    fn test_short_datagram_is_empty() {
        assert!(decode(&[0u8; 7], &SEARCH_FRAMING, src()).is_empty());
        assert!(decode(&[0u8; 13], &SEARCH_FRAMING, src()).is_empty());
        assert!(decode(&[0u8; 15], &BEACON_FRAMING, src()).is_empty());
    }

    #[test]
    fn test_partial_header_after_message() {
        let msg = search("pv:a", 1);
        for extra in 12..HEADER_SIZE {
            let mut buf = BytesMut::new();
            msg.encode_into(&mut buf);
            buf.put_slice(&vec![0u8; extra]);

            assert_eq!(decode(&buf, &SEARCH_FRAMING, src()), vec![msg.clone()]);
        }
    }

    #[test]
    fn test_header_is_sixteen_bytes() {
        let datagram = encode(&[search("pv:abc", 9)]);
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(datagram.len(), HEADER_SIZE + 8);
        assert_eq!(&datagram[2..4], &8u16.to_be_bytes());
        assert_eq!(&datagram[8..12], &9u32.to_be_bytes());
    }

    #[test]
    fn test_oversized_body_rejected() {
        let body = vec![0u8; u16::MAX as usize + 1];
        let err = RawMessage::new(CMD_SEARCH, 5, 11, 1, Param2::Value(1), body).unwrap_err();
        assert_eq!(err, BodyTooLarge(65536));

        let max = RawMessage::new(CMD_SEARCH, 5, 11, 1, Param2::Value(1), vec![0u8; u16::MAX as usize]).unwrap();
        assert_eq!(max.body_len, u16::MAX);
    }
}
