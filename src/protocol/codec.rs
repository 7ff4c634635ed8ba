// Message encoding and decoding for the wire protocol
//
// Bit-exact big-endian codec for the four SWIM datagram types. Encoding
// computes the exact length first and fills a single pre-sized buffer;
// decoding validates every length field against the remaining bytes and
// rejects anything past the 64 KiB datagram cap at the boundary.

use bytes::{BufMut, BytesMut};

use super::{Message, MAX_DATAGRAM_SIZE, TYPE_ACK, TYPE_NACK, TYPE_PING, TYPE_PING_REQ};
use crate::error::CodecError;
use crate::membership::{Member, MemberId, MemberStatus};

/// type:u8 | seq:u64
const HEADER_LEN: usize = 1 + 8;

/// Smallest possible gossip entry: two empty strings, status, incarnation.
const MEMBER_MIN_LEN: usize = 2 + 2 + 1 + 8;

/// Encode a message into a freshly allocated, exactly-sized buffer.
pub fn encode(message: &Message) -> Result<BytesMut, CodecError> {
    let len = encoded_len(message)?;
    if len > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge(len));
    }
    let mut buf = BytesMut::with_capacity(len);
    match message {
        Message::Ping { seq, gossip } => {
            buf.put_u8(TYPE_PING);
            buf.put_u64(*seq);
            put_gossip(&mut buf, gossip);
        }
        Message::PingReq { seq, target, gossip } => {
            buf.put_u8(TYPE_PING_REQ);
            buf.put_u64(*seq);
            put_member_id(&mut buf, target);
            put_gossip(&mut buf, gossip);
        }
        Message::Ack {
            seq,
            responder,
            gossip,
        } => {
            buf.put_u8(TYPE_ACK);
            buf.put_u64(*seq);
            put_member_id(&mut buf, responder);
            put_gossip(&mut buf, gossip);
        }
        Message::Nack { seq, target } => {
            buf.put_u8(TYPE_NACK);
            buf.put_u64(*seq);
            put_member_id(&mut buf, target);
        }
    }
    debug_assert_eq!(buf.len(), len);
    Ok(buf)
}

/// Decode one message from a datagram. Trailing bytes past a complete
/// message are ignored.
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge(buf.len()));
    }
    let mut reader = Reader::new(buf);
    let kind = reader.u8()?;
    let seq = reader.u64()?;
    match kind {
        TYPE_PING => Ok(Message::Ping {
            seq,
            gossip: reader.gossip()?,
        }),
        TYPE_PING_REQ => {
            let target = reader.member_id()?;
            let gossip = reader.gossip()?;
            Ok(Message::PingReq {
                seq,
                target,
                gossip,
            })
        }
        TYPE_ACK => {
            let responder = reader.member_id()?;
            let gossip = reader.gossip()?;
            Ok(Message::Ack {
                seq,
                responder,
                gossip,
            })
        }
        TYPE_NACK => Ok(Message::Nack {
            seq,
            target: reader.member_id()?,
        }),
        other => Err(CodecError::BadType(other)),
    }
}

fn encoded_len(message: &Message) -> Result<usize, CodecError> {
    let body = match message {
        Message::Ping { gossip, .. } => gossip_len(gossip)?,
        Message::PingReq { target, gossip, .. } => member_id_len(target)? + gossip_len(gossip)?,
        Message::Ack {
            responder, gossip, ..
        } => member_id_len(responder)? + gossip_len(gossip)?,
        Message::Nack { target, .. } => member_id_len(target)?,
    };
    Ok(HEADER_LEN + body)
}

fn member_id_len(id: &MemberId) -> Result<usize, CodecError> {
    if id.id.len() > u16::MAX as usize || id.address.len() > u16::MAX as usize {
        return Err(CodecError::TooLarge(id.id.len().max(id.address.len())));
    }
    Ok(2 + id.id.len() + 2 + id.address.len())
}

fn gossip_len(gossip: &[Member]) -> Result<usize, CodecError> {
    if gossip.len() > u16::MAX as usize {
        return Err(CodecError::TooLarge(gossip.len()));
    }
    let mut len = 2;
    for member in gossip {
        len += member_id_len(&member.id)? + 1 + 8;
    }
    Ok(len)
}

fn put_member_id(buf: &mut BytesMut, id: &MemberId) {
    buf.put_u16(id.id.len() as u16);
    buf.put_slice(id.id.as_bytes());
    buf.put_u16(id.address.len() as u16);
    buf.put_slice(id.address.as_bytes());
}

fn put_gossip(buf: &mut BytesMut, gossip: &[Member]) {
    buf.put_u16(gossip.len() as u16);
    for member in gossip {
        put_member_id(buf, &member.id);
        buf.put_u8(member.status.code());
        buf.put_u64(member.incarnation);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| CodecError::BadUtf8)
    }

    fn member_id(&mut self) -> Result<MemberId, CodecError> {
        let id = self.string()?;
        let address = self.string()?;
        Ok(MemberId { id, address })
    }

    fn status(&mut self) -> Result<MemberStatus, CodecError> {
        let code = self.u8()?;
        MemberStatus::from_code(code).ok_or(CodecError::BadType(code))
    }

    fn gossip(&mut self) -> Result<Vec<Member>, CodecError> {
        let count = self.u16()? as usize;
        // a bogus count cannot make us over-allocate past the buffer
        let mut updates = Vec::with_capacity(count.min(self.remaining() / MEMBER_MIN_LEN + 1));
        for _ in 0..count {
            let id = self.member_id()?;
            let status = self.status()?;
            let incarnation = self.u64()?;
            updates.push(Member::new(id, status, incarnation));
        }
        Ok(updates)
    }
}
