//! Packet identifiers and pending QoS 1/2 records.

use std::fmt;
use std::num::NonZeroU16;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{self, Packet, ProtocolVersion, Publish, PublishAck, QoS};
use crate::types::{ClientId, PacketId, TimestampMillis};
use crate::{MqttError, Result};

const ID_WORDS: usize = (u16::MAX as usize + 1) / 64;

/// Bitset over the packet identifiers `1..=65535` of one client.
pub struct PacketIdAllocator {
    bits: Box<[u64]>,
    last: u16,
    used: usize,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PacketIdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketIdAllocator {{ last: {}, used: {} }}", self.last, self.used)
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self { bits: vec![0u64; ID_WORDS].into_boxed_slice(), last: 0, used: 0 }
    }

    #[inline]
    fn slot(id: u16) -> (usize, u64) {
        ((id / 64) as usize, 1u64 << (id % 64))
    }

    #[inline]
    pub fn is_used(&self, id: PacketId) -> bool {
        let (word, bit) = Self::slot(id.get());
        self.bits[word] & bit != 0
    }

    /// Issues the first free identifier after the last one issued, wrapping
    /// from 65535 back to 1.
    pub fn allocate(&mut self) -> Result<PacketId> {
        if self.used >= u16::MAX as usize {
            return Err(MqttError::PacketIdExhausted);
        }
        for offset in 1..=u16::MAX as u32 {
            let id = ((self.last as u32 + offset - 1) % u16::MAX as u32 + 1) as u16;
            if let Some(id) = NonZeroU16::new(id) {
                if !self.is_used(id) {
                    self.mark(id);
                    self.last = id.get();
                    return Ok(id);
                }
            }
        }
        Err(MqttError::PacketIdExhausted)
    }

    /// Marks `id` in use, returns false if it already was.
    pub fn mark(&mut self, id: PacketId) -> bool {
        let (word, bit) = Self::slot(id.get());
        if self.bits[word] & bit != 0 {
            return false;
        }
        self.bits[word] |= bit;
        self.used += 1;
        true
    }

    /// Frees `id`, returns false if it was not in use.
    pub fn release(&mut self, id: PacketId) -> bool {
        let (word, bit) = Self::slot(id.get());
        if self.bits[word] & bit == 0 {
            return false;
        }
        self.bits[word] &= !bit;
        self.used -= 1;
        true
    }

    /// The last identifier issued, `0` before the first allocation.
    #[inline]
    pub fn cursor(&self) -> u16 {
        self.last
    }

    #[inline]
    pub fn set_cursor(&mut self, last: u16) {
        self.last = last;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.used = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by us, waiting for the peer's acknowledgement.
    Outbound,
    /// QoS 2 publish received from the peer, waiting for its PUBREL.
    Inbound,
}

impl Direction {
    #[inline]
    pub fn prefix(self) -> &'static str {
        match self {
            Direction::Outbound => "record",
            Direction::Inbound => "inbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// Publish sent, no acknowledgement yet.
    Ready,
    /// PUBREC seen (outbound) or publish stored (inbound).
    Received,
    /// PUBREL seen on an inbound record.
    Released,
}

/// One in-flight QoS 1/2 exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    /// What to (re)send: PUBLISH, then PUBREL once the peer sent PUBREC.
    pub content: Packet,
    pub client_id: ClientId,
    pub packet_id: PacketId,
    pub qos: QoS,
    pub direction: Direction,
    pub received_at: TimestampMillis,
    /// `0` while the record was never put on the wire.
    pub last_sent_at: TimestampMillis,
    /// Absolute unix expiry in nanoseconds, `0` never expires.
    pub expiry_at: i64,
    pub protocol: ProtocolVersion,
    pub attempts: u64,
}

// qos, receive time, send time, expiry, protocol, client id length
const HEADER_LEN: usize = 1 + 8 + 8 + 8 + 1 + 2;

impl PendingRecord {
    /// A record for a publish we send. `publish` must carry its packet id.
    pub fn outbound(
        client_id: ClientId,
        publish: Publish,
        protocol: ProtocolVersion,
        now: TimestampMillis,
        expiry_at: i64,
    ) -> Result<Self> {
        Self::new(Direction::Outbound, client_id, publish, protocol, now, expiry_at)
    }

    /// A record for a QoS 2 publish received from the peer.
    pub fn inbound(
        client_id: ClientId,
        publish: Publish,
        protocol: ProtocolVersion,
        now: TimestampMillis,
        expiry_at: i64,
    ) -> Result<Self> {
        Self::new(Direction::Inbound, client_id, publish, protocol, now, expiry_at)
    }

    fn new(
        direction: Direction,
        client_id: ClientId,
        publish: Publish,
        protocol: ProtocolVersion,
        now: TimestampMillis,
        expiry_at: i64,
    ) -> Result<Self> {
        let packet_id = publish.packet_id.ok_or(MqttError::PacketIdRequired)?;
        Ok(PendingRecord {
            qos: publish.qos,
            content: Packet::Publish(publish),
            client_id,
            packet_id,
            direction,
            received_at: now,
            last_sent_at: now,
            expiry_at,
            protocol,
            attempts: 0,
        })
    }

    pub fn state(&self) -> RecordState {
        match (self.direction, &self.content) {
            (Direction::Outbound, Packet::PublishRelease(_)) => RecordState::Received,
            (Direction::Outbound, _) => RecordState::Ready,
            (Direction::Inbound, Packet::PublishComplete(_)) => RecordState::Released,
            (Direction::Inbound, _) => RecordState::Received,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.expiry_at > 0 && now.saturating_mul(1_000_000) >= self.expiry_at
    }

    /// Moves an outbound QoS 2 record to the PUBREL stage.
    pub fn to_release(&mut self) {
        self.content = Packet::PublishRelease(PublishAck::new(self.packet_id));
    }

    /// Moves an inbound record to the PUBCOMP stage.
    pub fn to_complete(&mut self) {
        self.content = Packet::PublishComplete(PublishAck::new(self.packet_id));
    }

    /// The packet to put on the wire when this record is (re)sent. A publish
    /// carries the dup flag once it went out before.
    pub fn resend_packet(&self) -> Packet {
        match &self.content {
            Packet::Publish(publish) => {
                let mut publish = publish.clone();
                publish.dup = self.last_sent_at > 0;
                Packet::Publish(publish)
            }
            other => other.clone(),
        }
    }

    /// Serializes the record for a [`Store`](crate::store::Store) backend.
    ///
    /// Layout, big-endian:
    /// `[qos:1][received_at:8][last_sent_at:8][expiry_nanos:8][protocol:1]`
    /// `[client_id_len:2][client_id][attempts:8][encoded packet]`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let packet = codec::encode(self.protocol, &self.content)?;
        let client_id = self.client_id.as_bytes();
        let client_id_len = u16::try_from(client_id.len())
            .map_err(|_| MqttError::CorruptRecord(format!("client id too long, {}", client_id.len())))?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + client_id.len() + 8 + packet.len());
        buf.put_u8(self.qos.value());
        buf.put_i64(self.received_at);
        buf.put_i64(self.last_sent_at);
        buf.put_i64(self.expiry_at);
        buf.put_u8(self.protocol.level());
        buf.put_u16(client_id_len);
        buf.put_slice(client_id);
        buf.put_u64(self.attempts);
        buf.put_slice(&packet);
        Ok(buf.to_vec())
    }

    pub fn from_bytes(direction: Direction, data: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| MqttError::CorruptRecord(reason.to_owned());
        if data.len() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }
        let mut src = data;
        let qos = QoS::try_from(src.get_u8()).map_err(|_| corrupt("invalid qos"))?;
        let received_at = src.get_i64();
        let last_sent_at = src.get_i64();
        let expiry_at = src.get_i64();
        let protocol = ProtocolVersion::try_from(src.get_u8()).map_err(|_| corrupt("invalid protocol version"))?;
        let client_id_len = src.get_u16() as usize;
        if src.remaining() < client_id_len + 8 {
            return Err(corrupt("truncated client id"));
        }
        let client_id = std::str::from_utf8(&src[..client_id_len]).map_err(|_| corrupt("client id is not utf-8"))?;
        let client_id = ClientId::from(client_id);
        src.advance(client_id_len);
        let attempts = src.get_u64();
        let content =
            codec::decode(protocol, src).map_err(|e| MqttError::CorruptRecord(format!("packet, {}", e)))?;

        let packet_id = match (direction, &content) {
            (_, Packet::Publish(p)) => p.packet_id,
            (Direction::Outbound, Packet::PublishRelease(ack)) => Some(ack.packet_id),
            (Direction::Inbound, Packet::PublishComplete(ack)) => Some(ack.packet_id),
            _ => return Err(corrupt("unexpected packet type")),
        }
        .ok_or_else(|| corrupt("publish without packet id"))?;

        Ok(PendingRecord {
            content,
            client_id,
            packet_id,
            qos,
            direction,
            received_at,
            last_sent_at,
            expiry_at,
            protocol,
            attempts,
        })
    }
}
