use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, Local, TimeZone};

use super::fixed_header::{FixedHeaderReceiveFilter, HeaderFormat};
use super::filter::ReceiveFilterFactory;
use crate::network::Session;
use crate::service::ServerConfig;
use crate::{AppError, AppResult};

pub const PACKET_HEADER_SIZE: usize = 36;
const RESERVED_SIZE: usize = 12;

/// Flag of a reply packet.
pub const FLAG_REPLY: u32 = 2;

/// Little endian header of the demonstration wire format:
///
/// | bytes | field       |
/// |-------|-------------|
/// | 4     | body length |
/// | 2     | main type   |
/// | 2     | sub type    |
/// | 4     | version     |
/// | 4     | flag        |
/// | 4     | message id  |
/// | 4     | order       |
/// | 12    | reserved    |
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub body_length: u32,
    pub main_type: u16,
    pub sub_type: u16,
    pub version: u32,
    pub flag: u32,
    pub message_id: u32,
    pub order: u32,
}

impl PacketHeader {
    pub fn read_from(mut buffer: &[u8]) -> AppResult<PacketHeader> {
        if buffer.remaining() < PACKET_HEADER_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "packet header needs {} bytes, got {}",
                PACKET_HEADER_SIZE,
                buffer.remaining()
            )));
        }
        let header = PacketHeader {
            body_length: buffer.get_u32_le(),
            main_type: buffer.get_u16_le(),
            sub_type: buffer.get_u16_le(),
            version: buffer.get_u32_le(),
            flag: buffer.get_u32_le(),
            message_id: buffer.get_u32_le(),
            order: buffer.get_u32_le(),
        };
        Ok(header)
    }

    pub fn write_to(&self, buffer: &mut BytesMut) {
        buffer.put_u32_le(self.body_length);
        buffer.put_u16_le(self.main_type);
        buffer.put_u16_le(self.sub_type);
        buffer.put_u32_le(self.version);
        buffer.put_u32_le(self.flag);
        buffer.put_u32_le(self.message_id);
        buffer.put_u32_le(self.order);
        buffer.put_bytes(0, RESERVED_SIZE);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Bytes,
}

impl Packet {
    pub fn new(main_type: u16, sub_type: u16, flag: u32, body: impl Into<Bytes>) -> Packet {
        let body = body.into();
        let header = PacketHeader {
            body_length: body.len() as u32,
            main_type,
            sub_type,
            version: 1,
            flag,
            message_id: generate_message_id(),
            order: 1,
        };
        Packet { header, body }
    }

    /// An empty reply of the same main/sub type.
    pub fn reply(&self) -> Packet {
        Packet::new(
            self.header.main_type,
            self.header.sub_type,
            FLAG_REPLY,
            Bytes::new(),
        )
    }

    /// The body as text; invalid UTF-8 sequences are replaced.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.body.len());
        let header = PacketHeader {
            body_length: self.body.len() as u32,
            ..self.header.clone()
        };
        header.write_to(&mut buffer);
        buffer.put_slice(&self.body);
        buffer.freeze()
    }
}

/// Milliseconds since the start of the current month.
fn generate_message_id() -> u32 {
    let now = Local::now();
    let month_start = Local
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .earliest();
    month_start.map_or(0, |start| {
        (now - start).num_milliseconds().clamp(0, u32::MAX as i64) as u32
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PacketFormat;

impl HeaderFormat for PacketFormat {
    type Message = Packet;

    fn header_size(&self) -> usize {
        PACKET_HEADER_SIZE
    }

    fn body_length(&self, mut header: &[u8]) -> AppResult<usize> {
        if header.remaining() < 4 {
            return Err(AppError::MalformedProtocol("truncated packet header".to_string()));
        }
        Ok(header.get_u32_le() as usize)
    }

    fn resolve_message(&self, header: &[u8], body: &[u8]) -> AppResult<Packet> {
        let header = PacketHeader::read_from(header)?;
        Ok(Packet {
            header,
            body: Bytes::copy_from_slice(body),
        })
    }
}

pub type PacketReceiveFilter = FixedHeaderReceiveFilter<PacketFormat>;

#[derive(Debug, Clone, Copy, Default)]
pub struct PacketFilterFactory;

impl ReceiveFilterFactory for PacketFilterFactory {
    type Filter = PacketReceiveFilter;

    fn create_filter(
        &self,
        config: &ServerConfig,
        _session: &Arc<Session>,
        _remote: SocketAddr,
    ) -> PacketReceiveFilter {
        FixedHeaderReceiveFilter::new(PacketFormat, config.max_request_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{drain, FilterState, ReceiveFilter};
    use rand::Rng;

    const BUFFER_SIZE: usize = 8228;

    fn sample() -> Packet {
        Packet::new(3, 7, 10, Bytes::from("hello, 世界"))
    }

    /// Feeds `chunks` the way the receive loop does: every read lands behind
    /// the bytes the filter kept at the head of the buffer.
    fn feed(filter: &mut PacketReceiveFilter, chunks: &[&[u8]]) -> Vec<Packet> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut packets = Vec::new();
        for chunk in chunks {
            let delta = filter.offset_delta();
            buffer[delta..delta + chunk.len()].copy_from_slice(chunk);
            let drained = drain(filter, &mut buffer, delta, chunk.len(), BUFFER_SIZE);
            assert!(drained.error.is_none(), "{:?}", drained.error);
            packets.extend(drained.messages);
        }
        packets
    }

    #[test]
    fn test_header_layout() {
        let packet = sample();
        let bytes = packet.encode();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE + 13);
        assert_eq!(&bytes[0..4], &13u32.to_le_bytes());
        assert_eq!(&bytes[4..6], &3u16.to_le_bytes());
        assert_eq!(&bytes[6..8], &7u16.to_le_bytes());
        assert_eq!(&bytes[12..16], &10u32.to_le_bytes());
        assert_eq!(&bytes[24..36], &[0u8; 12]);
    }

    #[test]
    fn test_one_chunk() {
        let packet = sample();
        let mut filter = FixedHeaderReceiveFilter::new(PacketFormat, BUFFER_SIZE);
        let packets = feed(&mut filter, &[&packet.encode()]);
        assert_eq!(packets, vec![packet]);
    }

    #[test]
    fn test_split_at_every_boundary() {
        let packet = sample();
        let bytes = packet.encode();
        for split in 1..bytes.len() {
            let mut filter = FixedHeaderReceiveFilter::new(PacketFormat, BUFFER_SIZE);
            let packets = feed(&mut filter, &[&bytes[..split], &bytes[split..]]);
            assert_eq!(packets, vec![packet.clone()], "split at {}", split);
        }
    }

    #[test]
    fn test_three_random_chunks() {
        let packet = Packet::new(1, 2, 10, Bytes::from(vec![b'x'; 300]));
        let bytes = packet.encode();
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let a = rng.gen_range(1..bytes.len() - 1);
            let b = rng.gen_range(a + 1..bytes.len());
            let mut filter = FixedHeaderReceiveFilter::new(PacketFormat, BUFFER_SIZE);
            let packets = feed(&mut filter, &[&bytes[..a], &bytes[a..b], &bytes[b..]]);
            assert_eq!(packets, vec![packet.clone()], "chunks at {} and {}", a, b);
        }
    }

    #[test]
    fn test_several_packets_in_one_read() {
        let first = sample();
        let second = first.reply();
        let third = Packet::new(9, 9, 10, Bytes::from("tail"));
        let mut joined = BytesMut::new();
        for packet in [&first, &second, &third] {
            joined.extend_from_slice(&packet.encode());
        }
        // cut inside the third packet's header
        let cut = joined.len() - third.encode().len() + 10;
        let mut filter = FixedHeaderReceiveFilter::new(PacketFormat, BUFFER_SIZE);
        let packets = feed(&mut filter, &[&joined[..cut], &joined[cut..]]);
        assert_eq!(packets, vec![first, second, third]);
    }

    #[test]
    fn test_zero_length_body() {
        let reply = sample().reply();
        assert_eq!(reply.header.flag, FLAG_REPLY);
        let mut filter = FixedHeaderReceiveFilter::new(PacketFormat, BUFFER_SIZE);
        let packets = feed(&mut filter, &[&reply.encode()]);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].body.is_empty());
    }

    #[test]
    fn test_declared_length_over_limit() {
        let mut header = BytesMut::new();
        PacketHeader {
            body_length: 9000,
            ..Default::default()
        }
        .write_to(&mut header);

        let mut filter = FixedHeaderReceiveFilter::new(PacketFormat, 8228);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        buffer[..PACKET_HEADER_SIZE].copy_from_slice(&header);
        let drained = drain(&mut filter, &mut buffer, 0, PACKET_HEADER_SIZE, 8228);
        assert!(drained.messages.is_empty());
        assert!(matches!(drained.error, Some(AppError::MalformedProtocol(_))));
        assert_eq!(filter.state(), FilterState::Error);
    }

    #[test]
    fn test_body_text_is_lossy() {
        let packet = Packet::new(1, 1, 10, Bytes::from_static(&[b'o', b'k', 0xff]));
        assert_eq!(packet.body_text(), "ok\u{fffd}");
    }
}
