use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

use crate::DMX_CHANNELS;

pub const HEADER: &[u8] = b"Art-Net\0";
pub const OP_DMX: u16 = 0x5000;
pub const OP_POLL: u16 = 0x2000;
pub const PROTOCOL_VERSION: u16 = 14;

/// Build an ArtDMX packet for one universe.
///
/// The payload is truncated or right-padded with zeros to exactly 512
/// channels, so the packet is always 18 + 512 = 530 bytes.
pub fn build_artdmx(universe: u16, dmx: &[u8], sequence: u8) -> Vec<u8> {
    let mut packet = Vec::with_capacity(18 + DMX_CHANNELS);
    packet.extend_from_slice(HEADER);
    packet.write_u16::<LittleEndian>(OP_DMX).unwrap();
    packet.write_u16::<BigEndian>(PROTOCOL_VERSION).unwrap();
    packet.push(sequence);
    packet.push(0); // Physical
    packet.write_u16::<LittleEndian>(universe).unwrap();
    packet.write_u16::<BigEndian>(DMX_CHANNELS as u16).unwrap();
    let take = dmx.len().min(DMX_CHANNELS);
    packet.extend_from_slice(&dmx[..take]);
    packet.resize(18 + DMX_CHANNELS, 0);
    packet
}

/// Build an ArtPoll packet. TalkToMe bit 1 asks nodes to reply on change.
pub fn build_artpoll() -> Vec<u8> {
    let mut packet = Vec::with_capacity(14);
    packet.extend_from_slice(HEADER);
    packet.write_u16::<LittleEndian>(OP_POLL).unwrap();
    packet.write_u16::<BigEndian>(PROTOCOL_VERSION).unwrap();
    packet.push(0b0000_0010); // TalkToMe
    packet.push(0); // Priority
    packet
}

/// Parse an inbound ArtDMX packet into `(universe, dmx_slice)`.
///
/// Returns `None` for anything that is not a well-formed ArtDMX packet:
/// wrong magic, wrong opcode, header shorter than 18 bytes, or a declared
/// length that overruns the datagram.
pub fn parse_artdmx(data: &[u8]) -> Option<(u16, &[u8])> {
    if data.len() < 18 {
        return None;
    }
    if &data[0..8] != HEADER {
        return None;
    }
    let opcode = u16::from_le_bytes([data[8], data[9]]);
    if opcode != OP_DMX {
        return None;
    }
    let universe = u16::from_le_bytes([data[14], data[15]]);
    let length = u16::from_be_bytes([data[16], data[17]]) as usize;
    if data.len() < 18 + length {
        return None;
    }
    Some((universe, &data[18..18 + length]))
}
