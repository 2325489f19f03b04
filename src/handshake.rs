//! Conversation-id handshake datagram.
//!
//! The reliable-UDP engine cannot carry a byte until both peers tag their
//! datagrams with the same conversation id, so agreement rides its own
//! 12-byte raw datagram, retransmitted until the server echoes it verbatim:
//!
//! ```text
//! +-------------+------------+----------------+
//! | 00 00 00 00 | conv(LE32) | conv + 1(LE32) |
//! +-------------+------------+----------------+
//! ```
//!
//! The retransmit loop itself lives in [`crate::client`]; this module only
//! knows the byte layout.

/// Size of the handshake datagram.
pub const PACKET_LEN: usize = 12;

/// Build the handshake datagram announcing `conv`.
pub fn packet(conv: u32) -> [u8; PACKET_LEN] {
    let mut pkt = [0u8; PACKET_LEN];
    pkt[4..8].copy_from_slice(&conv.to_le_bytes());
    pkt[8..12].copy_from_slice(&conv.wrapping_add(1).to_le_bytes());
    pkt
}

/// True iff `data` is the verbatim echo of our handshake datagram.
pub fn is_echo(data: &[u8], conv: u32) -> bool {
    data == &packet(conv)[..]
}
