//! Sequence-number wire format and the back-channel ACK tokens.

use byteorder::{ByteOrder, LittleEndian};

/// Size of the sequence-number prefix on UDPS/VTP datagrams.
pub const SEQNR_SIZE: usize = 8;

/// Encode a sequence number the way it travels in front of the payload.
pub fn encode_seqnr(seqnr: u64, buf: &mut [u8; SEQNR_SIZE]) {
    LittleEndian::write_u64(buf, seqnr);
}

pub fn decode_seqnr(buf: &[u8; SEQNR_SIZE]) -> u64 {
    LittleEndian::read_u64(buf)
}

/// Some senders only fill in the low 32 bits; the high word reads as zero
/// and the number is taken as-is.
pub fn decode_seqnr32(buf: &[u8; SEQNR_SIZE]) -> u64 {
    LittleEndian::read_u32(&buf[0..4]) as u64
}

/// The rotating table of short tokens sent back to the sender every ACK
/// period. Content is irrelevant; the packets exist to keep ARP/NAT state
/// on the path warm.
const ACK_TOKENS: [&str; 7] = [
    "xhg",
    "xybbgmnx",
    "xyreryvwre",
    "tbqireqbzzr",
    "obxxryhy",
    "rvxryovwgre",
    "qebrsgbrgre",
];

/// Token for the `n`-th ACK sent; wraps around the table.
pub fn ack_token(n: usize) -> &'static [u8] {
    ACK_TOKENS[n % ACK_TOKENS.len()].as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqnr_roundtrip() {
        let mut buf = [0u8; SEQNR_SIZE];
        encode_seqnr(0x0123_4567_89ab_cdef, &mut buf);
        assert_eq!(decode_seqnr(&buf), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn seqnr32_ignores_high_word() {
        let mut buf = [0u8; SEQNR_SIZE];
        encode_seqnr(0xdead_beef_0000_002a, &mut buf);
        assert_eq!(decode_seqnr32(&buf), 0x0000_002a);
    }

    #[test]
    fn ack_tokens_rotate() {
        assert_eq!(ack_token(0), ack_token(7));
        assert_ne!(ack_token(0), ack_token(1));
    }
}
