//! The fill pattern marking missing data.

use crate::format::{FrameLayout, VdifHeader};

/// The 64-bit constant stamped over lost datagrams.
pub const FILL_PATTERN: u64 = 0x1122_3344_1122_3344;

/// Stamp the fill pattern over `buf`, eight bytes at a stride; a trailing
/// partial word is left untouched, matching the word-wise stamper this
/// replaces.
pub fn write_fill_pattern(buf: &mut [u8]) {
    let words = FILL_PATTERN.to_le_bytes();
    let mut chunks = buf.chunks_exact_mut(8);
    for c in &mut chunks {
        c.copy_from_slice(&words);
    }
}

/// Build the prototype datagram copied over every lost slot: fill pattern
/// throughout, except that VDIF streams get a valid "invalid"-marked VDIF
/// header up front so downstream correlators skip the frame instead of
/// mis-decoding it. `frame_len` is the on-wire frame length the header
/// should claim.
pub fn fill_datagram(len: usize, frame_len: usize, layout: Option<&FrameLayout>) -> Vec<u8> {
    let mut dg = vec![0u8; len];
    write_fill_pattern(&mut dg);
    if let Some(layout) = layout {
        if layout.format.is_vdif() && len >= VdifHeader::SIZE {
            VdifHeader::write_invalid(&mut dg, frame_len);
        }
    }
    dg
}
