//! Frame formats and the invocation contract with the header codec.
//!
//! The framer itself knows nothing about any particular VLBI format; it
//! works off a [`FrameLayout`]: syncword bytes, syncword offset, frame and
//! header sizes, plus optional validation/timestamp hooks supplied by an
//! external decoder.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::frame::FrameTime;

/// The tape/disk frame formats this system moves around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    Mark4,
    Vlba,
    Mark5b,
    Vdif,
    VdifLegacy,
}

impl FrameFormat {
    pub fn is_vdif(self) -> bool {
        matches!(self, FrameFormat::Vdif | FrameFormat::VdifLegacy)
    }
}

impl std::fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FrameFormat::Mark4 => "mark4",
            FrameFormat::Vlba => "vlba",
            FrameFormat::Mark5b => "mark5b",
            FrameFormat::Vdif => "vdif",
            FrameFormat::VdifLegacy => "vdif_legacy",
        };
        f.write_str(s)
    }
}

/// Optional frame validation / timestamp decoding, supplied externally.
pub trait FrameValidator: Send + Sync {
    /// Full header check beyond the syncword (CRC and the like).
    fn check(&self, frame: &[u8]) -> bool;

    /// Decode the frame timestamp; `None` marks the frame invalid.
    fn timestamp(&self, frame: &[u8]) -> Option<FrameTime>;
}

/// Everything the framer needs to know about a format.
#[derive(Clone)]
pub struct FrameLayout {
    pub format: FrameFormat,
    pub ntrack: u32,
    pub frame_size: usize,
    pub header_size: usize,
    /// Empty for formats without a syncword (VDIF); those are chopped by
    /// size alone.
    pub syncword: Vec<u8>,
    pub syncword_offset: usize,
    pub validator: Option<Arc<dyn FrameValidator>>,
}

impl std::fmt::Debug for FrameLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}trk frame={} hdr={}",
            self.format, self.ntrack, self.frame_size, self.header_size
        )
    }
}

/// Mark5B syncword, as the bytes appear on the wire.
pub const MARK5B_SYNCWORD: [u8; 4] = [0xed, 0xde, 0xad, 0xab];

impl FrameLayout {
    /// Mark5B: 16-byte header starting with the 0xABADDEED syncword,
    /// 10000 payload bytes.
    pub fn mark5b(ntrack: u32) -> Self {
        FrameLayout {
            format: FrameFormat::Mark5b,
            ntrack,
            frame_size: 10016,
            header_size: 16,
            syncword: MARK5B_SYNCWORD.to_vec(),
            syncword_offset: 0,
            validator: None,
        }
    }

    /// VDIF with a 32-byte header; `frame_size` covers header + payload.
    /// No syncword, so framing degenerates to size-based chopping.
    pub fn vdif(ntrack: u32, frame_size: usize) -> Self {
        FrameLayout {
            format: FrameFormat::Vdif,
            ntrack,
            frame_size,
            header_size: 32,
            syncword: Vec::new(),
            syncword_offset: 0,
            validator: None,
        }
    }

    pub fn with_validator(mut self, v: Arc<dyn FrameValidator>) -> Self {
        self.validator = Some(v);
        self
    }

    pub fn has_syncword(&self) -> bool {
        !self.syncword.is_empty()
    }

    /// Offset one past the syncword; the region a partial-frame cache must
    /// cover before a search can conclude anything.
    pub fn syncword_area(&self) -> usize {
        self.syncword_offset + self.syncword.len()
    }

    pub fn payload_size(&self) -> usize {
        self.frame_size - self.header_size
    }
}

/// Minimal bit-level view of a VDIF header (little-endian 32-bit words).
/// Only the fields this system touches: the invalid flag, the frame length
/// and the thread id used for tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdifHeader {
    pub invalid: bool,
    pub seconds: u32,
    pub data_frame_len8: u32,
    pub thread_id: u16,
}

impl VdifHeader {
    pub const SIZE: usize = 32;

    pub fn parse(raw: &[u8]) -> Option<VdifHeader> {
        if raw.len() < 16 {
            return None;
        }
        let w0 = LittleEndian::read_u32(&raw[0..4]);
        let w2 = LittleEndian::read_u32(&raw[8..12]);
        let w3 = LittleEndian::read_u32(&raw[12..16]);
        Some(VdifHeader {
            invalid: (w0 >> 31) != 0,
            seconds: w0 & 0x3fff_ffff,
            data_frame_len8: w2 & 0x00ff_ffff,
            thread_id: ((w3 >> 16) & 0x3ff) as u16,
        })
    }

    /// Write an all-zero header marked invalid with the given total frame
    /// length (header included), the shape the fill-pattern stamper puts in
    /// place of lost VDIF frames.
    pub fn write_invalid(buf: &mut [u8], frame_len: usize) {
        let n = Self::SIZE.min(buf.len());
        for b in buf.iter_mut().take(n) {
            *b = 0;
        }
        let w0 = 1u32 << 31;
        let w2 = (frame_len as u32 / 8) & 0x00ff_ffff;
        LittleEndian::write_u32(&mut buf[0..4], w0);
        LittleEndian::write_u32(&mut buf[8..12], w2);
    }

    pub fn thread_tag(frame: &[u8]) -> u64 {
        Self::parse(frame).map(|h| h.thread_id as u64).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark5b_layout() {
        let l = FrameLayout::mark5b(32);
        assert!(l.has_syncword());
        assert_eq!(l.syncword_area(), 4);
        assert_eq!(l.payload_size(), 10000);
    }

    #[test]
    fn vdif_is_syncword_free() {
        let l = FrameLayout::vdif(8, 8032);
        assert!(!l.has_syncword());
        assert!(l.format.is_vdif());
    }

    #[test]
    fn vdif_invalid_header_roundtrip() {
        let mut buf = [0u8; 32];
        VdifHeader::write_invalid(&mut buf, 8032);
        let h = VdifHeader::parse(&buf).unwrap();
        assert!(h.invalid);
        assert_eq!(h.data_frame_len8, 8032 / 8);
        assert_eq!(h.thread_id, 0);
    }

    #[test]
    fn vdif_thread_id_extraction() {
        let mut buf = [0u8; 32];
        LittleEndian::write_u32(&mut buf[12..16], 0x2a << 16);
        assert_eq!(VdifHeader::thread_tag(&buf), 0x2a);
    }
}
