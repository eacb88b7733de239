//! Verification consumers: count what arrives and compare payloads
//! against the expected pattern. Results are read back over
//! `communicate()`.

use chain::{Block, InQ, SyncEnvelope};
use tracing::{debug, warn};
use vlbi_types::{Frame, FrameLayout, Tagged, VdifHeader, FILL_PATTERN};

/// Block-checker state and report.
pub struct CheckArgs {
    pub layout: FrameLayout,
    pub blocks: u64,
    pub frames: u64,
    pub bytes: u64,
    /// Payload bytes that matched neither the fill pattern nor a header
    /// region.
    pub bad_bytes: u64,
    /// Frames whose entire payload is the fill pattern (lost data made
    /// whole by the receiver) or carrying a VDIF invalid flag.
    pub fill_frames: u64,
}

impl CheckArgs {
    pub fn new(layout: FrameLayout) -> Self {
        CheckArgs {
            layout,
            blocks: 0,
            frames: 0,
            bytes: 0,
            bad_bytes: 0,
            fill_frames: 0,
        }
    }
}

fn is_fill(chunk: &[u8]) -> bool {
    chunk.len() == 8 && chunk == FILL_PATTERN.to_le_bytes()
}

/// Consumer verifying that every frame-sized slot in every block carries
/// either generator payload (pure fill pattern plus a header) or the
/// receiver's loss substitute.
pub fn block_checker(inq: &InQ<Block>, env: &SyncEnvelope<CheckArgs>) -> anyhow::Result<()> {
    let layout = env.lock().user().layout.clone();
    let frame_size = layout.frame_size;
    let header = layout.header_size;

    while let Some(b) = inq.pop() {
        let data = b.as_slice();
        let mut frames = 0u64;
        let mut bad = 0u64;
        let mut fill_frames = 0u64;

        for f in data.chunks(frame_size) {
            if f.len() < frame_size {
                // trailing partial frame of a variable-size block
                break;
            }
            frames += 1;
            let mut frame_bad = 0u64;
            for chunk in f[header..].chunks(8) {
                if !is_fill(chunk) {
                    frame_bad += chunk.len() as u64;
                }
            }
            bad += frame_bad;
            let invalid_vdif = layout.format.is_vdif()
                && VdifHeader::parse(f).map(|h| h.invalid).unwrap_or(false);
            if invalid_vdif || (frame_bad == 0 && header_is_fill(&layout, f)) {
                fill_frames += 1;
            }
        }
        if bad > 0 {
            warn!(bad, "block_checker: unexpected payload bytes");
        }

        let mut guard = env.lock();
        let args = guard.user_mut();
        args.blocks += 1;
        args.frames += frames;
        args.bytes += data.len() as u64;
        args.bad_bytes += bad;
        args.fill_frames += fill_frames;
    }
    debug!("block_checker: done");
    Ok(())
}

/// A frame whose header region is fill pattern too never came from the
/// generator; the receiver substituted the whole slot.
fn header_is_fill(layout: &FrameLayout, frame: &[u8]) -> bool {
    if layout.has_syncword() {
        frame[layout.syncword_offset..layout.syncword_offset + layout.syncword.len()]
            != layout.syncword[..]
    } else {
        false
    }
}

/// Plain counting consumer for frame streams.
pub fn frame_counter(inq: &InQ<Frame>, env: &SyncEnvelope<u64>) -> anyhow::Result<()> {
    while inq.pop().is_some() {
        *env.lock().user_mut() += 1;
    }
    Ok(())
}

/// Counting consumer for tagged frame streams, per tag.
pub fn tagged_frame_counter(
    inq: &InQ<Tagged<Frame>>,
    env: &SyncEnvelope<std::collections::HashMap<u64, u64>>,
) -> anyhow::Result<()> {
    while let Some(t) = inq.pop() {
        *env.lock().user_mut().entry(t.tag).or_insert(0) += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gen::{frame_pattern_gen, GenArgs};
    use chain::{BoundedQueue, OutQ};
    use std::sync::Arc;

    #[test]
    fn generator_output_is_clean() {
        let layout = FrameLayout::mark5b(32);
        let q = Arc::new(BoundedQueue::new(64));
        let gen_env = SyncEnvelope::standalone(0, GenArgs::new(layout.clone(), 8, 4));
        frame_pattern_gen(&OutQ::new(Arc::clone(&q)), &gen_env).unwrap();
        q.delayed_disable();

        let env = SyncEnvelope::standalone(1, CheckArgs::new(layout));
        block_checker(&InQ::new(q), &env).unwrap();
        let guard = env.lock();
        let report = guard.user();
        assert_eq!(report.frames, 8);
        assert_eq!(report.bad_bytes, 0);
        assert_eq!(report.fill_frames, 0);
    }

    #[test]
    fn corrupt_payload_is_counted() {
        let layout = FrameLayout::mark5b(32);
        let mut frame = vec![0u8; 10016];
        vlbi_types::write_fill_pattern(&mut frame);
        frame[..4].copy_from_slice(&vlbi_types::format::MARK5B_SYNCWORD);
        // stomp on 16 payload bytes
        for b in frame[5000..5016].iter_mut() {
            *b = 0;
        }
        let q = Arc::new(BoundedQueue::new(4));
        q.push(Block::from_vec(frame));
        q.delayed_disable();

        let env = SyncEnvelope::standalone(0, CheckArgs::new(layout));
        block_checker(&InQ::new(q), &env).unwrap();
        assert_eq!(env.lock().user().bad_bytes, 16);
    }
}
