//! Header-search framer: raw blocks in, aligned frames out.
//!
//! The framer carries a one-frame accumulator across input blocks. While
//! the accumulator holds fewer bytes than the syncword area it keeps
//! copying greedily; beyond that the syncword is located with a
//! Boyer-Moore search, either inside the accumulator or directly in the
//! incoming block. Formats without a syncword degrade to size-based
//! chopping.

use chain::{Block, Blockpool, InQ, OutQ, SyncEnvelope};
use tracing::{debug, info};
use vlbi_types::{BoyerMoore, Frame, FrameLayout, FrameTime, Tagged, VdifHeader};

/// Output-side flexibility: frames can leave the framer bare or tagged by
/// VDIF thread id.
pub trait FromFrame: Send + Sized + 'static {
    fn from_frame(f: Frame) -> Self;
}

impl FromFrame for Frame {
    fn from_frame(f: Frame) -> Self {
        f
    }
}

impl FromFrame for Tagged<Frame> {
    fn from_frame(f: Frame) -> Self {
        let tag = if f.format.is_vdif() {
            VdifHeader::thread_tag(f.data.as_slice())
        } else {
            0
        };
        Tagged::new(tag, f)
    }
}

/// Framer user state: the layout plus running totals an operator can
/// probe.
pub struct FramerArgs {
    pub layout: FrameLayout,
    pub strict: bool,
    pub frames: u64,
    pub bytes: u64,
}

impl FramerArgs {
    pub fn new(layout: FrameLayout) -> Self {
        FramerArgs {
            layout,
            strict: false,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn strict(mut self, yes: bool) -> Self {
        self.strict = yes;
        self
    }
}

/// Decode the frame's time through the layout's validator; frames are
/// accepted undated when no validator is installed.
fn decode_time(layout: &FrameLayout, frame: &[u8]) -> Option<FrameTime> {
    match &layout.validator {
        Some(v) => v.timestamp(frame),
        None => Some(FrameTime::default()),
    }
}

fn header_ok(layout: &FrameLayout, strict: bool, header: &[u8]) -> bool {
    if !strict {
        return true;
    }
    match &layout.validator {
        Some(v) => v.check(header),
        None => true,
    }
}

pub fn framer<E: FromFrame>(
    inq: &InQ<Block>,
    outq: &OutQ<E>,
    env: &SyncEnvelope<FramerArgs>,
) -> anyhow::Result<()> {
    let (layout, strict) = {
        let guard = env.lock();
        (guard.user().layout.clone(), guard.user().strict)
    };
    let frame_size = layout.frame_size;
    let sw_area = layout.syncword_area();
    let no_sync = !layout.has_syncword();
    let search = BoyerMoore::new(&layout.syncword);
    let pool = Blockpool::new(frame_size, 8);

    anyhow::ensure!(
        frame_size >= layout.header_size,
        "frame smaller than its header: {layout:?}"
    );

    info!(?layout, strict, "framer: start looking for dataframes");

    let emit = |frame_data: Block, nframes: &mut u64| -> bool {
        let time = match decode_time(&layout, frame_data.as_slice()) {
            Some(t) => t,
            None => return true, // undecodable, drop and carry on
        };
        *nframes += 1;
        let f = Frame::new(layout.format, layout.ntrack, time, frame_data);
        outq.push(E::from_frame(f))
    };

    let mut accu = pool.get();
    let mut ncached = 0usize;
    let mut nframes_total = 0u64;
    let mut stop = false;

    while !stop {
        let Some(b) = inq.pop() else { break };
        let src = b.as_slice();
        let mut pos = 0usize;
        let mut nframes = 0u64;

        // leftover bytes from previous blocks live in the accumulator;
        // top it up until a frame completes or the search proves the
        // cached bytes dead
        while ncached > 0 && pos < src.len() && !stop {
            let searching = ncached < sw_area && !no_sync;
            let navail = src.len() - pos;
            let ncpy = if searching {
                ((2 * sw_area).saturating_sub(1 + ncached)).min(navail)
            } else {
                (frame_size - ncached).min(navail)
            };
            if let Some(m) = accu.as_mut_slice() {
                m[ncached..ncached + ncpy].copy_from_slice(&src[pos..pos + ncpy]);
            }
            ncached += ncpy;
            pos += ncpy;

            if ncached >= layout.header_size
                && !header_ok(&layout, strict, &accu.as_slice()[..layout.header_size])
            {
                // not a frame after all; rewind a little and hand the
                // search over to the block scan below
                if pos > sw_area {
                    pos -= sw_area;
                }
                ncached = 0;
                continue;
            }

            if ncached == frame_size {
                let full = std::mem::replace(&mut accu, pool.get());
                stop = !emit(full, &mut nframes);
                ncached = 0;
                continue;
            }

            if !searching {
                continue;
            }

            match search.find(&accu.as_slice()[..ncached]) {
                None => {
                    if ncpy >= sw_area.saturating_sub(1) {
                        // a syncword crossing the block boundary would
                        // have shown by now; restart inside the block
                        ncached = 0;
                        pos = 0;
                    } else {
                        let nkeep = (sw_area - 1).min(ncached);
                        if let Some(m) = accu.as_mut_slice() {
                            m.copy_within(ncached - nkeep..ncached, 0);
                        }
                        ncached = nkeep;
                    }
                }
                Some(swpos) if swpos < layout.syncword_offset => {
                    // missing pre-syncword bytes; these cached bytes are
                    // unusable
                    ncached = 0;
                    pos = 0;
                }
                Some(swpos) if swpos > layout.syncword_offset => {
                    let diff = swpos - layout.syncword_offset;
                    if let Some(m) = accu.as_mut_slice() {
                        m.copy_within(diff..ncached, 0);
                    }
                    ncached -= diff;
                }
                Some(_) => {} // syncword right where it belongs
            }
        }

        if stop || pos >= src.len() {
            flush_totals(env, &b, nframes, &mut nframes_total);
            continue;
        }

        // main scan over the rest of the block
        while pos < src.len() && !stop {
            let navail = src.len() - pos;
            let sw = if no_sync {
                Some(pos)
            } else {
                search.find(&src[pos..]).map(|p| p + pos)
            };
            let Some(sw) = sw else {
                // no more syncwords; keep a potential partial syncword
                // area for the next block
                let nkeep = sw_area.saturating_sub(1).min(navail);
                if let Some(m) = accu.as_mut_slice() {
                    m[..nkeep].copy_from_slice(&src[src.len() - nkeep..]);
                }
                ncached = nkeep;
                break;
            };

            if !no_sync && (sw - pos) < layout.syncword_offset {
                // pre-syncword bytes of this frame are gone; skip past
                pos = sw + layout.syncword.len();
                continue;
            }
            let sof = sw - layout.syncword_offset;
            let num = src.len() - sof;
            if num < frame_size {
                // trailing partial frame; cache it
                if let Some(m) = accu.as_mut_slice() {
                    m[..num].copy_from_slice(&src[sof..]);
                }
                ncached = num;
                break;
            }

            if !header_ok(&layout, strict, &src[sof..sof + layout.header_size]) {
                pos = sw + layout.syncword.len().max(1);
                continue;
            }

            // whole frame inside this block: emit a zero-copy sub-view
            stop = !emit(b.sub(sof, frame_size), &mut nframes);
            pos = sof + frame_size;
        }

        flush_totals(env, &b, nframes, &mut nframes_total);
    }

    debug!(frames = nframes_total, "framer: done");
    Ok(())
}

fn flush_totals(env: &SyncEnvelope<FramerArgs>, b: &Block, nframes: u64, total: &mut u64) {
    *total += nframes;
    let mut guard = env.lock();
    let args = guard.user_mut();
    args.bytes += b.len() as u64;
    args.frames += nframes;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::BoundedQueue;
    use std::sync::Arc;
    use vlbi_types::format::MARK5B_SYNCWORD;

    const FRAME: usize = 64; // toy mark5b-ish layout: 16 header + 48 payload

    fn toy_layout() -> FrameLayout {
        FrameLayout {
            format: vlbi_types::FrameFormat::Mark5b,
            ntrack: 32,
            frame_size: FRAME,
            header_size: 16,
            syncword: MARK5B_SYNCWORD.to_vec(),
            syncword_offset: 0,
            validator: None,
        }
    }

    fn frame_bytes(tag: u8) -> Vec<u8> {
        let mut f = vec![tag; FRAME];
        f[..4].copy_from_slice(&MARK5B_SYNCWORD);
        f
    }

    fn run_framer(blocks: Vec<Vec<u8>>) -> Vec<Frame> {
        let in_q = Arc::new(BoundedQueue::new(blocks.len().max(1)));
        let out_q: Arc<BoundedQueue<Frame>> = Arc::new(BoundedQueue::new(1024));
        for blk in blocks {
            assert!(in_q.push(Block::from_vec(blk)));
        }
        in_q.delayed_disable();
        let env = SyncEnvelope::standalone(0, FramerArgs::new(toy_layout()));
        framer::<Frame>(&InQ::new(in_q), &OutQ::new(Arc::clone(&out_q)), &env).unwrap();
        let mut out = Vec::new();
        while let Some(f) = out_q.pop() {
            out.push(f);
        }
        out
    }

    #[test]
    fn aligned_frames_pass_through() {
        let mut blk = Vec::new();
        for i in 0..4u8 {
            blk.extend_from_slice(&frame_bytes(i + 0x10));
        }
        let frames = run_framer(vec![blk]);
        assert_eq!(frames.len(), 4);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.data.len(), FRAME);
            assert_eq!(f.data.as_slice()[20], 0x10 + i as u8);
        }
    }

    #[test]
    fn garbage_prefix_is_skipped() {
        let mut blk = vec![0u8; 17]; // junk that contains no syncword
        blk.extend_from_slice(&frame_bytes(0x42));
        blk.extend_from_slice(&frame_bytes(0x43));
        let frames = run_framer(vec![blk]);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn frame_split_across_blocks_is_reassembled() {
        let f0 = frame_bytes(0x21);
        let f1 = frame_bytes(0x22);
        let mut all = Vec::new();
        all.extend_from_slice(&f0);
        all.extend_from_slice(&f1);
        // split in the middle of the first frame
        let blocks = vec![all[..40].to_vec(), all[40..].to_vec()];
        let frames = run_framer(blocks);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data.as_slice()[20], 0x21);
        assert_eq!(frames[1].data.as_slice()[20], 0x22);
    }

    #[test]
    fn syncword_split_across_blocks() {
        let f = frame_bytes(0x33);
        // two bytes of the syncword land in the first block
        let mut first = vec![0u8; 8];
        first.extend_from_slice(&f[..2]);
        let second = f[2..].to_vec();
        let frames = run_framer(vec![first, second]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_slice()[20], 0x33);
    }

    #[test]
    fn vdif_chops_by_size() {
        let layout = FrameLayout::vdif(4, 32);
        let in_q = Arc::new(BoundedQueue::new(4));
        let out_q: Arc<BoundedQueue<Tagged<Frame>>> = Arc::new(BoundedQueue::new(64));
        // three and a half frames; the half stays cached
        in_q.push(Block::from_vec(vec![0u8; 32 * 3 + 16]));
        in_q.delayed_disable();
        let env = SyncEnvelope::standalone(0, FramerArgs::new(layout));
        framer::<Tagged<Frame>>(&InQ::new(in_q), &OutQ::new(Arc::clone(&out_q)), &env).unwrap();
        let mut n = 0;
        while let Some(t) = out_q.pop() {
            assert_eq!(t.tag, 0);
            n += 1;
        }
        assert_eq!(n, 3);
    }
}
