//! Frame-pattern generator: blocks of synthetic frames, fill-pattern
//! payloads with proper headers, for loopback and acceptance runs.

use byteorder::{ByteOrder, LittleEndian};
use chain::{Block, Blockpool, OutQ, SyncEnvelope};
use tracing::{debug, info};
use vlbi_types::{write_fill_pattern, FrameLayout};

/// Generator state: how many frames of which layout, in blocks of how
/// many frames.
pub struct GenArgs {
    pub layout: FrameLayout,
    pub nframes: u64,
    pub frames_per_block: usize,
    pub generated: u64,
}

impl GenArgs {
    pub fn new(layout: FrameLayout, nframes: u64, frames_per_block: usize) -> Self {
        GenArgs {
            layout,
            nframes,
            frames_per_block: frames_per_block.max(1),
            generated: 0,
        }
    }

    pub fn blocksize(&self) -> usize {
        self.layout.frame_size * self.frames_per_block
    }
}

/// Write one synthetic frame at `buf`: fill-pattern everywhere, then the
/// header region the receiver will look for. VDIF frames get a minimal
/// valid header carrying the frame number as their frame counter.
fn write_frame(layout: &FrameLayout, frame_nr: u64, buf: &mut [u8]) {
    write_fill_pattern(buf);
    if layout.has_syncword() {
        buf[layout.syncword_offset..layout.syncword_offset + layout.syncword.len()]
            .copy_from_slice(&layout.syncword);
    }
    if layout.format.is_vdif() {
        // valid header: length in 8-byte units, frame number in word 1
        let n = layout.header_size.min(buf.len());
        buf[..n].fill(0);
        LittleEndian::write_u32(&mut buf[4..8], (frame_nr & 0x00ff_ffff) as u32);
        LittleEndian::write_u32(&mut buf[8..12], (layout.frame_size / 8) as u32);
    }
}

/// Producer emitting `nframes` pattern frames packed into blocks.
pub fn frame_pattern_gen(outq: &OutQ<Block>, env: &SyncEnvelope<GenArgs>) -> anyhow::Result<()> {
    let (layout, nframes, per_block) = {
        let guard = env.lock();
        if guard.cancelled {
            debug!("frame_pattern_gen: cancelled before starting");
            return Ok(());
        }
        let a = guard.user();
        (a.layout.clone(), a.nframes, a.frames_per_block)
    };
    let frame_size = layout.frame_size;
    let blocksize = frame_size * per_block;
    let pool = Blockpool::new(blocksize, 8);

    info!(?layout, nframes, per_block, "frame_pattern_gen: starting");

    let mut frame_nr = 0u64;
    while frame_nr < nframes {
        let in_this_block = (per_block as u64).min(nframes - frame_nr) as usize;
        let mut b = pool.get();
        {
            let Some(buf) = b.as_mut_slice() else {
                anyhow::bail!("fresh block unexpectedly shared");
            };
            for i in 0..in_this_block {
                write_frame(&layout, frame_nr + i as u64, &mut buf[i * frame_size..(i + 1) * frame_size]);
            }
        }
        let out = if in_this_block == per_block {
            b
        } else {
            b.sub(0, in_this_block * frame_size)
        };
        if !outq.push(out) {
            break;
        }
        frame_nr += in_this_block as u64;
        env.with(|st| {
            if let Some(a) = st.user_opt_mut() {
                a.generated = frame_nr;
            }
        });
        if env.cancelled() {
            break;
        }
    }

    info!(frames = frame_nr, "frame_pattern_gen: done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::{BoundedQueue, InQ};
    use std::sync::Arc;
    use vlbi_types::format::MARK5B_SYNCWORD;

    #[test]
    fn generates_exact_frame_count() {
        let layout = FrameLayout::mark5b(32);
        let env = SyncEnvelope::standalone(0, GenArgs::new(layout, 10, 4));
        let q = Arc::new(BoundedQueue::new(64));
        frame_pattern_gen(&OutQ::new(Arc::clone(&q)), &env).unwrap();
        q.delayed_disable();

        let inq = InQ::new(q);
        let mut frames = 0;
        while let Some(b) = inq.pop() {
            assert_eq!(b.len() % 10016, 0);
            for f in b.as_slice().chunks(10016) {
                assert_eq!(&f[..4], &MARK5B_SYNCWORD);
                frames += 1;
            }
        }
        assert_eq!(frames, 10);
    }
}
