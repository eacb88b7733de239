//! Sequence-numbered UDP reception.
//!
//! The bottom half owns the socket and a readahead window of blocks; each
//! incoming datagram is scatter-read straight into its slot, a flag byte
//! per slot recording what actually arrived. The top half replaces the
//! slots that never arrived with the fill pattern and hands clean blocks
//! downstream.
//!
//! Blocks travelling between the halves are `blocksize + N` bytes: the
//! payload plus one trailing flag byte per datagram slot.

use anyhow::bail;
use chain::{Block, Blockpool, InQ, OutQ, SyncEnvelope};
use netio::fd as nfd;
use netio::signal::{self, install_wakeup_handler};
use netio::wire::ack_token;
use netio::NetParms;
use tracing::{debug, info, warn};
use vlbi_types::{fill_datagram, FrameLayout};

use crate::args::FdArgs;

/// Block sizes from here up get the streamer treatment: readahead of two
/// and a blockpool that grows two elements at a time.
pub const SENSIBLE_BLOCKSIZE: usize = 32 * 1024 * 1024;

/// A window block on its way from bottom to top half: full payload plus
/// flag tail, with the number of payload bytes that are inside the
/// sequence-number range actually seen.
pub struct WindowBlock {
    pub data: Block,
    pub filled: usize,
}

/// Readahead for a parameter set: huge blocks cap it at two.
pub fn readahead(np: &NetParms) -> usize {
    if np.blocksize >= SENSIBLE_BLOCKSIZE {
        2
    } else {
        np.nblock.max(1)
    }
}

fn flag_count(b: &Block, blocksize: usize, n_dg: usize) -> u64 {
    b.as_slice()[blocksize..blocksize + n_dg]
        .iter()
        .filter(|&&f| f != 0)
        .count() as u64
}

/// Bottom half: packet sink with the reorder window. Producer stage; the
/// matching cancel hook is [`crate::args::close_and_kick`].
pub fn udps_bottom_half(
    outq: &OutQ<WindowBlock>,
    env: &SyncEnvelope<FdArgs>,
) -> anyhow::Result<()> {
    install_wakeup_handler();

    let setup = {
        let mut guard = env.lock();
        if guard.cancelled {
            None
        } else {
            let args = guard.user_mut();
            if let Err(e) = args.parms.validate() {
                Some(Err(e))
            } else {
                match args.net.raw() {
                    None => None,
                    Some(raw) => {
                        args.register_thread();
                        let per_chunk =
                            if args.parms.blocksize >= SENSIBLE_BLOCKSIZE { 2 } else { 32 };
                        let pool = Blockpool::new(
                            args.parms.blocksize + args.parms.dgrams_per_block(),
                            per_chunk,
                        );
                        args.pool = Some(pool.clone());
                        Some(Ok((
                            raw,
                            args.parms.clone(),
                            args.allow_variable_block_size,
                            args.seqnr_32bit,
                            pool,
                        )))
                    }
                }
            }
        }
    };
    let (raw, np, avbs, seq32, pool) = match setup {
        Some(Ok(t)) => t,
        Some(Err(e)) => {
            finish(env);
            bail!("invalid net parameters: {e}");
        }
        None => {
            debug!("udps_rx: cancelled before start");
            finish(env);
            return Ok(());
        }
    };

    let blocksize = np.blocksize;
    let slot = np.slot_size;
    let wire = np.wire_size;
    let n_dg = np.dgrams_per_block();
    let ra = readahead(&np);
    let mut window: Vec<Option<Block>> = (0..ra).map(|_| None).collect();

    let mask = |s: u64| if seq32 { s & 0xffff_ffff } else { s };

    // wait for the very first packet; it fixes the window base and the
    // sender we ACK back to
    let (first, sender) = match nfd::peek_seqnr(raw) {
        Ok((s, from)) => (mask(s), from),
        Err(e) if signal::is_termination(&e) => {
            finish(env);
            debug!("udps_rx: cancelled before first packet");
            return Ok(());
        }
        Err(e) => {
            finish(env);
            return Err(e.into());
        }
    };
    let mut base = first;
    let mut seqnr = first;
    let mut max_seq = first;

    info!(
        first,
        ?sender,
        data = wire,
        readahead = ra,
        pkts_per_block = n_dg,
        avbs,
        "udps_rx: receiving"
    );

    let mut ack_idx = 0usize;
    let mut last_ack = 0i64; // 0 triggers an immediate first ACK
    let mut old_period = np.ack_period;
    let mut dummy = vec![0u8; 65536];

    let flush = |window: &mut Vec<Option<Block>>, base: u64, max_seq: u64| -> bool {
        // Full blocks always go downstream; trailing partials only when
        // variable block sizes are allowed.
        let mut pushed_all = true;
        let mut block_base = base;
        for slot_block in window.iter_mut() {
            if block_base > max_seq {
                break;
            }
            let have = ((max_seq + 1 - block_base) as usize).min(n_dg);
            let sz = slot * have;
            if let Some(b) = slot_block.take() {
                if sz == blocksize || avbs {
                    if !outq.push(WindowBlock {
                        data: b,
                        filled: sz,
                    }) {
                        pushed_all = false;
                        break;
                    }
                }
            }
            block_base += n_dg as u64;
        }
        pushed_all
    };

    let mut done = false;
    while !done {
        let too_late = seqnr < base && (base - seqnr) <= n_dg as u64;
        let do_resync = seqnr < base && !too_late;

        {
            let mut guard = env.lock();
            if guard.cancelled {
                break;
            }
            let args = guard.user_mut();
            args.stats.record(seqnr);
            if do_resync {
                let mut disc = 0;
                for slot_block in window.iter_mut() {
                    if let Some(b) = slot_block.take() {
                        disc += flag_count(&b, blocksize, n_dg);
                    }
                }
                args.stats.resync(seqnr);
                args.stats.discard(disc);
                base = seqnr;
                max_seq = seqnr;
                warn!(discarded = disc, new_base = base, "udps_rx: resynced data stream");
            }
            if too_late {
                args.stats.discard(1);
            }
            if seqnr > max_seq {
                max_seq = seqnr;
            }
        }

        if too_late {
            // consume the straggler into the scratch buffer
            match nfd::recv_seq_packet(raw, &mut dummy[..wire]) {
                Ok(_) => {}
                Err(e) if signal::is_termination(&e) => break,
                Err(e) => {
                    flush(&mut window, base, max_seq);
                    finish(env);
                    return Err(e.into());
                }
            }
        } else {
            // find (or make) room in the window, shifting it forward as
            // needed
            let mut shifts = 0;
            let place = loop {
                let off = seqnr - base;
                let bidx = (off / n_dg as u64) as usize;
                if bidx < ra {
                    break Some((bidx, (off % n_dg as u64) as usize));
                }
                if let Some(b) = window[0].take() {
                    if !outq.push(WindowBlock {
                        data: b,
                        filled: blocksize,
                    }) {
                        done = true;
                        break None;
                    }
                }
                window.rotate_left(1);
                window[ra - 1] = None;
                base += n_dg as u64;
                shifts += 1;
                if shifts == ra {
                    info!(
                        jump = seqnr - base,
                        "udps_rx: jump > readahead, snapping window to sender"
                    );
                    base = seqnr;
                }
            };
            let (bidx, pidx) = match place {
                Some(p) => p,
                None => break,
            };

            let block = window[bidx].get_or_insert_with(|| {
                let mut fresh = pool.get();
                if let Some(m) = fresh.as_mut_slice() {
                    m[blocksize..blocksize + n_dg].fill(0);
                }
                fresh
            });
            let Some(buf) = block.as_mut_slice() else {
                bail!("window block unexpectedly shared");
            };
            let start = pidx * slot;
            match nfd::recv_seq_packet(raw, &mut buf[start..start + wire]) {
                Ok(_) => {
                    buf[blocksize + pidx] = 1;
                }
                Err(e) if signal::is_termination(&e) => break,
                Err(e) => {
                    flush(&mut window, base, max_seq);
                    finish(env);
                    return Err(e.into());
                }
            }
        }

        // acknowledgement back-traffic, period reloaded when the operator
        // changes it
        {
            let mut guard = env.lock();
            let args = guard.user_mut();
            args.bytes += (netio::wire::SEQNR_SIZE + wire) as u64;
            if args.parms.ack_period != old_period {
                old_period = args.parms.ack_period;
                last_ack = 0;
                debug!(period = old_period, "udps_rx: ACK period changed");
            }
        }
        if last_ack <= 0 {
            if let Some(from) = sender {
                if nfd::send_to(raw, ack_token(ack_idx), &from).is_err() {
                    warn!("udps_rx: failed to send ACK back to sender");
                }
            }
            ack_idx += 1;
            last_ack = old_period as i64;
        } else {
            last_ack -= 1;
        }

        // peek the next sequence number
        match nfd::peek_seqnr(raw) {
            Ok((s, _)) => seqnr = mask(s),
            Err(e) if signal::is_termination(&e) => break,
            Err(e) => {
                flush(&mut window, base, max_seq);
                finish(env);
                return Err(e.into());
            }
        }
    }

    flush(&mut window, base, max_seq);
    finish(env);
    info!("udps_rx: stopping");
    Ok(())
}

fn finish(env: &SyncEnvelope<FdArgs>) {
    env.with(|st| {
        if let Some(args) = st.user_opt_mut() {
            args.clear_thread();
            args.finished = true;
        }
    });
}

/// State of the top half: the sizes plus the declared format (for VDIF
/// fill frames).
pub struct TopArgs {
    pub parms: NetParms,
    pub layout: Option<FrameLayout>,
}

/// Top half: stamp the fill pattern over every slot that never arrived,
/// zero the slot tails when the wire carried compressed payloads, strip
/// the flag tail and push the cleaned block.
pub fn udps_top_half(
    inq: &InQ<WindowBlock>,
    outq: &OutQ<Block>,
    env: &SyncEnvelope<TopArgs>,
) -> anyhow::Result<()> {
    let (np, layout) = {
        let guard = env.lock();
        (guard.user().parms.clone(), guard.user().layout.clone())
    };
    let blocksize = np.blocksize;
    let slot = np.slot_size;
    let wire = np.wire_size;
    let n_dg = np.dgrams_per_block();
    let zeroes = slot - wire;
    // prototype datagram for lost slots; the VDIF header inside claims the
    // full slot length
    let proto_dg = fill_datagram(wire, slot, layout.as_ref());
    if layout.as_ref().map(|l| l.format.is_vdif()).unwrap_or(false) {
        info!("udps_rx: marking lost VDIF frames invalid instead of raw fill");
    }

    debug!(zeroes, "udps_rx top half: starting");
    while let Some(WindowBlock { mut data, filled }) = inq.pop() {
        {
            let Some(buf) = data.as_mut_slice() else {
                bail!("window block shared between halves");
            };
            for i in 0..n_dg {
                let start = i * slot;
                if buf[blocksize + i] == 0 {
                    buf[start..start + wire].copy_from_slice(&proto_dg);
                }
                if zeroes > 0 {
                    buf[start + wire..start + slot].fill(0);
                }
            }
        }
        if !outq.push(data.sub(0, filled.min(blocksize))) {
            break;
        }
    }
    debug!("udps_rx top half: done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::BoundedQueue;
    use std::sync::Arc;
    use vlbi_types::FILL_PATTERN;

    fn top_args(blocksize: usize, slot: usize, wire: usize) -> TopArgs {
        TopArgs {
            parms: NetParms {
                blocksize,
                slot_size: slot,
                wire_size: wire,
                ..NetParms::default()
            },
            layout: None,
        }
    }

    fn window_block(blocksize: usize, n_dg: usize, flags: &[u8], fill: u8) -> WindowBlock {
        let mut v = vec![fill; blocksize + n_dg];
        v[blocksize..].copy_from_slice(flags);
        WindowBlock {
            data: Block::from_vec(v),
            filled: blocksize,
        }
    }

    #[test]
    fn lost_slots_get_fill_pattern() {
        let blocksize = 64;
        let slot = 16;
        let n_dg = 4;
        let in_q = Arc::new(BoundedQueue::new(4));
        let out_q = Arc::new(BoundedQueue::new(4));
        in_q.push(window_block(blocksize, n_dg, &[1, 0, 1, 0], 0x77));
        in_q.delayed_disable();

        let env = SyncEnvelope::standalone(0, top_args(blocksize, slot, slot));
        udps_top_half(&InQ::new(in_q), &OutQ::new(Arc::clone(&out_q)), &env).unwrap();

        let out = out_q.pop().unwrap();
        assert_eq!(out.len(), blocksize);
        let data = out.as_slice();
        // received slots untouched
        assert!(data[0..16].iter().all(|&b| b == 0x77));
        assert!(data[32..48].iter().all(|&b| b == 0x77));
        // lost slots carry the fill pattern
        assert_eq!(&data[16..24], &FILL_PATTERN.to_le_bytes());
        assert_eq!(&data[48..56], &FILL_PATTERN.to_le_bytes());
    }

    #[test]
    fn compressed_slots_get_zero_tails() {
        let blocksize = 64;
        let slot = 16;
        let wire = 12;
        let n_dg = 4;
        let in_q = Arc::new(BoundedQueue::new(4));
        let out_q = Arc::new(BoundedQueue::new(4));
        in_q.push(window_block(blocksize, n_dg, &[1, 1, 1, 1], 0x77));
        in_q.delayed_disable();

        let env = SyncEnvelope::standalone(0, top_args(blocksize, slot, wire));
        udps_top_half(&InQ::new(in_q), &OutQ::new(Arc::clone(&out_q)), &env).unwrap();

        let data = out_q.pop().unwrap();
        let data = data.as_slice();
        for i in 0..n_dg {
            let s = i * slot;
            assert!(data[s..s + wire].iter().all(|&b| b == 0x77), "slot {i} payload");
            assert!(data[s + wire..s + slot].iter().all(|&b| b == 0), "slot {i} tail");
        }
    }

    #[test]
    fn partial_blocks_are_trimmed() {
        let blocksize = 64;
        let slot = 16;
        let n_dg = 4;
        let in_q = Arc::new(BoundedQueue::new(4));
        let out_q = Arc::new(BoundedQueue::new(4));
        let mut wb = window_block(blocksize, n_dg, &[1, 1, 0, 0], 0x55);
        wb.filled = 32;
        in_q.push(wb);
        in_q.delayed_disable();

        let env = SyncEnvelope::standalone(0, top_args(blocksize, slot, slot));
        udps_top_half(&InQ::new(in_q), &OutQ::new(Arc::clone(&out_q)), &env).unwrap();
        assert_eq!(out_q.pop().unwrap().len(), 32);
    }

    #[test]
    fn readahead_capped_for_huge_blocks() {
        let np = NetParms {
            blocksize: SENSIBLE_BLOCKSIZE,
            slot_size: 8192,
            wire_size: 8192,
            nblock: 16,
            ..NetParms::default()
        };
        assert_eq!(readahead(&np), 2);
        let np_small = NetParms::default();
        assert_eq!(readahead(&np_small), np_small.nblock);
    }
}
