//! Producer stages reading blocks from descriptors: stream sockets,
//! plain files, and straight (sequence-number-free) UDP.

use anyhow::bail;
use chain::{Block, Blockpool, OutQ, SyncEnvelope};
use netio::fd as nfd;
use netio::metadata::MetaData;
use netio::signal::{self, install_wakeup_handler};
use netio::wire::ack_token;
use netio::Protocol;
use tracing::{debug, info, warn};

use crate::args::FdArgs;

/// Common reader prologue: bail out when already cancelled or the
/// descriptor is gone, otherwise register the calling thread for wakeup
/// kicks and hand back what the loop needs.
fn reader_setup(
    env: &SyncEnvelope<FdArgs>,
) -> Option<(std::os::fd::RawFd, netio::NetParms, bool)> {
    let mut guard = env.lock();
    if guard.cancelled {
        return None;
    }
    let args = guard.user_mut();
    let raw = args.net.raw()?;
    args.register_thread();
    Some((raw, args.parms.clone(), args.allow_variable_block_size))
}

/// Pool sizing shared by the readers: large blocks are handed out two per
/// chunk, everything else in batches of sixteen.
fn reader_pool(blocksize: usize) -> Blockpool {
    let per_chunk = if blocksize >= crate::udps_rx::SENSIBLE_BLOCKSIZE {
        2
    } else {
        16
    };
    Blockpool::new(blocksize, per_chunk)
}

/// Stream-socket reader. On a listening descriptor it accepts exactly one
/// data connection first (the accepted fd replaces the listener in the
/// stage state, so cancel hooks hit the live connection). iTCP peers
/// announce themselves with a metadata preamble which is read and logged.
pub fn socket_reader(outq: &OutQ<Block>, env: &SyncEnvelope<FdArgs>) -> anyhow::Result<()> {
    install_wakeup_handler();

    let Some((mut raw, np, avbs)) = reader_setup(env) else {
        debug!("socket_reader: cancelled before start");
        finish(env);
        return Ok(());
    };
    let blocksize = np.blocksize;
    let proto = env.lock().user().net.proto;

    if env.lock().user().listening {
        info!("socket_reader: waiting for incoming connection");
        let (conn, peer) = match nfd::accept(raw) {
            Ok(x) => x,
            Err(e) if signal::is_termination(&e) => {
                finish(env);
                return Ok(());
            }
            Err(e) => {
                finish(env);
                return Err(e.into());
            }
        };
        info!(?peer, "socket_reader: incoming data connection");
        let swapped = {
            let mut guard = env.lock();
            if guard.cancelled {
                None
            } else {
                let args = guard.user_mut();
                args.net.close();
                args.net = netio::NetFd::from_owned(conn, proto);
                args.listening = false;
                args.net.raw()
            }
        };
        raw = match swapped {
            Some(fd) => fd,
            None => {
                finish(env);
                return Ok(());
            }
        };
    }

    if proto == Protocol::Itcp {
        match MetaData::read_from(raw) {
            Ok(md) => info!(id = md.get("id").unwrap_or("?"), "socket_reader: itcp peer"),
            Err(e) => {
                finish(env);
                bail!("socket_reader: bad itcp preamble: {e}");
            }
        }
    }

    let pool = reader_pool(blocksize);
    {
        let mut guard = env.lock();
        guard.user_mut().pool = Some(pool.clone());
    }

    let mut nbyte = 0u64;
    loop {
        let mut b = pool.get();
        let Some(buf) = b.as_mut_slice() else {
            bail!("fresh block unexpectedly shared");
        };
        match nfd::read_loop(raw, buf) {
            Ok(n) if n == blocksize => {
                nbyte += n as u64;
                if !outq.push(b) {
                    break;
                }
            }
            Ok(0) => break, // remote closed cleanly
            Ok(n) => {
                nbyte += n as u64;
                if avbs {
                    let _ = outq.push(b.sub(0, n));
                }
                break;
            }
            Err(e) if signal::is_termination(&e) => break,
            Err(e) => {
                finish(env);
                return Err(e.into());
            }
        }
        flush_bytes(env, &mut nbyte);
    }

    flush_bytes(env, &mut nbyte);
    finish(env);
    info!("socket_reader: stopping");
    Ok(())
}

/// Plain-descriptor reader (files, pipes). Same block discipline as the
/// socket reader, no connection management.
pub fn fd_reader(outq: &OutQ<Block>, env: &SyncEnvelope<FdArgs>) -> anyhow::Result<()> {
    install_wakeup_handler();
    let Some((raw, np, avbs)) = reader_setup(env) else {
        finish(env);
        return Ok(());
    };
    let blocksize = np.blocksize;

    let pool = reader_pool(blocksize);
    {
        let mut guard = env.lock();
        guard.user_mut().pool = Some(pool.clone());
    }

    let mut nbyte = 0u64;
    loop {
        let mut b = pool.get();
        let Some(buf) = b.as_mut_slice() else {
            bail!("fresh block unexpectedly shared");
        };
        match nfd::read_loop(raw, buf) {
            Ok(n) if n == blocksize => {
                nbyte += n as u64;
                if !outq.push(b) {
                    break;
                }
            }
            Ok(0) => break,
            Ok(n) => {
                nbyte += n as u64;
                if avbs {
                    let _ = outq.push(b.sub(0, n));
                }
                break;
            }
            Err(e) if signal::is_termination(&e) => break,
            Err(e) => {
                finish(env);
                return Err(e.into());
            }
        }
        flush_bytes(env, &mut nbyte);
    }
    flush_bytes(env, &mut nbyte);
    finish(env);
    info!("fd_reader: stopping");
    Ok(())
}

/// Straight-through UDP reader: no sequence numbers, no reordering, just
/// datagrams packed into blocks in arrival order. Keeps the same ACK
/// back-traffic as the sequenced reader so network state stays warm.
pub fn udp_reader(outq: &OutQ<Block>, env: &SyncEnvelope<FdArgs>) -> anyhow::Result<()> {
    install_wakeup_handler();
    {
        let guard = env.lock();
        if let Err(e) = guard.user().parms.validate() {
            bail!("invalid net parameters: {e}");
        }
    }
    let Some((raw, np, avbs)) = reader_setup(env) else {
        finish(env);
        return Ok(());
    };

    let blocksize = np.blocksize;
    let slot = np.slot_size;
    let wire = np.wire_size;
    let n_dg = np.dgrams_per_block();
    let pool = reader_pool(blocksize);
    {
        let mut guard = env.lock();
        guard.user_mut().pool = Some(pool.clone());
    }

    let mut sender = None;
    let mut ack_idx = 0usize;
    let mut last_ack = 0i64;
    let mut old_period = np.ack_period;
    debug!(blocksize, wire, "udp_reader: receiving");

    enum Outcome {
        Full,
        Stopped(usize),
        Fatal(std::io::Error),
    }

    loop {
        let mut b = pool.get();
        let outcome = {
            let Some(buf) = b.as_mut_slice() else {
                bail!("fresh block unexpectedly shared");
            };
            let mut outcome = Outcome::Full;
            for i in 0..n_dg {
                let start = i * slot;
                match nfd::recv_dgram(raw, &mut buf[start..start + wire]) {
                    Ok((n, from)) => {
                        if sender.is_none() {
                            sender = from;
                            info!(?sender, "udp_reader: first packet");
                        }
                        if wire < slot {
                            buf[start + wire..start + slot].fill(0);
                        }
                        {
                            let mut guard = env.lock();
                            let args = guard.user_mut();
                            args.bytes += n as u64;
                            // several back ends may feed one socket; book
                            // each under its source address
                            if let Some(per_sender) =
                                from.and_then(|a| args.senders.get_or_insert(a))
                            {
                                let arrival = per_sender.pkt_in;
                                per_sender.record(arrival);
                            }
                            if args.parms.ack_period != old_period {
                                old_period = args.parms.ack_period;
                                last_ack = 0;
                            }
                        }
                        if last_ack <= 0 {
                            if let Some(from) = sender {
                                if nfd::send_to(raw, ack_token(ack_idx), &from).is_err() {
                                    warn!("udp_reader: failed to send ACK");
                                }
                            }
                            ack_idx += 1;
                            last_ack = old_period as i64;
                        } else {
                            last_ack -= 1;
                        }
                    }
                    Err(e) if signal::is_termination(&e) => {
                        outcome = Outcome::Stopped(start);
                        break;
                    }
                    Err(e) => {
                        outcome = Outcome::Fatal(e);
                        break;
                    }
                }
            }
            outcome
        };
        match outcome {
            Outcome::Full => {
                if !outq.push(b) {
                    break;
                }
            }
            Outcome::Stopped(filled) => {
                if filled > 0 && avbs {
                    let _ = outq.push(b.sub(0, filled));
                }
                break;
            }
            Outcome::Fatal(e) => {
                finish(env);
                return Err(e.into());
            }
        }
    }

    finish(env);
    info!("udp_reader: stopping");
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

fn flush_bytes(env: &SyncEnvelope<FdArgs>, nbyte: &mut u64) {
    if *nbyte == 0 {
        return;
    }
    let mut guard = env.lock();
    guard.user_mut().bytes += *nbyte;
    *nbyte = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::BoundedQueue;
    use netio::{NetFd, NetParms};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn socket_reader_blocks_and_tail() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            s.write_all(&[9u8; 100]).unwrap();
        });

        let np = NetParms {
            blocksize: 32,
            slot_size: 32,
            wire_size: 32,
            ..NetParms::default()
        };
        let args = FdArgs::new(NetFd::from_owned(listener.into(), netio::Protocol::Tcp), np)
            .listening(true)
            .variable_block_size(true);
        let env = SyncEnvelope::standalone(0, args);

        let out_q = Arc::new(BoundedQueue::new(16));
        socket_reader(&OutQ::new(Arc::clone(&out_q)), &env).unwrap();
        writer.join().unwrap();

        // 100 bytes = 3 full blocks of 32 plus a 4-byte tail
        let mut sizes = Vec::new();
        while let Some(b) = out_q.pop() {
            sizes.push(b.len());
        }
        assert_eq!(sizes, vec![32, 32, 32, 4]);
    }
}
