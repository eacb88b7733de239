//! Per-protocol consumer stages writing blocks to a file descriptor.
//!
//! Datagram writers pace themselves against the wall clock: the send time
//! of the next packet is computed from the scheduled (not observed) time
//! of the previous one, so jitter does not accumulate. The pacing loop
//! tolerates the known wall-clock monotonicity fault by re-reading the
//! clock once whenever it appears to have jumped more than an hour.

use std::time::{Duration, SystemTime};

use chain::{Block, InQ, SyncEnvelope};
use netio::fd as nfd;
use netio::ipd::ipd_us;
use netio::signal::{self, install_wakeup_handler};
use netio::Protocol;
use tracing::{debug, info, warn};

use crate::args::FdArgs;

/// Spin until the wall clock reaches `sop`. Returns the time observed
/// when the wait ended.
fn pace_until(sop: SystemTime) -> SystemTime {
    loop {
        let mut now = SystemTime::now();
        match now.duration_since(sop) {
            Ok(ahead) => {
                if ahead.as_secs() > 3600 {
                    // suspicious forward jump; believe it only if a second
                    // reading agrees
                    now = SystemTime::now();
                }
                return now;
            }
            Err(_) => continue, // not yet due
        }
    }
}

struct WriterSetup {
    raw: std::os::fd::RawFd,
    proto: Protocol,
    wire: usize,
}

/// Common preamble: bail out if cancelled, register the thread for
/// kicks, fetch the descriptor.
fn setup(env: &SyncEnvelope<FdArgs>, name: &str) -> anyhow::Result<Option<WriterSetup>> {
    install_wakeup_handler();
    let mut guard = env.lock();
    if guard.cancelled {
        debug!("{name}: cancelled before start");
        return Ok(None);
    }
    let args = guard.user_mut();
    if let Err(e) = args.parms.validate() {
        anyhow::bail!("invalid net parameters: {e}");
    }
    let Some(raw) = args.net.raw() else {
        debug!("{name}: descriptor closed before start");
        return Ok(None);
    };
    args.register_thread();
    Ok(Some(WriterSetup {
        raw,
        proto: args.net.proto,
        wire: args.parms.wire_size,
    }))
}

fn teardown(env: &SyncEnvelope<FdArgs>, bytes: u64) {
    env.with(|st| {
        if let Some(args) = st.user_opt_mut() {
            args.clear_thread();
            args.bytes += bytes;
            args.finished = true;
        }
    });
}

/// Gather-write whole blocks to a stream descriptor (TCP, iTCP,
/// UNIX-domain, plain files). On a graceful end the sending direction is
/// shut down and the socket drained until the remote closes.
pub fn fd_writer(inq: &InQ<Block>, env: &SyncEnvelope<FdArgs>) -> anyhow::Result<()> {
    let Some(setup) = setup(env, "fd_writer")? else {
        teardown(env, 0);
        return Ok(());
    };
    let raw = setup.raw;
    let (avbs, sync_bytes, itcp_id) = {
        let guard = env.lock();
        let a = guard.user();
        (
            a.allow_variable_block_size,
            a.sync_bytes,
            a.itcp_id.clone(),
        )
    };

    if setup.proto == Protocol::Itcp {
        // identification preamble, terminated like a metadata block
        let token = itcp_id.unwrap_or_default();
        let mut preamble = format!("id: {token}").into_bytes();
        preamble.extend_from_slice(&[0, 0]);
        match nfd::write_loop(raw, &preamble) {
            Ok(n) if n == preamble.len() => {}
            Ok(_) => anyhow::bail!("short write on itcp preamble"),
            Err(e) if signal::is_termination(&e) => {
                teardown(env, 0);
                return Ok(());
            }
            Err(e) => {
                teardown(env, 0);
                return Err(e.into());
            }
        }
    }

    let mut nbyte = 0u64;
    let mut since_sync = 0u64;
    let mut clean = true;
    while let Some(b) = inq.pop() {
        match nfd::write_loop(raw, b.as_slice()) {
            Ok(n) => {
                nbyte += n as u64;
                since_sync += n as u64;
                if n < b.len() {
                    if avbs {
                        warn!(wrote = n, of = b.len(), "fd_writer: partial block");
                    } else {
                        teardown(env, nbyte);
                        anyhow::bail!("fd_writer: wrote {n} of {} bytes", b.len());
                    }
                }
            }
            Err(e) if signal::is_termination(&e) => {
                clean = false;
                break;
            }
            Err(e) => {
                teardown(env, nbyte);
                return Err(e.into());
            }
        }
        if sync_bytes > 0 && since_sync >= sync_bytes {
            nfd::fdatasync(raw);
            since_sync = 0;
        }
    }

    if clean && setup.proto.is_stream() {
        // let the remote see EOF and finish reading what is queued
        let fd = {
            let guard = env.lock();
            guard.user().net.shutdown_wr();
            guard.user().net.raw()
        };
        if let Some(fd) = fd {
            nfd::drain_until_close(fd);
        }
    }
    teardown(env, nbyte);
    info!(bytes = nbyte, "fd_writer: stopping");
    Ok(())
}

/// Chop blocks into wire-size datagrams, each led by a strictly
/// increasing 64-bit sequence number, paced at the effective inter-packet
/// delay.
pub fn udps_writer(inq: &InQ<Block>, env: &SyncEnvelope<FdArgs>) -> anyhow::Result<()> {
    seq_dgram_writer(inq, env, "udps_writer", true)
}

/// Same as [`udps_writer`] minus the sequence number.
pub fn udp_writer(inq: &InQ<Block>, env: &SyncEnvelope<FdArgs>) -> anyhow::Result<()> {
    seq_dgram_writer(inq, env, "udp_writer", false)
}

fn seq_dgram_writer(
    inq: &InQ<Block>,
    env: &SyncEnvelope<FdArgs>,
    name: &str,
    with_seqnr: bool,
) -> anyhow::Result<()> {
    let Some(setup) = setup(env, name)? else {
        teardown(env, 0);
        return Ok(());
    };
    let raw = setup.raw;
    let wire = setup.wire;

    // a random starting point keeps receivers honest about the only real
    // guarantee: strict monotonic increase
    let mut seqnr: u64 = rand::random::<u32>() as u64;
    let mut old_ipd = u64::MAX;
    let mut nbyte = 0u64;
    let mut sop = SystemTime::now();

    info!(first = seqnr, wire, "{name}: sending");

    'outer: while let Some(b) = inq.pop() {
        let (ipd, set_ipd, theoretical) = {
            let guard = env.lock();
            let np = &guard.user().parms;
            (ipd_us(np), np.ipd_us, netio::ipd::theoretical_ipd_us(np))
        };
        if ipd != old_ipd {
            info!(ipd, set = set_ipd, theoretical, "{name}: switch to new ipd");
            {
                let guard = env.lock();
                let _ = nfd::set_ipd(&guard.user().net, ipd);
            }
            old_ipd = ipd;
        }
        let data = b.as_slice();
        let mut off = 0;
        while off + wire <= data.len() {
            if ipd > 0 {
                let now = pace_until(sop);
                sop = now + Duration::from_micros(ipd);
            }
            let payload = &data[off..off + wire];
            let seq_arg = with_seqnr.then_some(seqnr);
            match nfd::send_seq_packet(raw, seq_arg, payload) {
                Ok(_) => {}
                Err(e) if signal::is_termination(&e) => break 'outer,
                Err(e) => {
                    warn!(error = %e, "{name}: failed to send datagram");
                    break 'outer;
                }
            }
            off += wire;
            nbyte += wire as u64;
            seqnr += 1;
        }
    }

    teardown(env, nbyte);
    info!(bytes = nbyte, "{name}: stopping");
    Ok(())
}

/// One whole block per datagram, sequence-number prefixed.
pub fn vtp_writer(inq: &InQ<Block>, env: &SyncEnvelope<FdArgs>) -> anyhow::Result<()> {
    let Some(setup) = setup(env, "vtp_writer")? else {
        teardown(env, 0);
        return Ok(());
    };
    let raw = setup.raw;
    let mut seqnr: u64 = rand::random::<u32>() as u64;
    let mut old_ipd = u64::MAX;
    let mut nbyte = 0u64;
    let mut sop = SystemTime::now();

    while let Some(b) = inq.pop() {
        let ipd = {
            let guard = env.lock();
            ipd_us(&guard.user().parms)
        };
        if ipd != old_ipd {
            info!(ipd, "vtp_writer: switch to new ipd");
            old_ipd = ipd;
        }
        if ipd > 0 {
            let now = pace_until(sop);
            sop = now + Duration::from_micros(ipd);
        }
        match nfd::send_seq_packet(raw, Some(seqnr), b.as_slice()) {
            Ok(n) => nbyte += n as u64,
            Err(e) if signal::is_termination(&e) => break,
            Err(e) => {
                warn!(error = %e, "vtp_writer: failed to send block");
                break;
            }
        }
        seqnr += 1;
    }

    teardown(env, nbyte);
    info!(bytes = nbyte, "vtp_writer: stopping");
    Ok(())
}

/// Writer loop matching a destination's protocol; the fan-out writer
/// dispatches through this.
pub fn protocol_writer(
    proto: Protocol,
    inq: &InQ<Block>,
    env: &SyncEnvelope<FdArgs>,
) -> anyhow::Result<()> {
    match proto {
        Protocol::Udps => udps_writer(inq, env),
        Protocol::Udp => udp_writer(inq, env),
        Protocol::Vtp => vtp_writer(inq, env),
        Protocol::Tcp | Protocol::Itcp | Protocol::Unix => fd_writer(inq, env),
    }
}
