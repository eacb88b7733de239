//! Chain wiring for each transfer mode.

use anyhow::Context;
use chain::Chain;
use netio::{fd as nfd, DestSpec, Protocol};
use streams::args::{close_and_kick, wait_until_finished, FdArgs};
use streams::check::{block_checker, CheckArgs};
use streams::gen::{frame_pattern_gen, GenArgs};
use streams::multisend::{
    chunk_maker, chunk_reader, mk6_chunk_maker, parallel_sender, parallel_writer,
    responder_closer, rsync_initiator, ChunkSendArgs, Mk6Vars, MultiFileArgs, RsyncInitArgs,
    RsyncRespArgs, rsync_responder,
};
use streams::udps_rx::{udps_bottom_half, udps_top_half, TopArgs};
use streams::writers::protocol_writer;
use tracing::info;

use crate::config::{Config, Mode};

/// Build the chain for the configured mode. The second value says
/// whether the transfer ends on its own (finite input) or runs until the
/// operator stops it.
pub fn build(cfg: &Config) -> anyhow::Result<(Chain, bool)> {
    match cfg.mode {
        Mode::Fill2net => fill2net(cfg).map(|c| (c, true)),
        Mode::Net2check => net2check(cfg).map(|c| (c, false)),
        Mode::Net2vbs => net2vbs(cfg).map(|c| (c, false)),
        Mode::Vbs2net => vbs2net(cfg).map(|c| (c, true)),
        Mode::Vbsserver => vbsserver(cfg).map(|c| (c, false)),
    }
}

fn fill2net(cfg: &Config) -> anyhow::Result<Chain> {
    let layout = cfg.format.layout();
    let gen = &cfg.generate;
    let mut parms = cfg.net.parms.clone();
    parms.blocksize = layout.frame_size * gen.frames_per_block;
    anyhow::ensure!(
        parms.blocksize % parms.wire_size == 0,
        "frame block of {} bytes does not divide into {}-byte datagrams",
        parms.blocksize,
        parms.wire_size
    );

    let spec = DestSpec::parse(&cfg.net.remote, parms.protocol)
        .with_context(|| format!("destination '{}'", cfg.net.remote))?;
    let proto = match &spec {
        DestSpec::Net { proto, .. } => *proto,
        DestSpec::UnixSock { .. } => Protocol::Unix,
        DestSpec::File { .. } => Protocol::Tcp,
    };

    let mut c = Chain::new();
    let gl = layout.clone();
    let nframes = gen.nframes;
    let per_block = gen.frames_per_block;
    c.add_producer(
        8,
        move || GenArgs::new(gl.clone(), nframes, per_block),
        frame_pattern_gen,
    )?;
    let wspec = spec.clone();
    let wparms = parms.clone();
    let writer = c.add_consumer(
        move || {
            let net = nfd::connect(&wspec, &wparms).expect("open destination");
            FdArgs::new(net, wparms.clone())
        },
        move |inq, env| protocol_writer(proto, inq, env),
    )?;
    c.register_cancel(&writer, close_and_kick)?;
    info!(dest = %spec.target_key(), frames = nframes, "fill2net chain built");
    Ok(c)
}

/// The receiving front half shared by every net-in mode.
fn add_udps_front(
    c: &mut Chain,
    cfg: &Config,
) -> anyhow::Result<chain::StepHandle<FdArgs>> {
    let parms = cfg.net.parms.clone();
    let bind = cfg.net.bind.clone();
    let avbs = cfg.net.allow_variable_block_size;
    let bottom = c.add_producer(
        parms.nblock.max(4),
        move || {
            let net = nfd::open_server(parms.protocol, &bind, &parms).expect("bind");
            FdArgs::new(net, parms.clone()).variable_block_size(avbs)
        },
        udps_bottom_half,
    )?;
    let tparms = cfg.net.parms.clone();
    let tlayout = cfg.format.layout();
    c.add_stage(
        cfg.net.parms.nblock.max(4),
        move || TopArgs {
            parms: tparms.clone(),
            layout: Some(tlayout.clone()),
        },
        udps_top_half,
    )?;
    c.register_cancel(&bottom, close_and_kick)?;
    c.register_cancel(&bottom, wait_until_finished)?;
    Ok(bottom)
}

fn net2check(cfg: &Config) -> anyhow::Result<Chain> {
    let mut c = Chain::new();
    let bottom = add_udps_front(&mut c, cfg)?;
    let layout = cfg.format.layout();
    let checker = c.add_consumer(move || CheckArgs::new(layout.clone()), block_checker)?;
    c.register_cleanup(&bottom, |env: &chain::SyncEnvelope<FdArgs>| {
        let guard = env.lock();
        if let Some(a) = guard.user_opt() {
            info!(
                pkt_in = a.stats.pkt_in,
                pkt_lost = a.stats.lost(),
                pkt_ooo = a.stats.pkt_ooo,
                pkt_disc = a.stats.pkt_disc,
                "receive statistics"
            );
        }
    })?;
    c.register_cleanup(&checker, |env: &chain::SyncEnvelope<CheckArgs>| {
        let guard = env.lock();
        if let Some(r) = guard.user_opt() {
            info!(
                frames = r.frames,
                bad_bytes = r.bad_bytes,
                fill_frames = r.fill_frames,
                "check results"
            );
        }
    })?;
    Ok(c)
}

fn net2vbs(cfg: &Config) -> anyhow::Result<Chain> {
    let mut c = Chain::new();
    let _bottom = add_udps_front(&mut c, cfg)?;
    let scan = cfg.scan.clone();
    let qlen = cfg.net.parms.nblock.max(4);
    if cfg.record.mk6 {
        c.add_stage(qlen, move || scan.clone(), mk6_chunk_maker)?;
    } else {
        c.add_stage(qlen, move || scan.clone(), chunk_maker)?;
    }
    let mountpoints = cfg.record.mountpoints.clone();
    let mk6 = cfg.record.mk6.then(|| Mk6Vars {
        packet_format: 0,
        packet_size: cfg.net.parms.wire_size as i32,
    });
    let writer = c.add_consumer(
        move || MultiFileArgs::new(mountpoints.clone(), mk6),
        parallel_writer,
    )?;
    c.set_threads(&writer, cfg.record.workers.max(1))?;
    c.register_cleanup(&writer, |env: &chain::SyncEnvelope<MultiFileArgs>| {
        let guard = env.lock();
        if let Some(s) = guard.user_opt() {
            info!(good_mountpoints = s.good_count, "recording finished");
        }
    })?;
    Ok(c)
}

fn vbs2net(cfg: &Config) -> anyhow::Result<Chain> {
    let spec = DestSpec::parse(&cfg.net.remote, Protocol::Tcp)
        .with_context(|| format!("destination '{}'", cfg.net.remote))?;
    let mut c = Chain::new();
    let scan = cfg.scan.clone();
    let mps = cfg.record.mountpoints.clone();
    let parms = cfg.net.parms.clone();
    let ispec = spec.clone();
    c.add_producer(
        8,
        move || RsyncInitArgs {
            scan: scan.clone(),
            mountpoints: mps.clone(),
            dest: ispec.clone(),
            parms: parms.clone(),
        },
        rsync_initiator,
    )?;
    let readers = c.add_stage(8, || (), chunk_reader)?;
    c.set_threads(&readers, 2)?;
    let sparms = cfg.net.parms.clone();
    let sender = c.add_consumer(
        move || ChunkSendArgs {
            dest: spec.clone(),
            parms: sparms.clone(),
        },
        parallel_sender,
    )?;
    c.set_threads(&sender, cfg.record.workers.max(1))?;
    Ok(c)
}

fn vbsserver(cfg: &Config) -> anyhow::Result<Chain> {
    let mut c = Chain::new();
    let bind = cfg.net.bind.clone();
    let parms = cfg.net.parms.clone();
    let roots = cfg.record.mountpoints.clone();
    let responder = c.add_producer(
        16,
        move || {
            let net = nfd::open_server(Protocol::Tcp, &bind, &parms).expect("bind");
            RsyncRespArgs {
                fd: FdArgs::new(net, parms.clone()),
                scan_root: roots.clone(),
            }
        },
        rsync_responder,
    )?;
    c.set_threads(&responder, 2)?;
    c.register_cancel(&responder, responder_closer)?;
    let mountpoints = cfg.record.mountpoints.clone();
    let writer = c.add_consumer(
        move || MultiFileArgs::new(mountpoints.clone(), None),
        parallel_writer,
    )?;
    c.set_threads(&writer, cfg.record.workers.max(1))?;
    Ok(c)
}
