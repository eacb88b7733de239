//! Striped recording: chunking, the mountpoint-striping parallel writer,
//! and the network legs (chunk sender/receiver with the rsync-style
//! negotiation of which chunks still need to travel).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use byteorder::{LittleEndian, WriteBytesExt};
use chain::{Block, InQ, OutQ, SyncEnvelope};
use netio::fd as nfd;
use netio::metadata::{
    decode_path_list, encode_path_list, MetaData, KEY_CHUNK_SEQ, KEY_FILE_NAME, KEY_FILE_SIZE,
    KEY_LIST_TYPE, KEY_PAYLOAD_SIZE, KEY_REPLY_SIZE, KEY_REQUEST_RSYNC,
};
use netio::signal::{self, install_wakeup_handler};
use netio::{DestSpec, NetParms};
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::args::FdArgs;

/// Addressing data of one chunk of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Path relative to a mountpoint, `<scan>/<scan>.<%08 seq>`.
    pub file_name: String,
    pub size: u64,
    pub seq: u32,
}

/// One addressable unit of a striped recording.
pub struct Chunk {
    pub meta: ChunkMeta,
    pub data: Block,
}

/// Where an existing chunk lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    pub mountpoint: PathBuf,
    pub relative: String,
}

/// The `<scan>/<scan>.00000042` naming convention.
pub fn chunk_name(scan: &str, seq: u32) -> String {
    format!("{scan}/{scan}.{seq:08}")
}

/// Sequence number from a chunk file name; the trailing eight digits.
pub fn chunk_seq_from_name(name: &str) -> Option<u32> {
    let (_, digits) = name.rsplit_once('.')?;
    if digits.len() == 8 {
        digits.parse().ok()
    } else {
        None
    }
}

/// Turn a stream of blocks into named, numbered chunks.
pub fn chunk_maker(
    inq: &InQ<Block>,
    outq: &OutQ<Chunk>,
    env: &SyncEnvelope<String>,
) -> anyhow::Result<()> {
    let scan = env.lock().user().clone();
    let mut count = 0u32;
    while let Some(b) = inq.pop() {
        let meta = ChunkMeta {
            file_name: chunk_name(&scan, count),
            size: b.len() as u64,
            seq: count,
        };
        debug!(chunk = %meta.file_name, size = meta.size, "chunk_maker: created chunk");
        if !outq.push(Chunk { meta, data: b }) {
            break;
        }
        count += 1;
    }
    Ok(())
}

/// Mark6 flavour: every chunk targets the single per-mountpoint file named
/// after the scan; ordering lives in the per-chunk block headers instead.
pub fn mk6_chunk_maker(
    inq: &InQ<Block>,
    outq: &OutQ<Chunk>,
    env: &SyncEnvelope<String>,
) -> anyhow::Result<()> {
    let file_name = env.lock().user().clone();
    let mut count = 0u32;
    while let Some(b) = inq.pop() {
        let meta = ChunkMeta {
            file_name: file_name.clone(),
            size: b.len() as u64,
            seq: count,
        };
        if !outq.push(Chunk { meta, data: b }) {
            break;
        }
        count += 1;
    }
    Ok(())
}

/// Mark6 emulation parameters carried into the file headers.
#[derive(Debug, Clone, Copy)]
pub struct Mk6Vars {
    pub packet_format: i32,
    pub packet_size: i32,
}

const MK6_SYNC: u32 = 0xfeed_6666;
const MK6_VERSION: i32 = 2;

fn mk6_file_header(block_size: i32, vars: &Mk6Vars) -> Vec<u8> {
    let mut hdr = Vec::with_capacity(20);
    hdr.write_u32::<LittleEndian>(MK6_SYNC).ok();
    hdr.write_i32::<LittleEndian>(MK6_VERSION).ok();
    hdr.write_i32::<LittleEndian>(block_size).ok();
    hdr.write_i32::<LittleEndian>(vars.packet_format).ok();
    hdr.write_i32::<LittleEndian>(vars.packet_size).ok();
    hdr
}

fn mk6_block_header(seq: i32, bytes: i32) -> Vec<u8> {
    let mut hdr = Vec::with_capacity(8);
    hdr.write_i32::<LittleEndian>(seq).ok();
    hdr.write_i32::<LittleEndian>(bytes).ok();
    hdr
}

/// Shared monitor of the parallel writer's worker pool: the rotation of
/// healthy mountpoints, the theoretical count of them, and (in Mark6
/// mode) the one open file per mountpoint.
pub struct MultiFileArgs {
    pub work_list: VecDeque<PathBuf>,
    /// Mountpoints believed good; a failed write decrements this.
    pub good_count: usize,
    pub open_files: HashMap<PathBuf, File>,
    pub mk6: Option<Mk6Vars>,
}

impl MultiFileArgs {
    /// The list is shuffled once so successive runs stripe differently
    /// across the disks.
    pub fn new(mountpoints: Vec<PathBuf>, mk6: Option<Mk6Vars>) -> Self {
        let mut shuffled = mountpoints;
        shuffled.shuffle(&mut rand::thread_rng());
        let good_count = shuffled.len();
        MultiFileArgs {
            work_list: shuffled.into(),
            good_count,
            open_files: HashMap::new(),
            mk6,
        }
    }
}

/// Cleanup hook: close the per-mountpoint files of a Mark6 run.
pub fn close_open_files(args: &mut MultiFileArgs) {
    args.open_files.clear();
}

enum WriteOutcome {
    Written(Option<File>),
    MountpointBad,
}

fn write_chunk_to(
    mountpoint: &Path,
    chunk: &Chunk,
    mk6: Option<&Mk6Vars>,
    reuse: Option<File>,
) -> WriteOutcome {
    let full = mountpoint.join(&chunk.meta.file_name);
    let mut file = match reuse {
        Some(f) => f,
        None => {
            if let Some(parent) = full.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    warn!(path = %full.display(), error = %e, "failed to create chunk path");
                    return WriteOutcome::MountpointBad;
                }
            }
            let mut opts = OpenOptions::new();
            opts.write(true).create_new(true);
            let mut f = match opts.open(&full) {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %full.display(), error = %e, "failed to open chunk file");
                    return WriteOutcome::MountpointBad;
                }
            };
            if let Some(vars) = mk6 {
                let hdr = mk6_file_header(
                    (chunk.data.len() + 8) as i32,
                    vars,
                );
                if f.write_all(&hdr).is_err() {
                    return WriteOutcome::MountpointBad;
                }
            }
            f
        }
    };

    let write_result = (|| -> std::io::Result<()> {
        if mk6.is_some() {
            file.write_all(&mk6_block_header(
                chunk.meta.seq as i32,
                chunk.data.len() as i32,
            ))?;
        }
        file.write_all(chunk.data.as_slice())
    })();

    match write_result {
        Ok(()) => {
            if mk6.is_some() {
                WriteOutcome::Written(Some(file))
            } else {
                WriteOutcome::Written(None)
            }
        }
        Err(e) => {
            warn!(path = %full.display(), error = %e, "chunk write failed");
            if mk6.is_none() {
                let _ = fs::remove_file(&full);
            }
            WriteOutcome::MountpointBad
        }
    }
}

/// Worker stage striping chunks over the healthy mountpoints. Run with
/// several threads; the work-list doubles as the mutual exclusion over
/// each mountpoint.
pub fn parallel_writer(
    inq: &InQ<Chunk>,
    env: &SyncEnvelope<MultiFileArgs>,
) -> anyhow::Result<()> {
    debug!("parallel_writer: starting");
    while let Some(chunk) = inq.pop() {
        let mut written = false;
        let mut tried: HashSet<PathBuf> = HashSet::new();

        while !written {
            // wait for a mountpoint to become available
            let popped = {
                let mut guard = env.lock();
                loop {
                    if guard.cancelled {
                        break None;
                    }
                    let state = guard.user_mut();
                    if state.good_count == 0 {
                        break None;
                    }
                    if let Some(mp) = state.work_list.pop_front() {
                        break Some((mp, state.good_count));
                    }
                    guard = env.wait(guard);
                }
            };
            let Some((mp, good_count)) = popped else { break };

            if tried.contains(&mp) {
                // back on the list for someone else; if we cycled through
                // every good mountpoint this chunk is a loss
                let all_seen = tried.len() >= good_count;
                env.with(|st| {
                    if let Some(state) = st.user_opt_mut() {
                        state.work_list.push_back(mp.clone());
                    }
                });
                if all_seen {
                    break;
                }
                continue;
            }
            tried.insert(mp.clone());

            let reuse = if chunk_uses_open_files(env) {
                env.with(|st| {
                    st.user_opt_mut()
                        .and_then(|state| state.open_files.remove(&mp))
                })
            } else {
                None
            };
            let mk6 = env.lock().user().mk6;

            match write_chunk_to(&mp, &chunk, mk6.as_ref(), reuse) {
                WriteOutcome::Written(keep_open) => {
                    written = true;
                    env.with(|st| {
                        if let Some(state) = st.user_opt_mut() {
                            if let Some(f) = keep_open {
                                state.open_files.insert(mp.clone(), f);
                            }
                            state.work_list.push_back(mp.clone());
                        }
                    });
                }
                WriteOutcome::MountpointBad => {
                    error!(
                        mountpoint = %mp.display(),
                        "mountpoint possibly bad, removing it from rotation"
                    );
                    env.with(|st| {
                        if let Some(state) = st.user_opt_mut() {
                            state.good_count = state.good_count.saturating_sub(1);
                        }
                    });
                }
            }
        }

        if !written {
            error!(
                chunk = %chunk.meta.file_name,
                seq = chunk.meta.seq,
                "chunk could not be written to any mountpoint, dropping it"
            );
        }
    }
    debug!("parallel_writer: done");
    Ok(())
}

fn chunk_uses_open_files(env: &SyncEnvelope<MultiFileArgs>) -> bool {
    env.lock().user().mk6.is_some()
}

/// Enumerate the chunks of a scan across a set of mountpoints.
pub fn find_recording_chunks(scan: &str, mountpoints: &[PathBuf]) -> Vec<ChunkLocation> {
    let mut found = Vec::new();
    for mp in mountpoints {
        let dir = mp.join(scan);
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if chunk_seq_from_name(&name).is_some() {
                found.push(ChunkLocation {
                    mountpoint: mp.clone(),
                    relative: format!("{scan}/{name}"),
                });
            }
        }
    }
    found
}

/// Worker pool state for readers and senders: the list of chunks still to
/// process.
pub struct ChunkListArgs {
    pub chunks: VecDeque<ChunkLocation>,
}

/// Multi-threaded producer reading existing chunk files back into memory.
pub fn parallel_reader(
    outq: &OutQ<Chunk>,
    env: &SyncEnvelope<ChunkListArgs>,
) -> anyhow::Result<()> {
    loop {
        let loc = {
            let mut guard = env.lock();
            if guard.cancelled {
                break;
            }
            guard.user_mut().chunks.pop_front()
        };
        let Some(loc) = loc else { break };
        let full = loc.mountpoint.join(&loc.relative);
        let bytes = fs::read(&full).with_context(|| format!("reading {}", full.display()))?;
        let seq = chunk_seq_from_name(&loc.relative).unwrap_or(0);
        let meta = ChunkMeta {
            file_name: loc.relative.clone(),
            size: bytes.len() as u64,
            seq,
        };
        debug!(chunk = %meta.file_name, size = meta.size, "parallel_reader: read chunk");
        if !outq.push(Chunk {
            meta,
            data: Block::from_vec(bytes),
        }) {
            break;
        }
    }
    Ok(())
}

/// Intermediate stage loading chunk files named upstream. Runs
/// multi-threaded when the spindles allow it.
pub fn chunk_reader(
    inq: &InQ<ChunkLocation>,
    outq: &OutQ<Chunk>,
    _env: &SyncEnvelope<()>,
) -> anyhow::Result<()> {
    while let Some(loc) = inq.pop() {
        let full = loc.mountpoint.join(&loc.relative);
        let bytes = fs::read(&full).with_context(|| format!("reading {}", full.display()))?;
        let seq = chunk_seq_from_name(&loc.relative).unwrap_or(0);
        let meta = ChunkMeta {
            file_name: loc.relative.clone(),
            size: bytes.len() as u64,
            seq,
        };
        debug!(chunk = %meta.file_name, size = meta.size, "chunk_reader: read chunk");
        if !outq.push(Chunk {
            meta,
            data: Block::from_vec(bytes),
        }) {
            break;
        }
    }
    Ok(())
}

/// Sender-side state: where chunks go.
pub struct ChunkSendArgs {
    pub dest: DestSpec,
    pub parms: NetParms,
}

/// Multi-threaded consumer shipping chunks to a remote responder, one
/// connection per chunk: metadata header first, payload after, then wait
/// for the remote to close.
pub fn parallel_sender(
    inq: &InQ<Chunk>,
    env: &SyncEnvelope<ChunkSendArgs>,
) -> anyhow::Result<()> {
    let (dest, parms) = {
        let guard = env.lock();
        (guard.user().dest.clone(), guard.user().parms.clone())
    };
    while let Some(chunk) = inq.pop() {
        debug!(chunk = %chunk.meta.file_name, "parallel_sender: processing");
        let mut conn = match nfd::connect(&dest, &parms) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "parallel_sender: cannot reach responder");
                break;
            }
        };
        let Some(raw) = conn.raw() else { break };

        let mut md = MetaData::new();
        md.set(KEY_FILE_NAME, &chunk.meta.file_name)
            .set(KEY_FILE_SIZE, chunk.meta.size)
            .set(KEY_CHUNK_SEQ, chunk.meta.seq);
        let header = md.to_binary();
        let sent_hdr = nfd::write_loop(raw, &header)?;
        let sent = nfd::write_loop(raw, chunk.data.as_slice())?;
        if sent_hdr < header.len() || sent < chunk.data.len() {
            error!(chunk = %chunk.meta.file_name, "parallel_sender: short send");
            break;
        }
        conn.shutdown_wr();
        nfd::drain_until_close(raw);
        conn.close();
        debug!(chunk = %chunk.meta.file_name, "parallel_sender: done");
    }
    Ok(())
}

/// Initiator-side state of the chunk negotiation.
pub struct RsyncInitArgs {
    pub scan: String,
    pub mountpoints: Vec<PathBuf>,
    pub dest: DestSpec,
    pub parms: NetParms,
}

/// Producer negotiating with a remote responder which chunks of a scan
/// still need to travel, then emitting those chunk locations round-robin
/// across the mountpoints holding them.
pub fn rsync_initiator(
    outq: &OutQ<ChunkLocation>,
    env: &SyncEnvelope<RsyncInitArgs>,
) -> anyhow::Result<()> {
    let (scan, mountpoints, dest, parms) = {
        let guard = env.lock();
        let a = guard.user();
        (
            a.scan.clone(),
            a.mountpoints.clone(),
            a.dest.clone(),
            a.parms.clone(),
        )
    };

    let local = find_recording_chunks(&scan, &mountpoints);
    if local.is_empty() {
        warn!(scan = %scan, "rsync_initiator: no files found for scan");
        return Ok(());
    }
    info!(files = local.len(), scan = %scan, "rsync_initiator: starting negotiation");

    let names: Vec<&str> = local.iter().map(|c| c.relative.as_str()).collect();
    let payload = encode_path_list(&names);

    let mut md = MetaData::new();
    md.set(KEY_REQUEST_RSYNC, &scan)
        .set(KEY_PAYLOAD_SIZE, payload.len());

    let mut conn = nfd::connect(&dest, &parms)?;
    let raw = conn.raw().ok_or_else(|| anyhow::anyhow!("connection lost"))?;
    nfd::write_loop(raw, &md.to_binary())?;
    nfd::write_loop(raw, &payload)?;

    let reply = MetaData::read_from(raw)?;
    let reply_sz = reply
        .get_u64(KEY_REPLY_SIZE)
        .ok_or_else(|| anyhow::anyhow!("responder reply lacks {KEY_REPLY_SIZE}"))?;
    let list_type = reply
        .get(KEY_LIST_TYPE)
        .ok_or_else(|| anyhow::anyhow!("responder reply lacks {KEY_LIST_TYPE}"))?
        .to_string();
    let mut listed = vec![0u8; reply_sz as usize];
    let n = nfd::read_loop(raw, &mut listed)?;
    anyhow::ensure!(n == listed.len(), "short rsync reply list");
    // a byte back tells the responder we have the whole reply
    let _ = nfd::write_loop(raw, &[1u8]);
    conn.close();

    let listed: HashSet<String> = decode_path_list(&listed).into_iter().collect();
    debug!(list_type = %list_type, listed = listed.len(), "rsync_initiator: reply");

    // `have` lists what the remote already holds; `need` what it wants
    let still_needed: Vec<ChunkLocation> = local
        .into_iter()
        .filter(|c| match list_type.as_str() {
            "have" => !listed.contains(&c.relative),
            _ => listed.contains(&c.relative),
        })
        .collect();
    info!(
        remaining = still_needed.len(),
        "rsync_initiator: files left to send after filtering"
    );

    // round-robin over mountpoints so parallel senders spread the read
    // load across spindles
    let mut per_mp: HashMap<PathBuf, VecDeque<ChunkLocation>> = HashMap::new();
    let mut order: Vec<PathBuf> = Vec::new();
    for c in still_needed {
        if !per_mp.contains_key(&c.mountpoint) {
            order.push(c.mountpoint.clone());
        }
        per_mp.entry(c.mountpoint.clone()).or_default().push_back(c);
    }
    'emit: loop {
        let mut emitted = false;
        for mp in &order {
            if let Some(q) = per_mp.get_mut(mp) {
                if let Some(c) = q.pop_front() {
                    emitted = true;
                    if !outq.push(c) {
                        break 'emit;
                    }
                }
            }
        }
        if !emitted {
            break;
        }
    }
    debug!("rsync_initiator: done");
    Ok(())
}

/// Responder-side state: the listener plus where this host records.
pub struct RsyncRespArgs {
    pub fd: FdArgs,
    pub scan_root: Vec<PathBuf>,
}

/// Cancel hook for the responder: close the listener and kick whatever
/// worker sits in `accept`.
pub fn responder_closer(env: &SyncEnvelope<RsyncRespArgs>) {
    env.with(|st| {
        if let Some(args) = st.user_opt_mut() {
            crate::args::close_and_kick_locked(&mut args.fd);
        }
    });
}

/// Server loop answering initiators: incoming chunks flow downstream,
/// rsync requests are answered with the shorter of the have/need lists.
/// Runs multi-threaded; each worker accepts independently.
pub fn rsync_responder(
    outq: &OutQ<Chunk>,
    env: &SyncEnvelope<RsyncRespArgs>,
) -> anyhow::Result<()> {
    install_wakeup_handler();
    let (raw, roots) = {
        let mut guard = env.lock();
        if guard.cancelled {
            return Ok(());
        }
        let a = guard.user_mut();
        let Some(raw) = a.fd.net.raw() else {
            return Ok(());
        };
        a.fd.register_thread();
        (raw, a.scan_root.clone())
    };

    loop {
        let (conn, peer) = match nfd::accept(raw) {
            Ok(x) => x,
            Err(e) if signal::is_termination(&e) => break,
            Err(e) => {
                env.with(|st| {
                    if let Some(a) = st.user_opt_mut() {
                        a.fd.clear_thread();
                    }
                });
                return Err(e.into());
            }
        };
        debug!(?peer, "rsync_responder: connection");
        if let Err(e) = serve_one(&conn, &roots, outq) {
            // one bad client does not take the responder down
            warn!(error = %e, "rsync_responder: request failed");
        }
        drop(conn);
        if env.cancelled() {
            break;
        }
    }
    env.with(|st| {
        if let Some(a) = st.user_opt_mut() {
            a.fd.clear_thread();
        }
    });
    debug!("rsync_responder: done");
    Ok(())
}

fn serve_one(
    conn: &std::os::fd::OwnedFd,
    roots: &[PathBuf],
    outq: &OutQ<Chunk>,
) -> anyhow::Result<()> {
    use std::os::fd::AsRawFd;
    let raw = conn.as_raw_fd();
    let md = MetaData::read_from(raw)?;

    if let Some(file_name) = md.get(KEY_FILE_NAME) {
        // incoming chunk
        let size = md
            .get_u64(KEY_FILE_SIZE)
            .ok_or_else(|| anyhow::anyhow!("chunk header lacks {KEY_FILE_SIZE}"))?;
        let seq = md
            .get_u64(KEY_CHUNK_SEQ)
            .map(|s| s as u32)
            .or_else(|| chunk_seq_from_name(file_name))
            .unwrap_or(0);
        let mut buf = vec![0u8; size as usize];
        let n = nfd::read_loop(raw, &mut buf)?;
        anyhow::ensure!(n == buf.len(), "short chunk payload: {n} of {size}");
        let meta = ChunkMeta {
            file_name: file_name.to_string(),
            size,
            seq,
        };
        anyhow::ensure!(
            outq.push(Chunk {
                meta,
                data: Block::from_vec(buf),
            }),
            "downstream refused chunk"
        );
        return Ok(());
    }

    if let Some(scan) = md.get(KEY_REQUEST_RSYNC) {
        let payload_sz = md
            .get_u64(KEY_PAYLOAD_SIZE)
            .ok_or_else(|| anyhow::anyhow!("rsync request lacks {KEY_PAYLOAD_SIZE}"))?;
        let mut raw_list = vec![0u8; payload_sz as usize];
        let n = nfd::read_loop(raw, &mut raw_list)?;
        anyhow::ensure!(n == raw_list.len(), "short rsync request list");
        let remote: Vec<String> = decode_path_list(&raw_list);
        let local: HashSet<String> = find_recording_chunks(scan, roots)
            .into_iter()
            .map(|c| c.relative)
            .collect();

        let (have, need): (Vec<_>, Vec<_>) =
            remote.into_iter().partition(|p| local.contains(p));

        // reply with whichever list is shorter
        let (list_type, list) = if have.len() < need.len() {
            ("have", have)
        } else {
            ("need", need)
        };
        let payload = encode_path_list(&list);
        let mut reply = MetaData::new();
        reply
            .set(KEY_LIST_TYPE, list_type)
            .set(KEY_REPLY_SIZE, payload.len());
        nfd::write_loop(raw, &reply.to_binary())?;
        nfd::write_loop(raw, &payload)?;
        // keep the socket open until the remote has read everything
        let mut ackbyte = [0u8; 1];
        let _ = nfd::read_loop(raw, &mut ackbyte);
        return Ok(());
    }

    anyhow::bail!("request carries neither a chunk nor an rsync query")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_names_roundtrip() {
        let name = chunk_name("exp_st_042", 7);
        assert_eq!(name, "exp_st_042/exp_st_042.00000007");
        assert_eq!(chunk_seq_from_name(&name), Some(7));
        assert_eq!(chunk_seq_from_name("noext"), None);
        assert_eq!(chunk_seq_from_name("a.123"), None);
    }

    #[test]
    fn mk6_headers_have_the_right_shape() {
        let vars = Mk6Vars {
            packet_format: 0,
            packet_size: 8224,
        };
        let fh = mk6_file_header(10008, &vars);
        assert_eq!(fh.len(), 20);
        assert_eq!(&fh[0..4], &MK6_SYNC.to_le_bytes());
        let bh = mk6_block_header(3, 10000);
        assert_eq!(bh.len(), 8);
        assert_eq!(&bh[0..4], &3i32.to_le_bytes());
        assert_eq!(&bh[4..8], &10000i32.to_le_bytes());
    }

    #[test]
    fn find_chunks_across_mountpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let mps: Vec<PathBuf> = (0..3).map(|i| tmp.path().join(format!("disk{i}"))).collect();
        for (i, mp) in mps.iter().enumerate() {
            let dir = mp.join("scan1");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("scan1.{i:08}")), b"x").unwrap();
        }
        // a file that does not match the naming stays invisible
        fs::write(mps[0].join("scan1/README"), b"x").unwrap();

        let found = find_recording_chunks("scan1", &mps);
        assert_eq!(found.len(), 3);
        let seqs: HashSet<u32> = found
            .iter()
            .filter_map(|c| chunk_seq_from_name(&c.relative))
            .collect();
        assert_eq!(seqs, HashSet::from([0, 1, 2]));
    }
}
