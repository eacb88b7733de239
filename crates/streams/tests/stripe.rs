//! Striped recording over a pool of mountpoints, including failure
//! isolation when one mountpoint goes bad.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chain::{Block, Chain, InQ, OutQ, SyncEnvelope};
use streams::multisend::{
    chunk_maker, chunk_seq_from_name, find_recording_chunks, parallel_reader, parallel_writer,
    Chunk, ChunkListArgs, MultiFileArgs,
};

const CHUNK_BYTES: usize = 4096;
const NCHUNKS: u64 = 300;

fn block_producer(outq: &OutQ<Block>, _env: &SyncEnvelope<()>) -> anyhow::Result<()> {
    for i in 0..NCHUNKS {
        let mut v = vec![0u8; CHUNK_BYTES];
        v[0] = (i & 0xff) as u8;
        if !outq.push(Block::from_vec(v)) {
            break;
        }
    }
    Ok(())
}

fn run_stripe(mountpoints: Vec<PathBuf>, workers: usize) -> (u64, usize) {
    let mut c = Chain::new();
    c.add_producer(16, || (), block_producer).unwrap();
    c.add_stage(16, || "scan7".to_string(), chunk_maker).unwrap();
    let writer = c
        .add_consumer(
            move || MultiFileArgs::new(mountpoints.clone(), None),
            parallel_writer,
        )
        .unwrap();
    c.set_threads(&writer, workers).unwrap();

    let good = Arc::new(std::sync::Mutex::new(0usize));
    {
        let good = Arc::clone(&good);
        c.register_cleanup(&writer, move |env: &SyncEnvelope<MultiFileArgs>| {
            let guard = env.lock();
            if let Some(s) = guard.user_opt() {
                *good.lock().unwrap() = s.good_count;
            }
        })
        .unwrap();
    }

    c.run().unwrap();
    c.wait();
    let good_count = *good.lock().unwrap();
    (NCHUNKS, good_count)
}

fn count_chunks(mountpoints: &[PathBuf]) -> (usize, HashSet<u32>) {
    let mut seqs = HashSet::new();
    let mut n = 0;
    for loc in find_recording_chunks("scan7", mountpoints) {
        n += 1;
        if let Some(s) = chunk_seq_from_name(&loc.relative) {
            seqs.insert(s);
        }
    }
    (n, seqs)
}

#[test]
fn stripes_across_all_mountpoints() {
    let tmp = tempfile::tempdir().unwrap();
    let mps: Vec<PathBuf> = (0..3).map(|i| tmp.path().join(format!("disk{i}"))).collect();
    for mp in &mps {
        std::fs::create_dir_all(mp).unwrap();
    }

    let (expected, good) = run_stripe(mps.clone(), 4);
    let (n, seqs) = count_chunks(&mps);
    assert_eq!(n as u64, expected, "every chunk landed exactly once");
    assert_eq!(seqs.len() as u64, expected, "no duplicate sequence numbers");
    assert_eq!(good, 3, "all mountpoints stayed good");

    // each mountpoint took a share of the stripe
    for mp in &mps {
        let here = find_recording_chunks("scan7", std::slice::from_ref(mp)).len();
        assert!(here > 0, "{} received nothing", mp.display());
    }
}

#[test]
fn bad_mountpoint_is_isolated() {
    let tmp = tempfile::tempdir().unwrap();
    let mps: Vec<PathBuf> = (0..3).map(|i| tmp.path().join(format!("disk{i}"))).collect();
    std::fs::create_dir_all(&mps[0]).unwrap();
    // disk1 is a plain file: every path creation under it must fail
    std::fs::write(&mps[1], b"broken").unwrap();
    std::fs::create_dir_all(&mps[2]).unwrap();

    let start = Instant::now();
    let (expected, good) = run_stripe(mps.clone(), 4);
    assert!(start.elapsed() < Duration::from_secs(30));

    let good_mps = [mps[0].clone(), mps[2].clone()];
    let (n, seqs) = count_chunks(&good_mps);
    assert_eq!(n as u64, expected, "no chunk was lost");
    assert_eq!(seqs.len() as u64, expected);
    assert_eq!(good, 2, "the bad mountpoint left the rotation");
}

#[test]
fn striped_recording_reads_back() {
    let tmp = tempfile::tempdir().unwrap();
    let mps: Vec<PathBuf> = (0..3).map(|i| tmp.path().join(format!("disk{i}"))).collect();
    for mp in &mps {
        std::fs::create_dir_all(mp).unwrap();
    }
    run_stripe(mps.clone(), 3);

    // read every chunk back through the parallel reader pool
    let list = find_recording_chunks("scan7", &mps);
    assert_eq!(list.len() as u64, NCHUNKS);

    let mut c = Chain::new();
    let reader = c
        .add_producer(
            16,
            move || ChunkListArgs {
                chunks: list.clone().into(),
            },
            parallel_reader,
        )
        .unwrap();
    c.set_threads(&reader, 3).unwrap();
    let sink = c
        .add_consumer(
            || (0u64, 0u64),
            |inq: &InQ<Chunk>, env: &SyncEnvelope<(u64, u64)>| {
                while let Some(chunk) = inq.pop() {
                    assert_eq!(chunk.data.len(), CHUNK_BYTES);
                    assert_eq!(chunk.data.as_slice()[0], (chunk.meta.seq & 0xff) as u8);
                    let mut guard = env.lock();
                    let totals = guard.user_mut();
                    totals.0 += 1;
                    totals.1 += chunk.data.len() as u64;
                }
                Ok(())
            },
        )
        .unwrap();
    let read_back = Arc::new(std::sync::Mutex::new((0u64, 0u64)));
    {
        let read_back = Arc::clone(&read_back);
        c.register_cleanup(&sink, move |env: &SyncEnvelope<(u64, u64)>| {
            if let Some(t) = env.lock().user_opt() {
                *read_back.lock().unwrap() = *t;
            }
        })
        .unwrap();
    }
    c.run().unwrap();
    c.wait();
    let (n, bytes) = *read_back.lock().unwrap();
    assert_eq!(n, NCHUNKS);
    assert_eq!(bytes, NCHUNKS * CHUNK_BYTES as u64);
}

#[test]
fn no_good_mountpoints_drops_chunks_but_terminates() {
    let tmp = tempfile::tempdir().unwrap();
    let mp = tmp.path().join("disk0");
    std::fs::write(&mp, b"broken").unwrap();

    let (_, good) = run_stripe(vec![mp], 2);
    assert_eq!(good, 0);
}

#[test]
fn chunks_flow_through_the_maker_in_order() {
    let mut c = Chain::new();
    c.add_producer(8, || (), |outq: &OutQ<Block>, _env: &SyncEnvelope<()>| {
        for _ in 0..10 {
            if !outq.push(Block::from_vec(vec![0u8; 64])) {
                break;
            }
        }
        Ok(())
    })
    .unwrap();
    c.add_stage(8, || "s".to_string(), chunk_maker).unwrap();
    let sink = c
        .add_consumer(Vec::new, |inq: &InQ<Chunk>, env: &SyncEnvelope<Vec<u32>>| {
            while let Some(chunk) = inq.pop() {
                env.lock().user_mut().push(chunk.meta.seq);
            }
            Ok(())
        })
        .unwrap();
    let seqs = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let seqs = Arc::clone(&seqs);
        c.register_cleanup(&sink, move |env: &SyncEnvelope<Vec<u32>>| {
            if let Some(v) = env.lock().user_opt() {
                *seqs.lock().unwrap() = v.clone();
            }
        })
        .unwrap();
    }
    c.run().unwrap();
    c.wait();
    assert_eq!(*seqs.lock().unwrap(), (0..10).collect::<Vec<u32>>());
}
