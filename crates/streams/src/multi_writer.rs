//! Tag-routed fan-out writer.
//!
//! Input is a stream of tagged blocks; the tag selects a destination from
//! a configured map. Destinations resolving to the same connection target
//! share one descriptor and one writer thread with a small private queue,
//! so a stalling destination only stalls its own traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chain::{Block, BoundedQueue, InQ, SyncEnvelope};
use netio::{fd as nfd, DestSpec, NetParms};
use tracing::{debug, error, info, warn};
use vlbi_types::Tagged;

use crate::args::FdArgs;
use crate::writers::protocol_writer;

/// Queue depth between the dispatcher and each destination writer.
const DEST_QUEUE_DEPTH: usize = 10;

/// One connection target: private queue, writer state, writer thread.
pub struct DestState {
    pub queue: Arc<BoundedQueue<Block>>,
    pub env: Arc<SyncEnvelope<FdArgs>>,
}

/// Fan-out writer user state. `writers` is filled in once the stage
/// opens its destinations, so the cancel hook can reach every descriptor
/// and thread.
pub struct MultiWriterArgs {
    /// tag → destination spec (`proto://host:port`, `unix://path`, path).
    pub dests: HashMap<u64, String>,
    pub parms: NetParms,
    pub writers: Vec<DestState>,
}

impl MultiWriterArgs {
    pub fn new(dests: HashMap<u64, String>, parms: NetParms) -> Self {
        MultiWriterArgs {
            dests,
            parms,
            writers: Vec::new(),
        }
    }
}

/// Cancel hook: wake and wind down every destination writer.
pub fn multi_closer(env: &SyncEnvelope<MultiWriterArgs>) {
    env.with(|st| {
        if let Some(args) = st.user_opt_mut() {
            for dst in &args.writers {
                dst.env.cancel();
                dst.env.with(|wst| {
                    if let Some(fd_args) = wst.user_opt_mut() {
                        crate::args::close_and_kick_locked(fd_args);
                    }
                });
                dst.queue.disable();
            }
        }
    });
}

/// The dispatcher stage. Consumes `Tagged<Block>`; blocks with a tag
/// absent from the destination map are dropped silently.
pub fn multi_writer(
    inq: &InQ<Tagged<Block>>,
    env: &SyncEnvelope<MultiWriterArgs>,
) -> anyhow::Result<()> {
    let (dests, parms) = {
        let guard = env.lock();
        (guard.user().dests.clone(), guard.user().parms.clone())
    };
    anyhow::ensure!(!dests.is_empty(), "there are no destinations to send to");

    // open every unique connection target once
    let mut by_target: HashMap<String, usize> = HashMap::new();
    let mut states: Vec<DestState> = Vec::new();
    let mut threads: Vec<JoinHandle<()>> = Vec::new();
    let mut tag_state: HashMap<u64, usize> = HashMap::new();

    for (tag, spec_str) in &dests {
        let spec = DestSpec::parse(spec_str, parms.protocol)?;
        let key = spec.target_key();
        let idx = match by_target.get(&key) {
            Some(&idx) => idx,
            None => {
                let net = nfd::connect(&spec, &parms)?;
                let proto = net.proto;
                info!(target = %key, ?proto, "multi_writer: opened destination");
                let queue = Arc::new(BoundedQueue::<Block>::new(DEST_QUEUE_DEPTH));
                let mut fd_args = FdArgs::new(net, parms.clone());
                // dispatch failures on one leg must not kill the others
                fd_args.allow_variable_block_size = true;
                let wenv = Arc::new(SyncEnvelope::standalone(states.len(), fd_args));

                let tqueue = Arc::clone(&queue);
                let tenv = Arc::clone(&wenv);
                let tkey = key.clone();
                let handle = thread::Builder::new()
                    .name(format!("dest-{}", states.len()))
                    .spawn(move || {
                        let inq = InQ::new(Arc::clone(&tqueue));
                        if let Err(e) = protocol_writer(proto, &inq, &tenv) {
                            error!(target = %tkey, error = %e, "destination writer failed");
                        }
                        // upchain learns we are gone through the dead queue
                        tqueue.disable();
                    })?;
                threads.push(handle);
                states.push(DestState {
                    queue,
                    env: wenv,
                });
                by_target.insert(key, states.len() - 1);
                states.len() - 1
            }
        };
        tag_state.insert(*tag, idx);
    }

    // expose the writer states to the cancel hook
    env.with(|st| {
        if let Some(args) = st.user_opt_mut() {
            args.writers = states
                .iter()
                .map(|d| DestState {
                    queue: Arc::clone(&d.queue),
                    env: Arc::clone(&d.env),
                })
                .collect();
        }
    });

    debug!(destinations = states.len(), tags = tag_state.len(), "multi_writer: dispatching");

    while let Some(tb) = inq.pop() {
        let Some(&idx) = tag_state.get(&tb.tag) else {
            continue;
        };
        if !states[idx].queue.push(tb.item) {
            warn!(tag = tb.tag, "multi_writer: destination queue refused block");
            break;
        }
    }

    // wind down: drain the private queues, cancel, join, close
    for dst in &states {
        dst.queue.delayed_disable();
        dst.env.cancel();
    }
    for handle in threads {
        if handle.join().is_err() {
            error!("multi_writer: destination writer panicked");
        }
    }
    for dst in &states {
        dst.env.with(|st| {
            if let Some(fd_args) = st.user_opt_mut() {
                fd_args.net.close();
            }
        });
    }
    env.with(|st| {
        if let Some(args) = st.user_opt_mut() {
            args.writers.clear();
        }
    });
    info!("multi_writer: done");
    Ok(())
}
