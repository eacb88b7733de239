//! Shared user state for reader/writer stages working on a file
//! descriptor.

use chain::Blockpool;
use netio::signal::{self, ThreadId};
use netio::{NetFd, NetParms};
use vlbi_types::{FrameLayout, SenderTable, StreamStats};

/// User state of every fd-bound stage: the descriptor, the transfer
/// parameters and the bookkeeping a cancel hook or an operator probe needs
/// to reach.
pub struct FdArgs {
    pub net: NetFd,
    pub parms: NetParms,
    /// Declared data format, where the stage cares (fill construction).
    pub layout: Option<FrameLayout>,
    /// Thread currently blocked on the descriptor, if any. Cleared by the
    /// thread itself before it exits so a late kick cannot hit a corpse.
    pub thread: Option<ThreadId>,
    /// Pool the stage draws its blocks from; created by the stage itself
    /// once it knows its sizes.
    pub pool: Option<Blockpool>,
    /// Push trailing partial blocks downstream instead of dropping them.
    pub allow_variable_block_size: bool,
    /// Interpret only the low 32 bits of incoming sequence numbers.
    pub seqnr_32bit: bool,
    /// Identification token written ahead of the stream on iTCP.
    pub itcp_id: Option<String>,
    /// fdatasync after this many written bytes; 0 = never.
    pub sync_bytes: u64,
    /// Accept a connection on the (listening) descriptor before reading.
    pub listening: bool,
    /// Accounting for the (single) sequenced peer.
    pub stats: StreamStats,
    /// Per-source accounting where several senders share one socket.
    pub senders: SenderTable,
    pub bytes: u64,
    pub finished: bool,
}

impl FdArgs {
    pub fn new(net: NetFd, parms: NetParms) -> Self {
        FdArgs {
            net,
            parms,
            layout: None,
            thread: None,
            pool: None,
            allow_variable_block_size: false,
            seqnr_32bit: false,
            itcp_id: None,
            sync_bytes: 0,
            listening: false,
            stats: StreamStats::default(),
            senders: SenderTable::default(),
            bytes: 0,
            finished: false,
        }
    }

    pub fn with_layout(mut self, layout: FrameLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn variable_block_size(mut self, yes: bool) -> Self {
        self.allow_variable_block_size = yes;
        self
    }

    pub fn listening(mut self, yes: bool) -> Self {
        self.listening = yes;
        self
    }

    /// Mark the calling thread as the one blocked on this descriptor.
    pub fn register_thread(&mut self) {
        self.thread = Some(signal::current_thread());
    }

    pub fn clear_thread(&mut self) {
        self.thread = None;
    }
}

/// Close the descriptor and kick whatever thread is parked in a syscall
/// on it. Call with the owning envelope locked.
pub fn close_and_kick_locked(args: &mut FdArgs) {
    args.net.close();
    if let Some(tid) = args.thread.take() {
        if let Err(e) = signal::kick(tid) {
            tracing::debug!(error = %e, "wakeup signal not delivered");
        }
    }
}

/// The standard cancel hook for fd-bound stages.
pub fn close_and_kick(env: &chain::SyncEnvelope<FdArgs>) {
    env.with(|st| {
        if let Some(args) = st.user_opt_mut() {
            close_and_kick_locked(args);
        }
    });
}

/// Cancel hook holding the stop back until the stage flagged itself
/// `finished` -- which it does only after flushing any trailing data into
/// its (still enabled) output queue. Bounded so a wedged stage cannot
/// hang the teardown forever.
pub fn wait_until_finished(env: &chain::SyncEnvelope<FdArgs>) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut guard = env.lock();
    loop {
        match guard.user_opt() {
            Some(args) if !args.finished => {}
            _ => break,
        }
        let (g, _) = env.wait_timeout(guard, std::time::Duration::from_millis(50));
        guard = g;
        if std::time::Instant::now() >= deadline {
            tracing::warn!("stage did not flag finished in time");
            break;
        }
    }
}
