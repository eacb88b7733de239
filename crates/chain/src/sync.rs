//! Per-stage synchronization envelope.
//!
//! Every stage owns one envelope: a mutex+condvar around the stage's user
//! state plus the cancellation flag. All worker threads of a multi-threaded
//! stage share the same envelope (and therefore the same user state).
//!
//! Any condition-wait loop on the envelope must also test `cancelled`;
//! a loop that only waits for a state change will deadlock on shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// State guarded by the envelope's mutex.
pub struct EnvState<U> {
    /// Set (and the condvar broadcast) when the chain is hard-cancelled.
    pub cancelled: bool,
    user: Option<U>,
}

impl<U> EnvState<U> {
    /// The stage's user state. Panics if called outside a run; the chain
    /// installs the state before any stage thread starts and removes it
    /// only after every thread has joined.
    pub fn user(&self) -> &U {
        self.user.as_ref().expect("user state not installed")
    }

    pub fn user_mut(&mut self) -> &mut U {
        self.user.as_mut().expect("user state not installed")
    }

    /// Like [`user`](Self::user) but tolerant of the state already being
    /// torn down; hooks racing the end of a run use this.
    pub fn user_opt(&self) -> Option<&U> {
        self.user.as_ref()
    }

    pub fn user_opt_mut(&mut self) -> Option<&mut U> {
        self.user.as_mut()
    }

    pub(crate) fn install(&mut self, user: U) {
        self.user = Some(user);
        self.cancelled = false;
    }

    pub(crate) fn clear(&mut self) {
        self.user = None;
    }
}

/// Mutex + condvar wrapping a stage's user state, cancellation flag,
/// downstream-queue-depth hint and stage id.
pub struct SyncEnvelope<U> {
    state: Mutex<EnvState<U>>,
    cond: Condvar,
    qdepth: AtomicUsize,
    step: usize,
}

impl<U> SyncEnvelope<U> {
    /// Envelope living outside any chain, user state pre-installed. Stages
    /// that run private worker pools (the fan-out writer) hand these to
    /// their workers.
    pub fn standalone(step: usize, user: U) -> Self {
        let env = SyncEnvelope::new(step);
        env.lock().install(user);
        env
    }

    pub(crate) fn new(step: usize) -> Self {
        SyncEnvelope {
            state: Mutex::new(EnvState {
                cancelled: false,
                user: None,
            }),
            cond: Condvar::new(),
            qdepth: AtomicUsize::new(0),
            step,
        }
    }

    /// Total queue capacity downstream of this stage, fixed at build time.
    /// Stages use it to self-tune buffering (pool sizes, readahead).
    pub fn qdepth(&self) -> usize {
        self.qdepth.load(Ordering::Relaxed)
    }

    pub(crate) fn add_qdepth(&self, n: usize) {
        self.qdepth.fetch_add(n, Ordering::Relaxed);
    }

    /// The stage id allocated at build time.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn lock(&self) -> MutexGuard<'_, EnvState<U>> {
        self.state.lock().unwrap()
    }

    /// Wait on the envelope's condition. Call only with the lock held, in a
    /// loop that also tests `cancelled`.
    pub fn wait<'a>(&self, guard: MutexGuard<'a, EnvState<U>>) -> MutexGuard<'a, EnvState<U>> {
        self.cond.wait(guard).unwrap()
    }

    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, EnvState<U>>,
        dur: Duration,
    ) -> (MutexGuard<'a, EnvState<U>>, bool) {
        let (guard, to) = self.cond.wait_timeout(guard, dur).unwrap();
        (guard, to.timed_out())
    }

    pub fn notify_one(&self) {
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Run `f` with the lock held, then broadcast. The envelope-flavoured
    /// equivalent of a monitor call.
    pub fn with<R>(&self, f: impl FnOnce(&mut EnvState<U>) -> R) -> R {
        let r = f(&mut self.lock());
        self.notify_all();
        r
    }

    /// Snapshot of the cancellation flag.
    pub fn cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Set the cancellation flag and broadcast. Chains do this on `stop()`;
    /// standalone envelopes are cancelled by whoever owns them.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.notify_all();
    }
}
