//! File-descriptor level network I/O: protocol dispatch, sequence-numbered
//! datagram operations, the metadata wire codec and thread wakeup plumbing.
//!
//! Everything here works on raw file descriptors on purpose: reader and
//! writer threads park inside blocking syscalls, and the cancellation story
//! (close the fd from the outside, kick the thread with SIGUSR1, treat
//! `EINTR`/`EBADF` as a normal end) only composes at that level.

pub mod error;
pub mod fd;
pub mod ipd;
pub mod metadata;
pub mod netparms;
pub mod protocol;
pub mod signal;
pub mod wire;

pub use error::NetError;
pub use fd::NetFd;
pub use netparms::NetParms;
pub use protocol::{DestSpec, Protocol};
