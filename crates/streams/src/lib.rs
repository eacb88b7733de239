//! Stage functions for the data-movement chains: header-search framing,
//! sequence-numbered UDP reception with reordering recovery, per-protocol
//! writers, the tag-routed fan-out writer and the striped multi-destination
//! recording path.
//!
//! Every function here has a chain stage signature and is wired into a
//! [`chain::Chain`] by whoever owns the transfer.

pub mod args;
pub mod check;
pub mod framer;
pub mod gen;
pub mod multi_writer;
pub mod multisend;
pub mod readers;
pub mod udps_rx;
pub mod writers;

pub use args::FdArgs;
pub use udps_rx::WindowBlock;
