//! Processing-chain engine for high-rate data movement.
//!
//! A [`Chain`] is an ordered pipeline of stages separated by bounded queues.
//! Every stage runs on one or more OS threads; the only synchronization
//! between stages is the queue between them, and all shutdown choreography
//! (hard cancel, graceful drain) is expressed by disabling those queues in
//! the right order.

pub mod block;
pub mod chain;
pub mod error;
pub mod queue;
pub mod sync;

pub use block::{Block, Blockpool, MemStat};
pub use chain::{Chain, StepHandle};
pub use error::ChainError;
pub use queue::{BoundedQueue, InQ, OutQ, PopResult};
pub use sync::SyncEnvelope;
