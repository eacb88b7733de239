//! Error types for chain construction and control.

use thiserror::Error;

/// Errors raised while building or controlling a chain.
///
/// Everything in here is a programming or sequencing error on the caller's
/// side; stage-internal failures never surface through this type but
/// collapse the pipeline through queue disabling instead.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("chain already has a producer")]
    DuplicateProducer,

    #[error("chain has no producer yet")]
    NoProducer,

    #[error("chain is closed (a consumer has been appended)")]
    Closed,

    #[error("chain is not closed; append a consumer before running")]
    NotClosed,

    #[error("element type mismatch: step {step} expects input {expected}, previous step produces {found}")]
    TypeMismatch {
        step: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("chain is already running")]
    AlreadyRunning,

    #[error("chain is not running")]
    NotRunning,

    #[error("step handle does not belong to this chain")]
    ForeignHandle,

    #[error("step {0} has no user state installed")]
    NoUserState(usize),

    #[error("cannot set thread count on step {0} while the chain is running")]
    Running(usize),

    #[error("failed to spawn stage thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChainError>;
