//! Shared VLBI data types: frame formats, the header-search contract,
//! fill-pattern construction and link statistics.

pub mod fill;
pub mod format;
pub mod frame;
pub mod search;
pub mod stats;

pub use fill::{fill_datagram, write_fill_pattern, FILL_PATTERN};
pub use format::{FrameFormat, FrameLayout, FrameValidator, VdifHeader};
pub use frame::{Frame, FrameTime, Tagged};
pub use search::BoyerMoore;
pub use stats::{SenderTable, StreamStats};
