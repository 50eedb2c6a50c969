//! Completion announcements: queueing, flow control, and the announce
//! flow that turns a finished child run into a message for its parent.

pub mod flow;
pub mod queue;
pub mod stats;

pub use flow::{FlowOptions, FlowResult, run_subagent_announce_flow};
pub use queue::{AnnounceMode, AnnounceQueue, Announcement, Disposition};
pub use stats::RunStats;
