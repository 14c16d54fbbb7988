//! The single-threaded channel engine.
//!
//! One reactor thread owns a set of channels and a readiness poller. Other
//! threads talk to it only through commands queued by a [`ChannelManager`];
//! each command returns a [`PendingOperation`](crate::command::PendingOperation)
//! the caller can wait on or attach a callback to. Each pass of the loop:
//!
//! 1. waits for socket readiness, a wake-up or the next timer deadline,
//! 2. runs every queued command in submission order,
//! 3. reads, writes and finishes connects on ready channels,
//! 4. runs resend and keep-alive timers and flushes pending writes.
//!
//! Handler callbacks run inside steps 2 to 4 and may queue messages on any
//! channel of the same reactor directly through their [`ChannelContext`].

mod event_loop;
mod handler;
mod manager;
mod metrics;
mod operation;
mod stats;
mod status;

pub use event_loop::DetachedChannel;
pub(crate) use handler::{dispatch, Scope};
pub use handler::{ChannelContext, Handler, HandlerResult};
pub use manager::{resolve_address, BlockingChannelManager, ChannelManager, DEFAULT_PORT};
pub use metrics::MetricsPayload;
pub use stats::StatsSnapshot;
pub use status::EngineStatus;
