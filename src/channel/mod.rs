//! Channels: one TCP connection each, with its send queue, in-flight table
//! and timers.
//!
//! A channel is owned by exactly one reactor and only ever touched from that
//! reactor's thread. Outside code refers to it by [`ChannelId`].

mod connection;
mod id;
mod keep_alive;
mod outbox;

pub use connection::{Channel, ChannelState};
pub(crate) use connection::{earliest, ChannelSettings};
pub use id::{ChannelId, MessageIdAllocator};
pub use keep_alive::{KeepAlive, KeepAliveAction, Role};
pub use outbox::{Delivery, Outbox, Unsent, Written};
