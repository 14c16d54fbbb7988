//! # R0N MQTT
//!
//! An MQTT 3.1 / 3.1.1 channel engine: one reactor thread multiplexing many
//! client and broker connections, with a blocking API and a callback API on
//! top.
//!
//! ## Architecture
//!
//! - [`packet`]: the wire codec for all fourteen packet types.
//! - [`channel`]: one TCP connection each, with its send queue, in-flight
//!   map, message-id allocation, resend and keep-alive timers.
//! - [`command`]: pending operations, the hand-off between caller threads
//!   and the reactor.
//! - [`reactor`]: the event loop, [`reactor::ChannelManager`] and the
//!   [`reactor::Handler`] callbacks.
//! - [`client`] and [`broker`]: a blocking client and a small broker built on
//!   the engine.
//!
//! Callers submit operations from any thread; the reactor runs them in FIFO
//! order between I/O passes. Handlers run on the reactor thread and may send
//! on any channel in-line.

pub mod broker;
pub mod channel;
pub mod client;
pub mod command;
pub mod config;
pub mod logging;
pub mod packet;
pub mod reactor;
pub mod topic;

pub use channel::ChannelId;
pub use command::{CommandError, CommandResult, PendingOperation};
pub use packet::{Message, MqttError, MqttResult, Packet, QoS};
pub use reactor::{BlockingChannelManager, ChannelContext, ChannelManager, Handler};
