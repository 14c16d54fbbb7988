//! # Mock broker
//!
//! A [`MockBroker`] is a [`Handler`](crate::reactor::Handler) for
//! broker-side channels. [`BrokerServer`] accepts TCP connections and opens
//! one such channel per socket.
//!
//! ```no_run
//! use r0n_mqtt::broker::{BrokerServer, MockBroker};
//! use r0n_mqtt::config::{BrokerConfig, EngineConfig};
//! use r0n_mqtt::reactor::ChannelManager;
//! use std::sync::Arc;
//!
//! let manager = ChannelManager::init(EngineConfig::default())?;
//! let broker = Arc::new(MockBroker::new(BrokerConfig::default()));
//! let server = BrokerServer::bind("127.0.0.1:1883", manager.clone(), broker)?;
//! println!("listening on {}", server.local_addr());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod mock;
mod server;
mod session;

pub use mock::MockBroker;
pub use server::{BrokerServer, ListenerStats};
