//! Blocking MQTT client built on the channel engine.
//!
//! ```no_run
//! use r0n_mqtt::client::{ConnectOptions, MqttClient};
//! use r0n_mqtt::config::EngineConfig;
//! use r0n_mqtt::packet::QoS;
//! use r0n_mqtt::reactor::BlockingChannelManager;
//! use std::time::Duration;
//!
//! let manager = BlockingChannelManager::init(EngineConfig::default())?;
//! let mut client = MqttClient::connect(&manager, "localhost:1883", &ConnectOptions::new("demo"))?;
//! client.subscribe(&[("sensors/#", QoS::AtLeastOnce)])?;
//! client.publish("sensors/temp", "21.5", QoS::AtLeastOnce, false)?;
//! if let Some(message) = client.recv_timeout(Duration::from_secs(1))? {
//!     println!("{}: {:?}", message.topic, message.payload);
//! }
//! client.disconnect()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod blocking;
mod error;
mod options;

pub use blocking::MqttClient;
pub use error::{ClientError, ClientResult};
pub use options::ConnectOptions;
