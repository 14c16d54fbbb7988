//! CONNECT options.

use crate::config::ClientConfig;
use crate::packet::{Connect, ProtocolVersion, QoS, Will};
use bytes::Bytes;
use std::time::Duration;

/// What a client announces in CONNECT.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client identifier.
    pub client_id: String,
    /// Username, if any.
    pub username: Option<String>,
    /// Password, if any.
    pub password: Option<Bytes>,
    /// Message the broker publishes if the connection drops.
    pub will: Option<Will>,
    /// Keep-alive interval, truncated to whole seconds.
    pub keep_alive: Duration,
    /// Clean session flag.
    pub clean_session: bool,
    /// Protocol revision.
    pub protocol: ProtocolVersion,
}

impl ConnectOptions {
    /// Options with defaults for everything but the client id.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::from_config(&ClientConfig::default(), client_id)
    }

    /// Options seeded from the `[client]` configuration section.
    pub fn from_config(config: &ClientConfig, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: None,
            password: None,
            will: None,
            keep_alive: config.keep_alive,
            clean_session: config.clean_session,
            protocol: config.protocol,
        }
    }

    /// Set username and password.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the will message.
    #[must_use]
    pub fn with_will(
        mut self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        self.will = Some(Will {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        });
        self
    }

    /// Set the keep-alive interval.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the clean session flag.
    #[must_use]
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Set the protocol revision.
    #[must_use]
    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    /// Build the CONNECT packet.
    pub fn to_connect(&self) -> Connect {
        let mut connect = Connect::new(self.protocol, self.client_id.clone());
        connect.clean_session = self.clean_session;
        connect.keep_alive = u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX);
        connect.username = self.username.clone();
        connect.password = self.password.clone();
        connect.will = self.will.clone();
        connect
    }
}
