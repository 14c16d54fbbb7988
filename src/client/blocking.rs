//! Blocking MQTT client on top of a [`BlockingChannelManager`].

use super::error::{ClientError, ClientResult};
use super::options::ConnectOptions;
use crate::channel::ChannelId;
use crate::packet::{
    ConnAck, MqttError, Packet, PubAck, Publish, QoS, Subscribe, Subscription, Unsubscribe,
};
use crate::reactor::{BlockingChannelManager, ChannelContext, Handler, HandlerResult};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug)]
enum ClientEvent {
    ConnAck(ConnAck),
    Publish(Publish),
    Closed(Option<String>),
}

/// Forwards what the reactor receives to the client's thread.
struct ClientHandler {
    events: Sender<ClientEvent>,
}

impl ClientHandler {
    fn forward(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("Client dropped; event discarded");
        }
    }
}

impl Handler for ClientHandler {
    fn channel_closed(&self, _ctx: &mut ChannelContext<'_, '_>, cause: Option<&MqttError>) {
        self.forward(ClientEvent::Closed(cause.map(ToString::to_string)));
    }

    fn on_conn_ack(&self, _ctx: &mut ChannelContext<'_, '_>, packet: &ConnAck) -> HandlerResult {
        self.forward(ClientEvent::ConnAck(*packet));
        Ok(())
    }

    fn on_publish(&self, ctx: &mut ChannelContext<'_, '_>, packet: &Publish) -> HandlerResult {
        if packet.qos == QoS::AtLeastOnce {
            ctx.send(Packet::PubAck(PubAck::new(packet.message_id)))?;
        }
        self.forward(ClientEvent::Publish(packet.clone()));
        Ok(())
    }
}

/// A connected MQTT client. Every call blocks for at most the manager's
/// timeout.
#[derive(Debug)]
pub struct MqttClient {
    manager: BlockingChannelManager,
    channel: ChannelId,
    client_id: String,
    events: Receiver<ClientEvent>,
    inbox: VecDeque<Publish>,
    closed: Option<String>,
}

impl MqttClient {
    /// Open a channel to `address`, send CONNECT and wait for CONNACK.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionRefused`] for a non-zero return code,
    /// [`ClientError::Timeout`] when no CONNACK arrives in time, or the
    /// engine error that stopped the connect.
    pub fn connect(
        manager: &BlockingChannelManager,
        address: &str,
        options: &ConnectOptions,
    ) -> ClientResult<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handler = Arc::new(ClientHandler { events: tx });
        let channel = manager.new_client_channel(address, handler)?;

        let mut client = Self {
            manager: manager.clone(),
            channel,
            client_id: options.client_id.clone(),
            events: rx,
            inbox: VecDeque::new(),
            closed: None,
        };

        if let Err(e) = client.handshake(options) {
            client.abort();
            return Err(e);
        }
        info!(client_id = %client.client_id, channel = %channel, "Client connected");
        Ok(client)
    }

    fn handshake(&mut self, options: &ConnectOptions) -> ClientResult<()> {
        self.manager
            .send(self.channel, Packet::Connect(options.to_connect()))?;

        let deadline = Instant::now() + self.manager.timeout();
        loop {
            match self.events.recv_deadline(deadline) {
                Ok(ClientEvent::ConnAck(ack)) if ack.return_code.is_accepted() => return Ok(()),
                Ok(ClientEvent::ConnAck(ack)) => {
                    return Err(ClientError::ConnectionRefused(ack.return_code))
                },
                Ok(ClientEvent::Publish(publish)) => self.inbox.push_back(publish),
                Ok(ClientEvent::Closed(cause)) => {
                    return Err(ClientError::Closed(cause.unwrap_or_else(|| "closed by peer".into())))
                },
                Err(_) => return Err(ClientError::Timeout("CONNACK")),
            }
        }
    }

    fn abort(&self) {
        if let Err(e) = self.manager.close(self.channel, None) {
            debug!(channel = %self.channel, error = %e, "Close after failed connect");
        }
    }

    /// Channel carrying this client's connection.
    #[must_use]
    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    /// Client identifier sent in CONNECT.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Publish a message. QoS 1 returns once the PUBACK arrives; QoS 0 once
    /// the message is written.
    ///
    /// # Errors
    ///
    /// Returns an error for QoS 2, invalid topics, or a failed send.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> ClientResult<()> {
        let publish = Publish::new(topic, payload).with_qos(qos).with_retain(retain);
        match self.manager.send(self.channel, Packet::Publish(publish))? {
            None if qos == QoS::AtMostOnce => Ok(()),
            Some(Packet::PubAck(_)) => Ok(()),
            other => Err(ClientError::UnexpectedAck(format!("{other:?}"))),
        }
    }

    /// Subscribe and return the granted QoS codes, one per filter.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid filters or a failed send.
    pub fn subscribe(&self, filters: &[(&str, QoS)]) -> ClientResult<Vec<u8>> {
        let subscriptions = filters
            .iter()
            .map(|(filter, qos)| Subscription::new(*filter, *qos))
            .collect();
        match self
            .manager
            .send(self.channel, Packet::Subscribe(Subscribe::new(subscriptions)))?
        {
            Some(Packet::SubAck(ack)) => Ok(ack.granted),
            other => Err(ClientError::UnexpectedAck(format!("{other:?}"))),
        }
    }

    /// Remove subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid filters or a failed send.
    pub fn unsubscribe(&self, filters: &[&str]) -> ClientResult<()> {
        let filters = filters.iter().map(|f| (*f).to_string()).collect();
        match self
            .manager
            .send(self.channel, Packet::Unsubscribe(Unsubscribe::new(filters)))?
        {
            Some(Packet::UnsubAck(_)) => Ok(()),
            other => Err(ClientError::UnexpectedAck(format!("{other:?}"))),
        }
    }

    /// Next inbound PUBLISH, waiting at most `timeout`. `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] once the connection is gone and no buffered
    /// messages remain.
    pub fn recv_timeout(&mut self, timeout: Duration) -> ClientResult<Option<Publish>> {
        if let Some(publish) = self.inbox.pop_front() {
            return Ok(Some(publish));
        }
        if let Some(cause) = &self.closed {
            return Err(ClientError::Closed(cause.clone()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.events.recv_deadline(deadline) {
                Ok(ClientEvent::Publish(publish)) => return Ok(Some(publish)),
                Ok(ClientEvent::ConnAck(_)) => {},
                Ok(ClientEvent::Closed(cause)) => {
                    let cause = cause.unwrap_or_else(|| "closed".to_string());
                    self.closed = Some(cause.clone());
                    return Err(ClientError::Closed(cause));
                },
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ClientError::Closed("engine stopped".to_string()))
                },
            }
        }
    }

    /// Send DISCONNECT; the channel closes once it is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is already gone.
    pub fn disconnect(self) -> ClientResult<()> {
        self.manager.send(self.channel, Packet::Disconnect)?;
        info!(client_id = %self.client_id, "Client disconnected");
        Ok(())
    }
}
