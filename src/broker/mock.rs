//! In-process MQTT broker implemented as a channel [`Handler`].

use super::session::{RetainedStore, Session};
use crate::channel::ChannelId;
use crate::config::BrokerConfig;
use crate::packet::{
    ConnAck, Connect, ConnectReturnCode, Message, MqttError, Packet, ProtocolVersion, PubAck,
    Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe, SUBACK_FAILURE,
};
use crate::reactor::{ChannelContext, Handler, HandlerResult};
use crate::topic::{TopicFilter, TopicName};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct BrokerState {
    sessions: HashMap<ChannelId, Session>,
    clients: HashMap<String, ChannelId>,
    retained: RetainedStore,
}

/// A small broker: session bookkeeping, QoS 0/1 routing, retained messages
/// and wills. Sessions are not persisted across connections.
#[derive(Debug)]
pub struct MockBroker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
}

impl MockBroker {
    /// Create a broker with the given access rules.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Channel serving `client_id`, if connected.
    #[must_use]
    pub fn client_channel(&self, client_id: &str) -> Option<ChannelId> {
        self.state.lock().clients.get(client_id).copied()
    }

    /// Number of retained topics.
    #[must_use]
    pub fn retained_count(&self) -> usize {
        self.state.lock().retained.len()
    }

    /// Retained message for a topic.
    #[must_use]
    pub fn retained(&self, topic: &str) -> Option<Publish> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Return code for a CONNECT.
    #[must_use]
    pub fn check_connect(&self, connect: &Connect) -> ConnectReturnCode {
        if ProtocolVersion::from_connect(&connect.protocol_name, connect.protocol_level).is_none() {
            return ConnectReturnCode::BadProtocolVersion;
        }
        if connect.client_id.is_empty() || connect.client_id.len() > self.config.max_client_id_len
        {
            return ConnectReturnCode::IdentifierRejected;
        }
        let known = connect
            .username
            .as_ref()
            .and_then(|user| self.config.users.get(user));
        match known {
            Some(expected) if connect.password.as_deref() == Some(expected.as_bytes()) => {
                ConnectReturnCode::Accepted
            },
            Some(_) => ConnectReturnCode::BadCredentials,
            None if self.config.allow_anonymous => ConnectReturnCode::Accepted,
            None => ConnectReturnCode::BadCredentials,
        }
    }
}

/// Deliver `publish` to every session subscribed to its topic, once per
/// session at the lower of the published and granted QoS.
fn route(state: &BrokerState, ctx: &mut ChannelContext<'_, '_>, publish: &Publish) {
    for (channel, session) in &state.sessions {
        let Some(granted) = session.granted_for(&publish.topic) else {
            continue;
        };
        let outgoing = Publish::new(publish.topic.clone(), publish.payload.clone())
            .with_qos(publish.qos.min(granted));
        if let Err(e) = ctx.send_to(*channel, Packet::Publish(outgoing)) {
            debug!(channel = %channel, error = %e, "Dropped routed message");
        }
    }
}

fn require_session<'s>(
    sessions: &'s mut HashMap<ChannelId, Session>,
    channel: ChannelId,
    packet: &str,
) -> Result<&'s mut Session, MqttError> {
    sessions
        .get_mut(&channel)
        .ok_or_else(|| MqttError::Protocol(format!("{packet} before CONNECT")))
}

impl Handler for MockBroker {
    fn channel_closed(&self, ctx: &mut ChannelContext<'_, '_>, cause: Option<&MqttError>) {
        let channel = ctx.channel_id();
        let mut state = self.state.lock();
        let Some(session) = state.sessions.remove(&channel) else {
            return;
        };
        if state.clients.get(&session.client_id) == Some(&channel) {
            state.clients.remove(&session.client_id);
        }

        if session.disconnected {
            debug!(client_id = %session.client_id, "Client left");
            return;
        }
        let Some(will) = session.will else {
            return;
        };
        info!(
            client_id = %session.client_id,
            topic = %will.topic,
            cause = ?cause,
            "Publishing will"
        );
        let publish = Publish::new(will.topic, will.payload)
            .with_qos(will.qos.min(QoS::AtLeastOnce))
            .with_retain(will.retain);
        if publish.retain {
            state.retained.store(&publish);
        }
        route(&state, ctx, &publish);
    }

    fn message_sent(&self, ctx: &mut ChannelContext<'_, '_>, message: &Message) -> HandlerResult {
        if let Packet::ConnAck(ack) = message.packet() {
            if !ack.return_code.is_accepted() {
                ctx.close(None);
            }
        }
        Ok(())
    }

    fn on_connect(&self, ctx: &mut ChannelContext<'_, '_>, packet: &Connect) -> HandlerResult {
        let channel = ctx.channel_id();
        let mut state = self.state.lock();
        if state.sessions.contains_key(&channel) {
            return Err(MqttError::Protocol("second CONNECT".to_string()));
        }

        let code = self.check_connect(packet);
        ctx.send(Packet::ConnAck(ConnAck::new(code)))?;
        if !code.is_accepted() {
            warn!(client_id = %packet.client_id, code = %code, "Refused connection");
            return Ok(());
        }

        if let Some(previous) = state.clients.insert(packet.client_id.clone(), channel) {
            info!(client_id = %packet.client_id, previous = %previous, "Client taken over");
            state.sessions.remove(&previous);
            ctx.close_channel(previous, None);
        }
        state
            .sessions
            .insert(channel, Session::new(packet.client_id.clone(), packet.will.clone()));
        info!(client_id = %packet.client_id, channel = %channel, "Client connected");
        Ok(())
    }

    fn on_publish(&self, ctx: &mut ChannelContext<'_, '_>, packet: &Publish) -> HandlerResult {
        let mut state = self.state.lock();
        require_session(&mut state.sessions, ctx.channel_id(), "PUBLISH")?;
        if packet.qos == QoS::ExactlyOnce {
            return Err(MqttError::UnsupportedQoS(2));
        }
        TopicName::validate(&packet.topic)?;

        if packet.qos == QoS::AtLeastOnce {
            ctx.send(Packet::PubAck(PubAck::new(packet.message_id)))?;
        }
        if packet.retain {
            state.retained.store(packet);
        }
        route(&state, ctx, packet);
        Ok(())
    }

    fn on_subscribe(&self, ctx: &mut ChannelContext<'_, '_>, packet: &Subscribe) -> HandlerResult {
        let mut guard = self.state.lock();
        let BrokerState {
            sessions, retained, ..
        } = &mut *guard;
        let session = require_session(sessions, ctx.channel_id(), "SUBSCRIBE")?;

        let mut granted = Vec::with_capacity(packet.subscriptions.len());
        let mut replay = Vec::new();
        for subscription in &packet.subscriptions {
            let Ok(filter) = TopicFilter::new(subscription.topic_filter.as_str()) else {
                debug!(filter = %subscription.topic_filter, "Rejected subscription");
                granted.push(SUBACK_FAILURE);
                continue;
            };
            let qos = subscription.qos.min(QoS::AtLeastOnce);
            granted.push(qos as u8);
            replay.extend(retained.matching(&filter).map(|retained| {
                Publish::new(retained.topic.clone(), retained.payload.clone())
                    .with_qos(retained.qos.min(qos))
                    .with_retain(true)
            }));
            session.subscribe(filter, qos);
        }

        ctx.send(Packet::SubAck(SubAck::new(packet.message_id, granted)))?;
        for publish in replay {
            ctx.send(Packet::Publish(publish))?;
        }
        Ok(())
    }

    fn on_unsubscribe(
        &self,
        ctx: &mut ChannelContext<'_, '_>,
        packet: &Unsubscribe,
    ) -> HandlerResult {
        let mut state = self.state.lock();
        let session = require_session(&mut state.sessions, ctx.channel_id(), "UNSUBSCRIBE")?;
        for filter in &packet.topic_filters {
            session.unsubscribe(filter);
        }
        ctx.send(Packet::UnsubAck(UnsubAck::new(packet.message_id)))
    }

    fn on_disconnect(&self, ctx: &mut ChannelContext<'_, '_>) -> HandlerResult {
        if let Some(session) = self.state.lock().sessions.get_mut(&ctx.channel_id()) {
            session.disconnected = true;
        }
        Ok(())
    }
}
