//! Application callbacks and the context they run in.
//!
//! Every callback runs on the reactor thread. A callback returning an error
//! closes its channel with that error as the cause.

use super::stats::EngineStats;
use crate::channel::{Channel, ChannelId, ChannelState, Role};
use crate::packet::{
    ConnAck, Connect, Message, MqttError, MqttResult, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Result of a handler callback.
pub type HandlerResult = MqttResult<()>;

/// Application hooks for one or more channels.
///
/// Every method has a no-op default; implement the ones the application
/// cares about. PINGREQ is answered by the channel itself before
/// [`Handler::on_ping_req`] runs.
#[allow(unused_variables)]
pub trait Handler: Send + Sync + 'static {
    /// The channel is connected and registered.
    fn channel_opened(&self, ctx: &mut ChannelContext<'_, '_>) -> HandlerResult {
        Ok(())
    }

    /// The channel closed. `cause` is `None` for a clean close.
    fn channel_closed(&self, ctx: &mut ChannelContext<'_, '_>, cause: Option<&MqttError>) {}

    /// The channel moved onto this reactor.
    fn channel_attached(&self, ctx: &mut ChannelContext<'_, '_>) -> HandlerResult {
        Ok(())
    }

    /// The channel is leaving this reactor.
    fn channel_detached(&self, ctx: &mut ChannelContext<'_, '_>) {}

    /// A message was completely written for the first time.
    fn message_sent(&self, ctx: &mut ChannelContext<'_, '_>, message: &Message) -> HandlerResult {
        Ok(())
    }

    /// CONNECT received.
    fn on_connect(&self, ctx: &mut ChannelContext<'_, '_>, packet: &Connect) -> HandlerResult {
        Ok(())
    }

    /// CONNACK received.
    fn on_conn_ack(&self, ctx: &mut ChannelContext<'_, '_>, packet: &ConnAck) -> HandlerResult {
        Ok(())
    }

    /// PUBLISH received.
    fn on_publish(&self, ctx: &mut ChannelContext<'_, '_>, packet: &Publish) -> HandlerResult {
        Ok(())
    }

    /// PUBACK received.
    fn on_pub_ack(&self, ctx: &mut ChannelContext<'_, '_>, packet: &PubAck) -> HandlerResult {
        Ok(())
    }

    /// PUBREC received.
    fn on_pub_rec(&self, ctx: &mut ChannelContext<'_, '_>, packet: &PubRec) -> HandlerResult {
        Ok(())
    }

    /// PUBREL received.
    fn on_pub_rel(&self, ctx: &mut ChannelContext<'_, '_>, packet: &PubRel) -> HandlerResult {
        Ok(())
    }

    /// PUBCOMP received.
    fn on_pub_comp(&self, ctx: &mut ChannelContext<'_, '_>, packet: &PubComp) -> HandlerResult {
        Ok(())
    }

    /// SUBSCRIBE received.
    fn on_subscribe(&self, ctx: &mut ChannelContext<'_, '_>, packet: &Subscribe) -> HandlerResult {
        Ok(())
    }

    /// SUBACK received.
    fn on_sub_ack(&self, ctx: &mut ChannelContext<'_, '_>, packet: &SubAck) -> HandlerResult {
        Ok(())
    }

    /// UNSUBSCRIBE received.
    fn on_unsubscribe(
        &self,
        ctx: &mut ChannelContext<'_, '_>,
        packet: &Unsubscribe,
    ) -> HandlerResult {
        Ok(())
    }

    /// UNSUBACK received.
    fn on_unsub_ack(&self, ctx: &mut ChannelContext<'_, '_>, packet: &UnsubAck) -> HandlerResult {
        Ok(())
    }

    /// PINGREQ received.
    fn on_ping_req(&self, ctx: &mut ChannelContext<'_, '_>) -> HandlerResult {
        Ok(())
    }

    /// PINGRESP received.
    fn on_ping_resp(&self, ctx: &mut ChannelContext<'_, '_>) -> HandlerResult {
        Ok(())
    }

    /// DISCONNECT received. The channel closes cleanly afterwards.
    fn on_disconnect(&self, ctx: &mut ChannelContext<'_, '_>) -> HandlerResult {
        Ok(())
    }
}

/// Route a received packet to its callback.
pub(crate) fn dispatch(
    handler: &dyn Handler,
    ctx: &mut ChannelContext<'_, '_>,
    packet: &Packet,
) -> HandlerResult {
    match packet {
        Packet::Connect(p) => handler.on_connect(ctx, p),
        Packet::ConnAck(p) => handler.on_conn_ack(ctx, p),
        Packet::Publish(p) => handler.on_publish(ctx, p),
        Packet::PubAck(p) => handler.on_pub_ack(ctx, p),
        Packet::PubRec(p) => handler.on_pub_rec(ctx, p),
        Packet::PubRel(p) => handler.on_pub_rel(ctx, p),
        Packet::PubComp(p) => handler.on_pub_comp(ctx, p),
        Packet::Subscribe(p) => handler.on_subscribe(ctx, p),
        Packet::SubAck(p) => handler.on_sub_ack(ctx, p),
        Packet::Unsubscribe(p) => handler.on_unsubscribe(ctx, p),
        Packet::UnsubAck(p) => handler.on_unsub_ack(ctx, p),
        Packet::PingReq => handler.on_ping_req(ctx),
        Packet::PingResp => handler.on_ping_resp(ctx),
        Packet::Disconnect => handler.on_disconnect(ctx),
    }
}

/// Reactor state a channel may touch while one of its calls runs.
pub(crate) struct Scope<'r> {
    /// Every other channel on the reactor.
    pub(crate) channels: &'r mut HashMap<ChannelId, Channel>,
    pub(crate) aliases: &'r HashMap<ChannelId, ChannelId>,
    pub(crate) stats: &'r mut EngineStats,
    /// Closes requested during the call; applied once it returns.
    pub(crate) closing: &'r mut Vec<(ChannelId, Option<MqttError>)>,
    pub(crate) now: Instant,
}

impl Scope<'_> {
    pub(crate) fn resolve(&self, id: ChannelId) -> ChannelId {
        resolve_alias(self.aliases, id)
    }
}

/// Follow transfer aliases to the channel that now owns an id's traffic.
pub(crate) fn resolve_alias(aliases: &HashMap<ChannelId, ChannelId>, mut id: ChannelId) -> ChannelId {
    while let Some(next) = aliases.get(&id) {
        id = *next;
    }
    id
}

/// What a callback sees: its own channel plus in-thread access to the rest
/// of the reactor.
///
/// Sends made here are queued immediately, without a round trip through the
/// command queue. Closes are applied after the callback returns.
pub struct ChannelContext<'a, 'r> {
    channel: &'a mut Channel,
    scope: &'a mut Scope<'r>,
}

impl<'a, 'r> ChannelContext<'a, 'r> {
    pub(crate) fn new(channel: &'a mut Channel, scope: &'a mut Scope<'r>) -> Self {
        Self { channel, scope }
    }

    /// Id of the channel the callback is for.
    #[must_use]
    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Role of the current channel.
    #[must_use]
    pub fn role(&self) -> Role {
        self.channel.role()
    }

    /// State of the current channel.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Remote address of the current channel.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.channel.peer_addr()
    }

    /// Negotiated keep-alive interval of the current channel.
    #[must_use]
    pub fn keep_alive(&self) -> Option<Duration> {
        self.channel.keep_alive_interval()
    }

    /// Reactor time for this pass.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.scope.now
    }

    /// Queue a packet on the current channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet is invalid, its message id is taken,
    /// or the channel is closed.
    pub fn send(&mut self, packet: Packet) -> MqttResult<()> {
        self.channel.enqueue(Message::outbound(packet)?, None)
    }

    /// Queue a packet on any channel of this reactor.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::UnknownChannel`] if no such channel is open here.
    pub fn send_to(&mut self, target: ChannelId, packet: Packet) -> MqttResult<()> {
        let target = self.scope.resolve(target);
        if target == self.channel.id() {
            return self.send(packet);
        }
        let message = Message::outbound(packet)?;
        match self.scope.channels.get_mut(&target) {
            Some(channel) => channel.enqueue(message, None),
            None => Err(MqttError::UnknownChannel(target.as_u64())),
        }
    }

    /// Whether a channel is open on this reactor.
    #[must_use]
    pub fn is_open(&self, id: ChannelId) -> bool {
        let id = self.scope.resolve(id);
        id == self.channel.id() || self.scope.channels.contains_key(&id)
    }

    /// Close the current channel once the callback returns.
    pub fn close(&mut self, cause: Option<MqttError>) {
        self.channel.request_close();
        self.scope.closing.push((self.channel.id(), cause));
    }

    /// Close another channel once the callback returns.
    pub fn close_channel(&mut self, target: ChannelId, cause: Option<MqttError>) {
        let target = self.scope.resolve(target);
        if target == self.channel.id() {
            self.close(cause);
        } else {
            self.scope.closing.push((target, cause));
        }
    }
}
