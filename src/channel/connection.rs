//! One socket, its buffers, and its per-connection protocol state.

use super::id::ChannelId;
use super::keep_alive::{KeepAlive, KeepAliveAction, Role};
use super::outbox::{Delivery, Outbox, Unsent, Written};
use crate::command::{CommandError, Completion};
use crate::config::EngineConfig;
use crate::packet::{decode, Message, MqttError, MqttResult, Packet};
use crate::reactor::{dispatch, ChannelContext, Handler, Scope};
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// TCP connect in progress.
    PendingConnect,
    /// Socket established.
    Connected,
    /// Closed; nothing more is read or written.
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingConnect => write!(f, "pending-connect"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Per-channel limits taken from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelSettings {
    pub(crate) resend_interval: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) max_packet_size: usize,
    pub(crate) read_buffer_size: usize,
}

impl From<&EngineConfig> for ChannelSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            resend_interval: config.resend_interval,
            connect_timeout: config.connect_timeout,
            max_packet_size: config.max_packet_size,
            read_buffer_size: config.read_buffer_size,
        }
    }
}

/// A non-blocking MQTT connection owned by a reactor.
pub struct Channel {
    id: ChannelId,
    role: Role,
    state: ChannelState,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    handler: Arc<dyn Handler>,
    settings: ChannelSettings,
    read_buf: BytesMut,
    scratch: Vec<u8>,
    outbox: Outbox,
    keep_alive: KeepAlive,
    created_at: Instant,
    last_received: Instant,
    last_sent: Instant,
    connect_received: bool,
    connect_op: Option<Completion<ChannelId>>,
    write_blocked: bool,
    close_requested: bool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer_addr", &self.peer_addr)
            .field("queued", &self.outbox.queued_len())
            .field("in_flight", &self.outbox.in_flight_len())
            .finish_non_exhaustive()
    }
}

impl Channel {
    fn new(
        id: ChannelId,
        role: Role,
        state: ChannelState,
        stream: TcpStream,
        handler: Arc<dyn Handler>,
        settings: ChannelSettings,
        now: Instant,
    ) -> Self {
        Self {
            id,
            role,
            state,
            stream,
            peer_addr: None,
            handler,
            settings,
            read_buf: BytesMut::with_capacity(settings.read_buffer_size),
            scratch: vec![0; settings.read_buffer_size.max(64)],
            outbox: Outbox::new(),
            keep_alive: KeepAlive::new(role),
            created_at: now,
            last_received: now,
            last_sent: now,
            connect_received: false,
            connect_op: None,
            write_blocked: false,
            close_requested: false,
        }
    }

    /// A client channel whose TCP connect has been started.
    pub(crate) fn connecting(
        id: ChannelId,
        stream: TcpStream,
        handler: Arc<dyn Handler>,
        settings: ChannelSettings,
        now: Instant,
    ) -> Self {
        Self::new(
            id,
            Role::Client,
            ChannelState::PendingConnect,
            stream,
            handler,
            settings,
            now,
        )
    }

    /// Resolve `op` with the channel id once the TCP connect completes.
    pub(crate) fn notify_connected(&mut self, op: Option<Completion<ChannelId>>) {
        self.connect_op = op;
    }

    /// A broker channel for an accepted socket.
    pub(crate) fn accepted(
        id: ChannelId,
        stream: TcpStream,
        handler: Arc<dyn Handler>,
        settings: ChannelSettings,
        now: Instant,
    ) -> Self {
        let mut channel = Self::new(
            id,
            Role::Broker,
            ChannelState::Connected,
            stream,
            handler,
            settings,
            now,
        );
        channel.peer_addr = channel.stream.peer_addr().ok();
        channel
    }

    /// Channel id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Channel role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Remote address once connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub(crate) fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive.interval()
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.outbox.queued_len()
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.outbox.in_flight_len()
    }

    pub(crate) fn reserved_message_ids(&self) -> usize {
        self.outbox.reserved_ids()
    }

    pub(crate) fn free_message_ids(&self) -> usize {
        self.outbox.free_ids()
    }

    pub(crate) fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Whether a flush has work to do right now.
    pub(crate) fn wants_write(&self) -> bool {
        self.state == ChannelState::Connected && !self.write_blocked && self.outbox.has_pending_writes()
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.write_blocked = false;
        registry.register(
            &mut self.stream,
            self.id.token(),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Run `f` against the channel's handler with a context for this channel.
    pub(crate) fn notify<R>(
        &mut self,
        scope: &mut Scope<'_>,
        f: impl FnOnce(&dyn Handler, &mut ChannelContext<'_, '_>) -> R,
    ) -> R {
        let handler = Arc::clone(&self.handler);
        let mut ctx = ChannelContext::new(self, scope);
        f(handler.as_ref(), &mut ctx)
    }

    /// Queue a message, optionally tracked by a waiting caller.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::ChannelClosed`] once the channel is closed, or
    /// an id allocation error.
    pub(crate) fn enqueue(
        &mut self,
        message: Message,
        completion: Option<Completion<Delivery>>,
    ) -> MqttResult<()> {
        if self.state == ChannelState::Closed {
            return Err(MqttError::ChannelClosed(self.id.as_u64()));
        }
        self.outbox.enqueue(message, completion)
    }

    /// Queue a message for a waiting caller, taking the completion out of
    /// `slot` only once the message is accepted.
    pub(crate) fn send(
        &mut self,
        message: Message,
        slot: &mut Option<Completion<Delivery>>,
    ) -> MqttResult<()> {
        if self.state == ChannelState::Closed {
            return Err(MqttError::ChannelClosed(self.id.as_u64()));
        }
        self.outbox.enqueue_from(message, slot)
    }

    /// Take over messages from a channel that is going away.
    pub(crate) fn adopt(&mut self, unsent: Vec<Unsent>) -> MqttResult<usize> {
        if self.state == ChannelState::Closed {
            return Err(MqttError::ChannelClosed(self.id.as_u64()));
        }
        let count = unsent.len();
        for entry in unsent {
            self.outbox.adopt(entry)?;
        }
        Ok(count)
    }

    /// Mark the channel open and tell its handler.
    pub(crate) fn open(&mut self, scope: &mut Scope<'_>) -> MqttResult<()> {
        self.last_received = scope.now;
        self.last_sent = scope.now;
        scope.stats.channel_opened();
        if let Some(op) = self.connect_op.take() {
            op.complete(self.id);
        }
        debug!(channel = %self.id, role = %self.role, peer = ?self.peer_addr, "Channel opened");
        self.notify(scope, |handler, ctx| handler.channel_opened(ctx))
    }

    /// Complete a pending TCP connect. `Ok(true)` while still pending or once
    /// connected; an error means the connect failed.
    pub(crate) fn finish_connect(&mut self, scope: &mut Scope<'_>) -> MqttResult<bool> {
        if self.state != ChannelState::PendingConnect {
            return Ok(true);
        }
        if let Some(err) = self.stream.take_error()? {
            return Err(err.into());
        }
        match self.stream.peer_addr() {
            Ok(addr) => {
                self.peer_addr = Some(addr);
                self.state = ChannelState::Connected;
                self.open(scope)?;
                Ok(true)
            },
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Drain the socket and dispatch every complete message. `Ok(false)`
    /// means the peer closed the connection or sent DISCONNECT.
    pub(crate) fn read(&mut self, scope: &mut Scope<'_>) -> MqttResult<bool> {
        if self.state != ChannelState::Connected {
            return Ok(true);
        }
        loop {
            match self.stream.read(&mut self.scratch) {
                Ok(0) => {
                    debug!(channel = %self.id, "Peer closed connection");
                    self.dispatch_buffered(scope)?;
                    return Ok(false);
                },
                Ok(n) => {
                    trace!(channel = %self.id, bytes = n, "Read");
                    self.read_buf.extend_from_slice(&self.scratch[..n]);
                    if !self.dispatch_buffered(scope)? {
                        return Ok(false);
                    }
                    if self.close_requested {
                        return Ok(true);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dispatch_buffered(&mut self, scope: &mut Scope<'_>) -> MqttResult<bool> {
        while !self.close_requested {
            let Some(message) = decode(&mut self.read_buf, scope.now, self.settings.max_packet_size)?
            else {
                break;
            };
            if !self.receive(message, scope)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn receive(&mut self, message: Message, scope: &mut Scope<'_>) -> MqttResult<bool> {
        let now = scope.now;
        let packet = message.packet();
        trace!(channel = %self.id, packet = ?packet.packet_type(), "Received");

        self.last_received = now;
        self.keep_alive.on_received();
        scope.stats.message_received(packet.dup());

        if let Some((id, kind)) = packet.acknowledges() {
            if let Some(latency) = self.outbox.acknowledge(id, kind, packet, now) {
                scope.stats.record_latency(latency);
            } else {
                debug!(channel = %self.id, message_id = id, "Acknowledgment for unknown message");
            }
        }

        match packet {
            Packet::PingReq => self.enqueue(Message::outbound(Packet::PingResp)?, None)?,
            Packet::Connect(connect) if self.role == Role::Broker => {
                self.connect_received = true;
                self.keep_alive.set_interval_secs(connect.keep_alive);
            },
            _ => {},
        }

        self.notify(scope, |handler, ctx| dispatch(handler, ctx, message.packet()))?;
        Ok(!matches!(message.packet(), Packet::Disconnect))
    }

    /// Write queued messages until the queue empties or the socket would
    /// block. `Ok(false)` once DISCONNECT has been written.
    pub(crate) fn write(&mut self, scope: &mut Scope<'_>) -> MqttResult<bool> {
        if self.state != ChannelState::Connected {
            return Ok(true);
        }
        self.write_blocked = false;
        while let Some(chunk) = self.outbox.next_chunk() {
            match self.stream.write(&chunk) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    let Some(written) = self.outbox.advance(n, scope.now) else {
                        continue;
                    };
                    if !self.sent(written, scope)? {
                        return Ok(false);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_blocked = true;
                    break;
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn sent(&mut self, written: Written, scope: &mut Scope<'_>) -> MqttResult<bool> {
        self.last_sent = scope.now;
        scope.stats.message_sent(written.resend);
        let packet = written.message.packet();
        trace!(channel = %self.id, packet = ?packet.packet_type(), resend = written.resend, "Sent");

        if written.resend {
            return Ok(true);
        }
        if let Packet::Connect(connect) = packet {
            if self.role == Role::Client {
                self.keep_alive.set_interval_secs(connect.keep_alive);
            }
        }
        self.notify(scope, |handler, ctx| handler.message_sent(ctx, &written.message))?;
        Ok(!matches!(written.message.packet(), Packet::Disconnect))
    }

    /// Run timers: connect timeout, resends and keep-alive. Returns the delay
    /// until the next deadline; an error means the channel must close.
    pub(crate) fn house_keeping(&mut self, scope: &mut Scope<'_>) -> MqttResult<Option<Duration>> {
        let now = scope.now;
        match self.state {
            ChannelState::Closed => Ok(None),
            ChannelState::PendingConnect => self.connect_deadline(now).map(Some),
            ChannelState::Connected => {
                let mut next = None;
                if self.role == Role::Broker && !self.connect_received {
                    next = Some(self.connect_deadline(now)?);
                }

                let (resent, resend_in) = self
                    .outbox
                    .schedule_resends(now, self.settings.resend_interval)?;
                if resent > 0 {
                    debug!(channel = %self.id, count = resent, "Resending unacknowledged messages");
                }
                next = earliest(next, resend_in);

                match self.keep_alive.poll(now, self.last_received, self.last_sent)? {
                    KeepAliveAction::SendPing(wait) => {
                        trace!(channel = %self.id, "Keep-alive ping");
                        self.enqueue(Message::outbound(Packet::PingReq)?, None)?;
                        next = earliest(next, Some(wait));
                    },
                    KeepAliveAction::Wait(wait) => next = earliest(next, wait),
                }
                Ok(next)
            },
        }
    }

    fn connect_deadline(&self, now: Instant) -> MqttResult<Duration> {
        let elapsed = now.saturating_duration_since(self.created_at);
        if elapsed >= self.settings.connect_timeout {
            return Err(MqttError::ConnectTimeout(self.settings.connect_timeout));
        }
        Ok(self.settings.connect_timeout - elapsed)
    }

    /// Messages not yet acknowledged, in send order.
    pub(crate) fn unsent_messages(&self) -> Vec<Message> {
        self.outbox.unsent_messages()
    }

    /// Hand every pending message over, keeping their waiters attached.
    pub(crate) fn take_unsent(&mut self) -> Vec<Unsent> {
        let id = self.id.as_u64();
        self.outbox
            .take_all(|| CommandError::Closed(Arc::new(MqttError::ChannelClosed(id))))
    }

    /// Cancel every caller blocked on this channel. Messages stay queued.
    pub(crate) fn cancel_blocking_commands(&mut self) -> usize {
        let mut count = self.outbox.fail_waiters(|| CommandError::Cancelled);
        if let Some(op) = self.connect_op.take() {
            op.fail(CommandError::Cancelled);
            count += 1;
        }
        count
    }

    /// Close the socket and fail every waiter with `cause`. Returns the
    /// messages that were never acknowledged, without their waiters.
    pub(crate) fn shutdown(&mut self, cause: Option<Arc<MqttError>>) -> Vec<Unsent> {
        if self.state == ChannelState::Closed {
            return Vec::new();
        }
        self.state = ChannelState::Closed;
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!(channel = %self.id, error = %e, "Socket shutdown");
        }

        let cause = cause.unwrap_or_else(|| Arc::new(MqttError::ChannelClosed(self.id.as_u64())));
        if let Some(op) = self.connect_op.take() {
            op.fail(CommandError::Closed(Arc::clone(&cause)));
        }
        let mut unsent = self
            .outbox
            .take_all(|| CommandError::Closed(Arc::clone(&cause)));
        for entry in &mut unsent {
            if let Some(completion) = entry.completion.take() {
                completion.fail(CommandError::Closed(Arc::clone(&cause)));
            }
        }
        unsent
    }
}

/// The sooner of two optional deadlines.
pub(crate) fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
