//! The reactor thread: command queue, readiness polling and timers.

use super::handler::{resolve_alias, Handler, Scope};
use super::manager::Shared;
use super::operation::{panic_message, Command};
use super::stats::{EngineStats, Gauges, StatsSnapshot};
use super::status::EngineStatus;
use crate::channel::{earliest, Channel, ChannelId, ChannelSettings, ChannelState, Delivery, Unsent};
use crate::command::{CommandError, Completion};
use crate::config::EngineConfig;
use crate::packet::{Message, MqttError, MqttResult, Packet};
use crossbeam_channel::{Receiver, Sender};
use mio::net::TcpStream;
use mio::{Events, Poll, Token};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, trace, warn};

/// Token reserved for the cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// A channel removed from one reactor, ready to be attached to another.
///
/// The socket stays open while detached.
#[derive(Debug)]
pub struct DetachedChannel {
    channel: Channel,
}

impl DetachedChannel {
    /// Id of the detached channel. It keeps this id on its next reactor.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    /// State at the time of detaching.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }
}

struct Readiness {
    id: ChannelId,
    readable: bool,
    writable: bool,
}

/// State owned by the reactor thread.
pub(crate) struct Reactor {
    config: EngineConfig,
    settings: ChannelSettings,
    poll: Poll,
    events: Events,
    channels: HashMap<ChannelId, Channel>,
    aliases: HashMap<ChannelId, ChannelId>,
    retired: VecDeque<(ChannelId, Vec<Unsent>)>,
    closing: Vec<(ChannelId, Option<MqttError>)>,
    stats: EngineStats,
    commands: Receiver<Box<dyn Command>>,
    shared: Arc<Shared>,
    shutdown: Option<Completion<()>>,
    stopping: bool,
    now: Instant,
}

impl Reactor {
    pub(crate) fn new(
        config: EngineConfig,
        poll: Poll,
        commands: Receiver<Box<dyn Command>>,
        shared: Arc<Shared>,
    ) -> Self {
        let now = Instant::now();
        Self {
            settings: ChannelSettings::from(&config),
            events: Events::with_capacity(config.events_capacity),
            config,
            poll,
            channels: HashMap::new(),
            aliases: HashMap::new(),
            retired: VecDeque::new(),
            closing: Vec::new(),
            stats: EngineStats::new(now),
            commands,
            shared,
            shutdown: None,
            stopping: false,
            now,
        }
    }

    /// Run until shutdown is requested or the loop fails, then close every
    /// channel and release late callers.
    pub(crate) fn run(mut self, ready: Sender<()>) {
        let span = info_span!("reactor", engine = %self.config.name);
        let _guard = span.enter();

        *self.shared.status.write() = EngineStatus::Running;
        if ready.send(()).is_err() {
            debug!("Nobody waiting for reactor start");
        }
        info!("Reactor started");

        let outcome = match catch_unwind(AssertUnwindSafe(|| self.event_loop())) {
            Ok(result) => result,
            Err(panic) => Err(MqttError::ReactorFailed(panic_message(panic.as_ref()))),
        };

        {
            let mut status = self.shared.status.write();
            if status.is_running() {
                *status = EngineStatus::Stopping;
            }
        }

        let final_status = match &outcome {
            Ok(()) => {
                self.close_all(None);
                EngineStatus::Stopped
            },
            Err(e) => {
                error!(error = %e, "Reactor failed");
                self.close_all(Some(e.to_string()));
                EngineStatus::Failed {
                    message: e.to_string(),
                }
            },
        };

        self.spawn_cleanup();
        *self.shared.status.write() = final_status;
        if let Some(done) = self.shutdown.take() {
            done.complete(());
        }
        info!("Reactor stopped");
    }

    fn event_loop(&mut self) -> MqttResult<()> {
        let mut timeout: Option<Duration> = None;
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            self.now = Instant::now();

            self.run_commands();
            if self.stopping {
                return Ok(());
            }
            self.handle_events();
            timeout = self.house_keeping();
        }
    }

    fn run_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            trace!(command = command.name(), "Executing command");
            command.execute(self);
            self.reap_closing();
            if self.stopping {
                break;
            }
        }
    }

    fn handle_events(&mut self) {
        let ready: Vec<Readiness> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(|event| Readiness {
                id: ChannelId::from_token(event.token()),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            })
            .collect();

        for event in ready {
            let outcome = self.with_channel(event.id, |channel, scope| {
                if channel.state() == ChannelState::PendingConnect {
                    channel.finish_connect(scope)?;
                    if channel.state() != ChannelState::Connected {
                        return Ok(true);
                    }
                }
                if event.readable && !channel.read(scope)? {
                    return Ok(false);
                }
                if event.writable && !channel.write(scope)? {
                    return Ok(false);
                }
                Ok(true)
            });
            self.settle(event.id, outcome);
        }
    }

    fn house_keeping(&mut self) -> Option<Duration> {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        let mut next = None;

        for id in ids {
            let outcome = self.with_channel(id, |channel, scope| {
                let deadline = channel.house_keeping(scope)?;
                if channel.wants_write() && !channel.write(scope)? {
                    return Ok((false, None));
                }
                Ok((true, deadline))
            });
            let outcome = outcome.map(|result| {
                result.map(|(keep, deadline)| {
                    next = earliest(next, deadline);
                    keep
                })
            });
            self.settle(id, outcome);
        }

        // A callback may have queued on a channel already visited this pass.
        if self.channels.values().any(Channel::wants_write) {
            next = Some(Duration::ZERO);
        }
        next
    }

    /// Run `f` on one channel with the rest of the reactor in scope. Panics
    /// are confined to the channel.
    fn with_channel<R>(
        &mut self,
        id: ChannelId,
        f: impl FnOnce(&mut Channel, &mut Scope<'_>) -> MqttResult<R>,
    ) -> Option<MqttResult<R>> {
        let mut channel = self.channels.remove(&id)?;
        let mut scope = Scope {
            channels: &mut self.channels,
            aliases: &self.aliases,
            stats: &mut self.stats,
            closing: &mut self.closing,
            now: self.now,
        };
        let result = catch_unwind(AssertUnwindSafe(|| f(&mut channel, &mut scope)))
            .unwrap_or_else(|panic| {
                Err(MqttError::Handler(format!(
                    "panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        self.channels.insert(id, channel);
        Some(result)
    }

    /// Apply the outcome of a channel call: `false` closes cleanly, an error
    /// closes with that cause.
    fn settle(&mut self, id: ChannelId, outcome: Option<MqttResult<bool>>) {
        self.reap_closing();
        match outcome {
            None | Some(Ok(true)) => {},
            Some(Ok(false)) => self.close_channel(id, None),
            Some(Err(e)) => {
                warn!(channel = %id, error = %e, "Channel fault");
                self.close_channel(id, Some(e));
            },
        }
    }

    fn reap_closing(&mut self) {
        while !self.closing.is_empty() {
            for (id, cause) in std::mem::take(&mut self.closing) {
                self.close_channel(id, cause);
            }
        }
    }

    fn close_channel(&mut self, id: ChannelId, cause: Option<MqttError>) {
        let Some(mut channel) = self.channels.remove(&id) else {
            return;
        };
        if let Err(e) = channel.deregister(self.poll.registry()) {
            trace!(channel = %id, error = %e, "Deregister failed");
        }

        let cause = cause.map(Arc::new);
        let unsent = channel.shutdown(cause.clone());

        let mut scope = Scope {
            channels: &mut self.channels,
            aliases: &self.aliases,
            stats: &mut self.stats,
            closing: &mut self.closing,
            now: self.now,
        };
        let notified = catch_unwind(AssertUnwindSafe(|| {
            channel.notify(&mut scope, |handler, ctx| {
                handler.channel_closed(ctx, cause.as_deref());
            });
        }));
        if let Err(panic) = notified {
            error!(channel = %id, panic = %panic_message(panic.as_ref()), "channel_closed panicked");
        }

        self.stats.channel_closed();
        match &cause {
            Some(cause) => info!(channel = %id, cause = %cause, "Channel closed"),
            None => debug!(channel = %id, "Channel closed"),
        }
        if !unsent.is_empty() {
            self.retire(id, unsent);
        }
        self.prune_aliases();
    }

    /// Keep a closed channel's unacknowledged messages for a later transfer.
    fn retire(&mut self, id: ChannelId, unsent: Vec<Unsent>) {
        self.retired.retain(|(retired, _)| *retired != id);
        self.retired.push_back((id, unsent));
        while self.retired.len() > self.config.max_retired_channels {
            self.retired.pop_front();
        }
    }

    /// Forget handles that resolve to a channel which is neither open nor
    /// retired.
    fn prune_aliases(&mut self) {
        if self.aliases.is_empty() {
            return;
        }
        let dead: Vec<ChannelId> = self
            .aliases
            .keys()
            .copied()
            .filter(|alias| {
                let target = resolve_alias(&self.aliases, *alias);
                !self.channels.contains_key(&target)
                    && !self.retired.iter().any(|(retired, _)| *retired == target)
            })
            .collect();
        for alias in dead {
            self.aliases.remove(&alias);
        }
    }

    fn close_all(&mut self, failure: Option<String>) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            match &failure {
                None => {
                    if let Some(channel) = self.channels.get_mut(&id) {
                        channel.cancel_blocking_commands();
                    }
                    self.close_channel(id, None);
                },
                Some(message) => {
                    self.close_channel(id, Some(MqttError::ReactorFailed(message.clone())));
                },
            }
            self.reap_closing();
        }
    }

    /// Cancel commands that slipped into the queue after the loop stopped.
    fn spawn_cleanup(&self) {
        let commands = self.commands.clone();
        let drain = move || {
            let mut count = 0;
            while let Ok(command) = commands.try_recv() {
                command.cancel(CommandError::Cancelled);
                count += 1;
            }
            if count > 0 {
                debug!(count, "Cancelled late commands");
            }
        };
        let spawned = thread::Builder::new()
            .name(format!("{}-cleanup", self.config.name))
            .spawn(drain.clone());
        if let Err(e) = spawned {
            warn!(error = %e, "Cleanup thread failed to start; draining inline");
            drain();
        }
    }

    fn resolve(&self, id: ChannelId) -> ChannelId {
        resolve_alias(&self.aliases, id)
    }

    fn channel_mut(&mut self, id: ChannelId) -> MqttResult<&mut Channel> {
        let id = self.resolve(id);
        self.channels
            .get_mut(&id)
            .ok_or(MqttError::UnknownChannel(id.as_u64()))
    }

    // Operations run by commands.

    pub(crate) fn open_client(
        &mut self,
        id: ChannelId,
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        slot: &mut Option<Completion<ChannelId>>,
    ) -> MqttResult<()> {
        let stream = TcpStream::connect(addr)?;
        let mut channel = Channel::connecting(id, stream, handler, self.settings, self.now);
        channel.register(self.poll.registry())?;
        channel.notify_connected(slot.take());
        debug!(channel = %id, address = %addr, "Connecting");
        self.channels.insert(id, channel);
        Ok(())
    }

    pub(crate) fn open_server(
        &mut self,
        id: ChannelId,
        stream: std::net::TcpStream,
        handler: Arc<dyn Handler>,
    ) -> MqttResult<ChannelId> {
        stream.set_nonblocking(true)?;
        let mut channel = Channel::accepted(
            id,
            TcpStream::from_std(stream),
            handler,
            self.settings,
            self.now,
        );
        channel.register(self.poll.registry())?;
        self.channels.insert(id, channel);

        let outcome = self.with_channel(id, |channel, scope| channel.open(scope).map(|()| true));
        self.settle(id, outcome);
        Ok(id)
    }

    pub(crate) fn send(
        &mut self,
        id: ChannelId,
        packet: Packet,
        slot: &mut Option<Completion<Delivery>>,
    ) -> MqttResult<()> {
        let message = Message::outbound(packet)?;
        self.channel_mut(id)?.send(message, slot)
    }

    pub(crate) fn close(&mut self, id: ChannelId, cause: Option<MqttError>) -> MqttResult<()> {
        let id = self.resolve(id);
        if self.channels.contains_key(&id) {
            // An explicit close without a cause cancels the waiters.
            if cause.is_none() {
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.cancel_blocking_commands();
                }
            }
            self.close_channel(id, cause);
            self.reap_closing();
            Ok(())
        } else if self.retired.iter().any(|(retired, _)| *retired == id) {
            Ok(())
        } else {
            Err(MqttError::UnknownChannel(id.as_u64()))
        }
    }

    pub(crate) fn cancel_pending(&mut self, id: ChannelId) -> MqttResult<usize> {
        Ok(self.channel_mut(id)?.cancel_blocking_commands())
    }

    pub(crate) fn unsent_messages(&self, id: ChannelId) -> MqttResult<Vec<Message>> {
        let id = self.resolve(id);
        if let Some(channel) = self.channels.get(&id) {
            return Ok(channel.unsent_messages());
        }
        self.retired
            .iter()
            .find(|(retired, _)| *retired == id)
            .map(|(_, unsent)| unsent.iter().map(|u| u.message.clone()).collect())
            .ok_or(MqttError::UnknownChannel(id.as_u64()))
    }

    pub(crate) fn transfer(&mut self, old: ChannelId, new: ChannelId) -> MqttResult<usize> {
        let from = self.resolve(old);
        let to = self.resolve(new);
        if from == to {
            return Ok(0);
        }
        if !self.channels.contains_key(&to) {
            return Err(MqttError::UnknownChannel(to.as_u64()));
        }

        let needed = if let Some(channel) = self.channels.get(&from) {
            channel.reserved_message_ids()
        } else if let Some((_, unsent)) = self.retired.iter().find(|(id, _)| *id == from) {
            unsent
                .iter()
                .filter(|u| u.message.packet().requires_ack())
                .count()
        } else {
            return Err(MqttError::UnknownChannel(from.as_u64()));
        };
        let free = self.channel_mut(to)?.free_message_ids();
        if needed > free {
            return Err(MqttError::MessageIdsExhausted);
        }

        let (unsent, live) = if let Some(channel) = self.channels.get_mut(&from) {
            (channel.take_unsent(), true)
        } else if let Some(pos) = self.retired.iter().position(|(id, _)| *id == from) {
            let unsent = self.retired.remove(pos).map(|(_, u)| u).unwrap_or_default();
            (unsent, false)
        } else {
            return Err(MqttError::UnknownChannel(from.as_u64()));
        };

        let count = self.channel_mut(to)?.adopt(unsent)?;
        self.aliases.insert(from, to);
        if old != from {
            self.aliases.insert(old, to);
        }
        if live {
            self.close_channel(from, None);
            self.reap_closing();
        }
        info!(from = %from, to = %to, messages = count, "Transferred channel");
        Ok(count)
    }

    pub(crate) fn detach(&mut self, id: ChannelId) -> MqttResult<DetachedChannel> {
        let id = self.resolve(id);
        let outcome = self.with_channel(id, |channel, scope| {
            channel.notify(scope, |handler, ctx| handler.channel_detached(ctx));
            Ok(true)
        });
        if outcome.is_none() {
            return Err(MqttError::UnknownChannel(id.as_u64()));
        }
        self.settle(id, outcome);

        let mut channel = self
            .channels
            .remove(&id)
            .ok_or(MqttError::ChannelClosed(id.as_u64()))?;
        if let Err(e) = channel.deregister(self.poll.registry()) {
            self.channels.insert(id, channel);
            return Err(e.into());
        }
        info!(channel = %id, "Channel detached");
        Ok(DetachedChannel { channel })
    }

    pub(crate) fn attach(&mut self, detached: DetachedChannel) -> MqttResult<ChannelId> {
        let mut channel = detached.channel;
        let id = channel.id();
        channel.register(self.poll.registry())?;
        self.channels.insert(id, channel);
        info!(channel = %id, "Channel attached");

        let outcome = self.with_channel(id, |channel, scope| {
            channel
                .notify(scope, |handler, ctx| handler.channel_attached(ctx))
                .map(|()| true)
        });
        self.settle(id, outcome);
        Ok(id)
    }

    pub(crate) fn stats(&mut self, reset: bool) -> StatsSnapshot {
        let gauges = Gauges {
            open_channels: self.channels.len(),
            retired_channels: self.retired.len(),
            aliased_channels: self.aliases.len(),
            messages_queued: self.channels.values().map(Channel::queued_len).sum(),
            messages_in_flight: self.channels.values().map(Channel::in_flight_len).sum(),
        };
        self.stats.snapshot(self.now, gauges, reset)
    }

    pub(crate) fn begin_shutdown(&mut self, done: Option<Completion<()>>) {
        info!("Shutdown requested");
        self.stopping = true;
        self.shutdown = done;
    }
}
