//! Public entry points: the callback-style [`ChannelManager`] and its
//! blocking wrapper.

use super::event_loop::{DetachedChannel, Reactor, WAKER_TOKEN};
use super::handler::Handler;
use super::operation::{Command, Operation};
use super::stats::StatsSnapshot;
use super::status::EngineStatus;
use crate::channel::{ChannelId, Delivery};
use crate::command::{CommandError, CommandResult, Completion, PendingOperation};
use crate::config::EngineConfig;
use crate::packet::{Message, MqttError, MqttResult, Packet};
use crossbeam_channel::{SendError, Sender};
use mio::{Poll, Waker};
use parking_lot::{Mutex, RwLock};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Port used when an address names none.
pub const DEFAULT_PORT: u16 = 1883;

/// State shared between submitting threads and the reactor thread.
pub(crate) struct Shared {
    /// Commands are accepted only while this reads `Running`; holding the
    /// read lock across the enqueue keeps submissions ordered before shutdown.
    pub(crate) status: RwLock<EngineStatus>,
    commands: Sender<Box<dyn Command>>,
    waker: Waker,
}

/// Handle to one reactor. Cheap to clone; every clone drives the same
/// reactor thread.
///
/// Every operation returns a [`PendingOperation`] immediately. Callers either
/// wait on it or attach a callback with [`PendingOperation::on_complete`].
/// Callbacks run on the reactor thread and must not wait on other operations.
#[derive(Clone)]
pub struct ChannelManager {
    shared: Arc<Shared>,
    config: Arc<EngineConfig>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("name", &self.config.name)
            .field("status", &*self.shared.status.read())
            .finish()
    }
}

impl ChannelManager {
    /// Start a reactor thread and wait until it is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller or thread cannot be created.
    pub fn init(config: EngineConfig) -> MqttResult<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            status: RwLock::new(EngineStatus::Initializing),
            commands: sender,
            waker,
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let reactor = Reactor::new(config.clone(), poll, receiver, Arc::clone(&shared));
        let handle = thread::Builder::new()
            .name(format!("{}-reactor", config.name))
            .spawn(move || reactor.run(ready_tx))?;

        if ready_rx.recv().is_err() {
            if handle.join().is_err() {
                debug!("Reactor thread panicked during start");
            }
            return Err(MqttError::ReactorFailed(
                "reactor thread exited during start".to_string(),
            ));
        }

        info!(engine = %config.name, "Channel manager started");
        Ok(Self {
            shared,
            config: Arc::new(config),
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        self.shared.status.read().clone()
    }

    /// Configuration the reactor was started with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn submit<T, F>(&self, name: &'static str, body: F) -> PendingOperation<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Reactor, &mut Option<Completion<T>>) -> MqttResult<Option<T>>
            + Send
            + 'static,
    {
        let (op, completion) = PendingOperation::new();
        let command: Box<dyn Command> = Box::new(Operation::new(name, completion, body));

        let status = self.shared.status.read();
        if !status.is_running() {
            let error = CommandError::Engine(format!("engine is {status}"));
            drop(status);
            command.cancel(error);
            return op;
        }
        if let Err(SendError(command)) = self.shared.commands.send(command) {
            drop(status);
            command.cancel(CommandError::Engine("command queue closed".to_string()));
            return op;
        }
        drop(status);

        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
        op
    }

    /// Open an outbound channel to `address` (`host:port`, `mqtt://host[:port]`
    /// or `tcp://host[:port]`). Resolves once the TCP connection is up.
    pub fn new_client_channel(
        &self,
        address: &str,
        handler: Arc<dyn Handler>,
    ) -> PendingOperation<ChannelId> {
        let addr = match resolve_address(address) {
            Ok(addr) => addr,
            Err(e) => return PendingOperation::failed(CommandError::Fault(e)),
        };
        let id = ChannelId::next();
        self.submit("new_client_channel", move |reactor, slot| {
            reactor.open_client(id, addr, handler, slot)?;
            Ok(None)
        })
    }

    /// Wrap an accepted socket in a broker-side channel.
    pub fn new_server_channel(
        &self,
        stream: TcpStream,
        handler: Arc<dyn Handler>,
    ) -> PendingOperation<ChannelId> {
        let id = ChannelId::next();
        self.submit("new_server_channel", move |reactor, _| {
            reactor.open_server(id, stream, handler).map(Some)
        })
    }

    /// Queue a packet. Resolves with the acknowledging packet for QoS 1
    /// publishes, subscribes and unsubscribes, and with `None` for anything
    /// else once written.
    pub fn send(&self, channel: ChannelId, packet: Packet) -> PendingOperation<Delivery> {
        self.submit("send", move |reactor, slot| {
            reactor.send(channel, packet, slot)?;
            Ok(None)
        })
    }

    /// Close a channel. `cause` is reported to its handler and waiters.
    pub fn close(&self, channel: ChannelId, cause: Option<MqttError>) -> PendingOperation<()> {
        self.submit("close", move |reactor, _| reactor.close(channel, cause).map(Some))
    }

    /// Cancel every caller waiting on the channel. Queued messages stay
    /// queued. Resolves with the number of waiters cancelled.
    pub fn cancel_pending(&self, channel: ChannelId) -> PendingOperation<usize> {
        self.submit("cancel_pending", move |reactor, _| {
            reactor.cancel_pending(channel).map(Some)
        })
    }

    /// Messages queued or awaiting acknowledgment, in send order.
    pub fn get_unsent_messages(&self, channel: ChannelId) -> PendingOperation<Vec<Message>> {
        self.submit("get_unsent_messages", move |reactor, _| {
            reactor.unsent_messages(channel).map(Some)
        })
    }

    /// Move every unacknowledged message of `old` onto `new`, close `old`,
    /// and make `old` an alias of `new`. Resolves with the number of
    /// messages moved.
    pub fn transfer(&self, old: ChannelId, new: ChannelId) -> PendingOperation<usize> {
        self.submit("transfer", move |reactor, _| reactor.transfer(old, new).map(Some))
    }

    /// Remove a channel from this reactor without closing it.
    pub fn detach(&self, channel: ChannelId) -> PendingOperation<DetachedChannel> {
        self.submit("detach", move |reactor, _| reactor.detach(channel).map(Some))
    }

    /// Adopt a channel detached from another reactor.
    pub fn attach(&self, channel: DetachedChannel) -> PendingOperation<ChannelId> {
        self.submit("attach", move |reactor, _| reactor.attach(channel).map(Some))
    }

    /// Aggregate statistics, optionally starting a new interval.
    pub fn get_stats(&self, reset: bool) -> PendingOperation<StatsSnapshot> {
        self.submit("get_stats", move |reactor, _| Ok(Some(reactor.stats(reset))))
    }

    /// Stop accepting commands, run everything already queued, close every
    /// channel and stop the reactor thread.
    pub fn shutdown(&self) -> PendingOperation<()> {
        let (op, completion) = PendingOperation::new();
        let command: Box<dyn Command> = Box::new(Operation::new(
            "shutdown",
            completion,
            |reactor: &mut Reactor, slot: &mut Option<Completion<()>>| {
                reactor.begin_shutdown(slot.take());
                Ok(None)
            },
        ));

        let mut status = self.shared.status.write();
        if !status.is_running() {
            let error = CommandError::Engine(format!("engine is {status}"));
            drop(status);
            command.cancel(error);
            return op;
        }
        *status = EngineStatus::Stopping;
        if let Err(SendError(command)) = self.shared.commands.send(command) {
            drop(status);
            command.cancel(CommandError::Engine("command queue closed".to_string()));
            return op;
        }
        drop(status);

        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
        op
    }

    /// Wait for the reactor thread to exit.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(engine = %self.config.name, "Reactor thread panicked");
            }
        }
    }
}

/// [`ChannelManager`] with every operation awaited for at most the configured
/// blocking timeout.
///
/// A timeout only stops the wait; the reactor may still complete the work.
#[derive(Debug, Clone)]
pub struct BlockingChannelManager {
    manager: ChannelManager,
    timeout: Duration,
}

impl BlockingChannelManager {
    /// Wrap a manager, using its configured blocking timeout.
    #[must_use]
    pub fn new(manager: ChannelManager) -> Self {
        let timeout = manager.config().blocking_timeout;
        Self { manager, timeout }
    }

    /// Start a reactor and wrap it.
    ///
    /// # Errors
    ///
    /// See [`ChannelManager::init`].
    pub fn init(config: EngineConfig) -> MqttResult<Self> {
        ChannelManager::init(config).map(Self::new)
    }

    /// Use a different timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The callback-style manager underneath.
    #[must_use]
    pub fn manager(&self) -> &ChannelManager {
        &self.manager
    }

    /// The wait applied to each operation.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        self.manager.status()
    }

    /// See [`ChannelManager::new_client_channel`].
    pub fn new_client_channel(
        &self,
        address: &str,
        handler: Arc<dyn Handler>,
    ) -> CommandResult<ChannelId> {
        self.manager
            .new_client_channel(address, handler)
            .await_result(self.timeout)
    }

    /// See [`ChannelManager::new_server_channel`].
    pub fn new_server_channel(
        &self,
        stream: TcpStream,
        handler: Arc<dyn Handler>,
    ) -> CommandResult<ChannelId> {
        self.manager
            .new_server_channel(stream, handler)
            .await_result(self.timeout)
    }

    /// See [`ChannelManager::send`].
    pub fn send(&self, channel: ChannelId, packet: Packet) -> CommandResult<Delivery> {
        self.manager.send(channel, packet).await_result(self.timeout)
    }

    /// See [`ChannelManager::close`].
    pub fn close(&self, channel: ChannelId, cause: Option<MqttError>) -> CommandResult<()> {
        self.manager.close(channel, cause).await_result(self.timeout)
    }

    /// See [`ChannelManager::cancel_pending`].
    pub fn cancel_pending(&self, channel: ChannelId) -> CommandResult<usize> {
        self.manager.cancel_pending(channel).await_result(self.timeout)
    }

    /// See [`ChannelManager::get_unsent_messages`].
    pub fn get_unsent_messages(&self, channel: ChannelId) -> CommandResult<Vec<Message>> {
        self.manager
            .get_unsent_messages(channel)
            .await_result(self.timeout)
    }

    /// See [`ChannelManager::transfer`].
    pub fn transfer(&self, old: ChannelId, new: ChannelId) -> CommandResult<usize> {
        self.manager.transfer(old, new).await_result(self.timeout)
    }

    /// See [`ChannelManager::detach`].
    pub fn detach(&self, channel: ChannelId) -> CommandResult<DetachedChannel> {
        self.manager.detach(channel).await_result(self.timeout)
    }

    /// See [`ChannelManager::attach`].
    pub fn attach(&self, channel: DetachedChannel) -> CommandResult<ChannelId> {
        self.manager.attach(channel).await_result(self.timeout)
    }

    /// See [`ChannelManager::get_stats`].
    pub fn get_stats(&self, reset: bool) -> CommandResult<StatsSnapshot> {
        self.manager.get_stats(reset).await_result(self.timeout)
    }

    /// Shut down and wait for the reactor thread to exit.
    pub fn shutdown(&self) -> CommandResult<()> {
        let result = self.manager.shutdown().await_result(self.timeout);
        if result.is_ok() {
            self.manager.join();
        }
        result
    }
}

/// Resolve `host:port`, `mqtt://host[:port]` or `tcp://host[:port]`.
/// IPv6 hosts must be bracketed.
///
/// # Errors
///
/// Returns [`MqttError::InvalidAddress`] for unknown schemes, empty hosts
/// and names that do not resolve.
pub fn resolve_address(address: &str) -> MqttResult<SocketAddr> {
    let trimmed = address.trim();
    let authority = match trimmed.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(MqttError::InvalidAddress(format!(
                "unsupported scheme '{scheme}' in {address}"
            )))
        },
        None => trimmed,
    };
    let authority = authority.trim_end_matches('/');
    if authority.is_empty() || authority.starts_with(':') {
        return Err(MqttError::InvalidAddress(format!("missing host in '{address}'")));
    }

    let target = if has_port(authority) {
        authority.to_string()
    } else {
        format!("{authority}:{DEFAULT_PORT}")
    };
    target
        .to_socket_addrs()
        .map_err(|e| MqttError::InvalidAddress(format!("{address}: {e}")))?
        .next()
        .ok_or_else(|| MqttError::InvalidAddress(format!("{address}: no addresses")))
}

fn has_port(authority: &str) -> bool {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split_once("]:").is_some();
    }
    matches!(
        authority.rsplit_once(':'),
        Some((host, port)) if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
    )
}
