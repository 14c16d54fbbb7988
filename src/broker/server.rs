//! TCP listener feeding accepted sockets to a channel manager.

use super::mock::MockBroker;
use crate::packet::MqttResult;
use crate::reactor::{ChannelManager, Handler};
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Counters for a [`BrokerServer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Sockets handed to the engine.
    pub total_accepted: u64,

    /// Failed accepts and rejected hand-offs.
    pub accept_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    errors: AtomicU64,
}

/// Accepts connections on a std listener thread and opens a broker-side
/// channel for each one.
#[derive(Debug)]
pub struct BrokerServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerServer {
    /// Bind `address` and start accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the accept thread cannot start.
    pub fn bind(address: &str, manager: ChannelManager, broker: Arc<MockBroker>) -> MqttResult<Self> {
        let listener = TcpListener::bind(address)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());
        let handler: Arc<dyn Handler> = broker;

        let thread = {
            let running = Arc::clone(&running);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("r0n-mqtt-accept".to_string())
                .spawn(move || accept_loop(&listener, &manager, &handler, &running, &counters))?
        };

        info!(address = %local_addr, "Broker listening");
        Ok(Self {
            local_addr,
            running,
            counters,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Bound address; the real port when bound to port 0.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Connections accepted and accept errors since binding.
    #[must_use]
    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            total_accepted: self.counters.accepted.load(Ordering::Relaxed),
            accept_errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting and wait for the accept thread. Channels already
    /// opened stay with the engine.
    pub fn stop(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if self.running.swap(false, Ordering::AcqRel) {
            // Unblock accept() with a throwaway connection.
            if let Err(e) = TcpStream::connect(wake_addr(self.local_addr)) {
                debug!(error = %e, "Wake connection failed");
            }
        }
        if thread.join().is_err() {
            error!("Accept thread panicked");
        }
        info!(address = %self.local_addr, "Broker stopped");
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: &TcpListener,
    manager: &ChannelManager,
    handler: &Arc<dyn Handler>,
    running: &AtomicBool,
    counters: &Arc<Counters>,
) {
    debug!("Accept loop started");
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if manager.status().is_terminated() {
                    warn!("Engine stopped, closing listener");
                    break;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "Failed to set nodelay");
                }

                counters.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, "Accepted connection");
                let counters = Arc::clone(counters);
                manager
                    .new_server_channel(stream, Arc::clone(handler))
                    .on_complete(move |result| {
                        if let Err(e) = result {
                            counters.errors.fetch_add(1, Ordering::Relaxed);
                            warn!(peer = %peer, error = %e, "Rejected connection");
                        }
                    });
            },
            Err(e) if is_fatal_accept_error(&e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Fatal accept error");
                break;
            },
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Transient accept error");
            },
        }
    }
    running.store(false, Ordering::Release);
    debug!("Accept loop stopped");
}

/// Loopback address reaching a listener bound to `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, v4.port()))
        },
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, v6.port()))
        },
        other => other,
    }
}

fn is_fatal_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::NotFound
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, EngineConfig};
    use std::time::{Duration, Instant};

    #[test]
    fn test_wake_addr() {
        let any: SocketAddr = "0.0.0.0:1883".parse().unwrap();
        assert_eq!(wake_addr(any), "127.0.0.1:1883".parse().unwrap());
        let any6: SocketAddr = "[::]:1883".parse().unwrap();
        assert_eq!(wake_addr(any6), "[::1]:1883".parse().unwrap());
        let fixed: SocketAddr = "10.0.0.1:1883".parse().unwrap();
        assert_eq!(wake_addr(fixed), fixed);
    }

    #[test]
    fn test_bind_accept_stop() {
        let manager = ChannelManager::init(EngineConfig::default()).unwrap();
        let broker = Arc::new(MockBroker::new(BrokerConfig::default()));
        let server = BrokerServer::bind("127.0.0.1:0", manager.clone(), broker).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.is_running());

        let _client = TcpStream::connect(server.local_addr()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.stats().total_accepted == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.stats().total_accepted, 1);

        server.stop();
        assert!(!server.is_running());
        assert!(TcpStream::connect(server.local_addr()).is_err());

        manager.shutdown().await_result(Duration::from_secs(5)).unwrap();
        manager.join();
    }
}
