//! Shared helpers for loopback integration tests.

#![allow(dead_code)]

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use r0n_mqtt::config::EngineConfig;
use r0n_mqtt::packet::{decode, MqttError, Packet, MAX_REMAINING_LENGTH};
use r0n_mqtt::reactor::{BlockingChannelManager, ChannelContext, Handler, HandlerResult};
use r0n_mqtt::Message;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

/// Engine settings with short timers.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        resend_interval: Duration::from_millis(300),
        connect_timeout: Duration::from_secs(2),
        blocking_timeout: WAIT,
        ..EngineConfig::default()
    }
}

pub fn engine() -> BlockingChannelManager {
    BlockingChannelManager::init(fast_config()).unwrap()
}

pub fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// A hand-driven MQTT endpoint on a plain blocking socket.
pub struct RawPeer {
    stream: TcpStream,
    buf: BytesMut,
}

impl RawPeer {
    pub fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().unwrap();
        Self::wrap(stream)
    }

    pub fn connect(addr: SocketAddr) -> Self {
        Self::wrap(TcpStream::connect(addr).unwrap())
    }

    fn wrap(stream: TcpStream) -> Self {
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    pub fn send(&mut self, packet: Packet) {
        let bytes = packet.encode().unwrap();
        self.stream.write_all(&bytes).unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    /// Next packet, or `None` on timeout or EOF.
    pub fn recv_within(&mut self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) =
                decode(&mut self.buf, Instant::now(), MAX_REMAINING_LENGTH).unwrap()
            {
                return Some(message.into_packet());
            }
            let left = deadline.checked_duration_since(Instant::now())?;
            if left.is_zero() {
                return None;
            }
            self.stream.set_read_timeout(Some(left)).unwrap();
            let mut chunk = [0_u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return None
                },
                Err(_) => return None,
            }
        }
    }

    pub fn recv(&mut self) -> Packet {
        self.recv_within(WAIT).expect("expected a packet")
    }

    /// True once the other side has closed the connection.
    pub fn closed_within(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            self.stream.set_read_timeout(Some(left.max(Duration::from_millis(1)))).unwrap();
            let mut chunk = [0_u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return false
                },
                Err(_) => return true,
            }
        }
    }
}

/// Handler callbacks as observed by tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Opened,
    Attached,
    Detached,
    Received(Packet),
    Sent(Packet),
    Closed(Option<String>),
}

/// Records every callback into a channel.
pub struct Recorder {
    events: Sender<Event>,
}

impl Recorder {
    pub fn new() -> (std::sync::Arc<Self>, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (std::sync::Arc::new(Self { events: tx }), rx)
    }

    fn push(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

impl Handler for Recorder {
    fn channel_opened(&self, _ctx: &mut ChannelContext<'_, '_>) -> HandlerResult {
        self.push(Event::Opened);
        Ok(())
    }

    fn channel_closed(&self, _ctx: &mut ChannelContext<'_, '_>, cause: Option<&MqttError>) {
        self.push(Event::Closed(cause.map(ToString::to_string)));
    }

    fn channel_attached(&self, _ctx: &mut ChannelContext<'_, '_>) -> HandlerResult {
        self.push(Event::Attached);
        Ok(())
    }

    fn channel_detached(&self, _ctx: &mut ChannelContext<'_, '_>) {
        self.push(Event::Detached);
    }

    fn message_sent(&self, _ctx: &mut ChannelContext<'_, '_>, message: &Message) -> HandlerResult {
        self.push(Event::Sent(message.packet().clone()));
        Ok(())
    }

    fn on_conn_ack(
        &self,
        _ctx: &mut ChannelContext<'_, '_>,
        packet: &r0n_mqtt::packet::ConnAck,
    ) -> HandlerResult {
        self.push(Event::Received(Packet::ConnAck(*packet)));
        Ok(())
    }

    fn on_publish(
        &self,
        _ctx: &mut ChannelContext<'_, '_>,
        packet: &r0n_mqtt::packet::Publish,
    ) -> HandlerResult {
        self.push(Event::Received(Packet::Publish(packet.clone())));
        Ok(())
    }

    fn on_ping_resp(&self, _ctx: &mut ChannelContext<'_, '_>) -> HandlerResult {
        self.push(Event::Received(Packet::PingResp));
        Ok(())
    }
}

/// Wait for the first event matching `pred`.
pub fn wait_for(events: &Receiver<Event>, pred: impl Fn(&Event) -> bool) -> Option<Event> {
    let deadline = Instant::now() + WAIT;
    while let Ok(event) = events.recv_deadline(deadline) {
        if pred(&event) {
            return Some(event);
        }
    }
    None
}
