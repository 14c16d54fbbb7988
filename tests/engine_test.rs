//! Engine behavior over loopback TCP, driven by a raw MQTT peer.

mod common;

use common::{engine, listener, wait_for, Event, RawPeer, Recorder, WAIT};
use crossbeam_channel::Receiver;
use r0n_mqtt::channel::ChannelState;
use r0n_mqtt::command::CommandError;
use r0n_mqtt::packet::{
    ConnAck, Connect, ConnectReturnCode, MqttError, Packet, ProtocolVersion, PubAck, Publish,
};
use r0n_mqtt::reactor::{BlockingChannelManager, ChannelContext, EngineStatus, Handler, HandlerResult};
use r0n_mqtt::{ChannelId, QoS};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn open(manager: &BlockingChannelManager) -> (ChannelId, RawPeer, Receiver<Event>) {
    let (listener, addr) = listener();
    let (handler, events) = Recorder::new();
    let id = manager.new_client_channel(&addr, handler).unwrap();
    let peer = RawPeer::accept(&listener);
    assert_eq!(wait_for(&events, |e| *e == Event::Opened), Some(Event::Opened));
    (id, peer, events)
}

fn handshake(manager: &BlockingChannelManager, id: ChannelId, peer: &mut RawPeer, keep_alive: u16) {
    let mut connect = Connect::new(ProtocolVersion::V311, "engine-test");
    connect.keep_alive = keep_alive;
    assert_eq!(manager.send(id, Packet::Connect(connect)).unwrap(), None);
    assert!(matches!(peer.recv(), Packet::Connect(c) if c.client_id == "engine-test"));
    peer.send(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)));
}

fn publish(topic: &str, payload: &'static str, qos: QoS) -> Packet {
    Packet::Publish(Publish::new(topic, payload).with_qos(qos))
}

#[test]
fn test_connect_then_publish_qos1_completes_with_puback() {
    let manager = engine();
    let (listener, addr) = listener();
    let (handler, events) = Recorder::new();
    let id = manager.new_client_channel(&addr, handler).unwrap();
    let mut peer = RawPeer::accept(&listener);

    let mut connect = Connect::new(ProtocolVersion::V311, "c1");
    connect.clean_session = true;
    connect.keep_alive = 60;
    assert_eq!(manager.send(id, Packet::Connect(connect)).unwrap(), None);
    let Packet::Connect(received) = peer.recv() else {
        panic!("expected CONNECT");
    };
    assert_eq!(received.client_id, "c1");
    assert!(received.clean_session);
    assert_eq!(received.keep_alive, 60);

    peer.send(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)));
    assert!(wait_for(&events, |e| matches!(e, Event::Received(Packet::ConnAck(_)))).is_some());

    let pending = manager.manager().send(id, publish("t", "hi", QoS::AtLeastOnce));
    let Packet::Publish(received) = peer.recv() else {
        panic!("expected PUBLISH");
    };
    assert_eq!(received.topic, "t");
    assert_eq!(&received.payload[..], b"hi");
    assert_eq!(received.message_id, 1);
    assert!(!received.dup);
    assert!(!pending.is_done());

    peer.send(Packet::PubAck(PubAck::new(received.message_id)));
    let ack = pending.await_result(WAIT).unwrap();
    assert_eq!(ack, Some(Packet::PubAck(PubAck::new(1))));

    let stats = manager.get_stats(false).unwrap();
    assert_eq!(stats.messages_sent, 2);
    assert_eq!(stats.messages_in_flight, 0);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.open_channels, 1);
}

#[test]
fn test_sends_are_written_in_submission_order() {
    let manager = engine();
    let (id, mut peer, _events) = open(&manager);

    let ops: Vec<_> = (0..20)
        .map(|i| {
            let packet = Packet::Publish(Publish::new("order", format!("{i}")));
            manager.manager().send(id, packet)
        })
        .collect();
    for i in 0..20 {
        let Packet::Publish(p) = peer.recv() else {
            panic!("expected PUBLISH");
        };
        assert_eq!(&p.payload[..], format!("{i}").as_bytes());
    }
    for op in ops {
        assert_eq!(op.await_result(WAIT).unwrap(), None);
    }
}

#[test]
fn test_sends_from_several_threads_keep_per_thread_order() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    let manager = engine();
    let (id, mut peer, _events) = open(&manager);

    let senders: Vec<_> = (0..THREADS)
        .map(|t| {
            let manager = manager.manager().clone();
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|i| {
                        let packet = Packet::Publish(Publish::new("order", format!("{t}:{i}")));
                        manager.send(id, packet)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut next = [0_usize; THREADS];
    for _ in 0..THREADS * PER_THREAD {
        let Packet::Publish(p) = peer.recv() else {
            panic!("expected PUBLISH");
        };
        let text = String::from_utf8(p.payload.to_vec()).unwrap();
        let (t, i) = text.split_once(':').unwrap();
        let (t, i): (usize, usize) = (t.parse().unwrap(), i.parse().unwrap());
        assert_eq!(i, next[t], "thread {t} out of order");
        next[t] += 1;
    }
    assert_eq!(next, [PER_THREAD; THREADS]);

    for sender in senders {
        for op in sender.join().unwrap() {
            assert_eq!(op.await_result(WAIT).unwrap(), None);
        }
    }
}

#[test]
fn test_unacknowledged_publish_is_resent_as_duplicate() {
    let manager = engine();
    let (id, mut peer, _events) = open(&manager);

    let pending = manager.manager().send(id, publish("resend", "x", QoS::AtLeastOnce));
    let Packet::Publish(first) = peer.recv() else {
        panic!("expected PUBLISH");
    };
    assert!(!first.dup);

    let Packet::Publish(second) = peer.recv() else {
        panic!("expected resend");
    };
    assert!(second.dup);
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.payload, first.payload);

    peer.send(Packet::PubAck(PubAck::new(first.message_id)));
    assert!(pending.await_result(WAIT).unwrap().is_some());
    assert!(manager.get_stats(false).unwrap().messages_resent >= 1);
}

#[test]
fn test_client_keep_alive_ping() {
    let manager = engine();
    let (id, mut peer, events) = open(&manager);
    handshake(&manager, id, &mut peer, 1);

    assert_eq!(peer.recv_within(Duration::from_secs(3)), Some(Packet::PingReq));
    peer.send(Packet::PingResp);
    assert!(wait_for(&events, |e| *e == Event::Received(Packet::PingResp)).is_some());
}

#[test]
fn test_client_keep_alive_timeout_closes_channel() {
    let manager = engine();
    let (id, mut peer, events) = open(&manager);
    handshake(&manager, id, &mut peer, 1);

    assert_eq!(peer.recv_within(Duration::from_secs(3)), Some(Packet::PingReq));
    let closed = wait_for(&events, |e| matches!(e, Event::Closed(_)));
    let Some(Event::Closed(Some(cause))) = closed else {
        panic!("expected close with cause, got {closed:?}");
    };
    assert!(cause.contains("Keep-alive"));
    assert!(peer.closed_within(WAIT));
}

#[test]
fn test_disconnect_closes_cleanly() {
    let manager = engine();
    let (id, mut peer, events) = open(&manager);

    assert_eq!(manager.send(id, Packet::Disconnect).unwrap(), None);
    assert_eq!(peer.recv(), Packet::Disconnect);
    assert!(peer.closed_within(WAIT));
    assert_eq!(
        wait_for(&events, |e| matches!(e, Event::Closed(_))),
        Some(Event::Closed(None))
    );
    assert!(manager.send(id, Packet::PingReq).is_err());
}

#[test]
fn test_peer_eof_closes_channel() {
    let manager = engine();
    let (_id, peer, events) = open(&manager);
    drop(peer);
    assert!(wait_for(&events, |e| matches!(e, Event::Closed(_))).is_some());
}

#[test]
fn test_protocol_violation_closes_only_that_channel() {
    let manager = engine();
    let (_bad, mut bad_peer, bad_events) = open(&manager);
    let (good, mut good_peer, _good_events) = open(&manager);

    bad_peer.send_raw(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]);
    let closed = wait_for(&bad_events, |e| matches!(e, Event::Closed(_)));
    assert!(matches!(closed, Some(Event::Closed(Some(_)))));

    assert_eq!(manager.send(good, Packet::PingReq).unwrap(), None);
    assert_eq!(good_peer.recv(), Packet::PingReq);
}

#[test]
fn test_close_cancels_pending_and_keeps_unsent() {
    let manager = engine();
    let (id, mut peer, events) = open(&manager);

    let pending = manager.manager().send(id, publish("a", "1", QoS::AtLeastOnce));
    assert!(matches!(peer.recv(), Packet::Publish(_)));

    manager.close(id, None).unwrap();
    assert!(pending.await_result(WAIT).unwrap_err().is_cancelled());
    assert_eq!(
        wait_for(&events, |e| matches!(e, Event::Closed(_))),
        Some(Event::Closed(None))
    );

    let unsent = manager.get_unsent_messages(id).unwrap();
    assert_eq!(unsent.len(), 1);
    assert!(matches!(unsent[0].packet(), Packet::Publish(p) if p.topic == "a"));
}

#[test]
fn test_close_with_cause_fails_pending_with_cause() {
    let manager = engine();
    let (id, mut peer, events) = open(&manager);

    let pending = manager.manager().send(id, publish("a", "1", QoS::AtLeastOnce));
    assert!(matches!(peer.recv(), Packet::Publish(_)));

    manager
        .close(id, Some(MqttError::Handler("replaced".to_string())))
        .unwrap();
    let Err(CommandError::Closed(cause)) = pending.await_result(WAIT) else {
        panic!("expected close with cause");
    };
    assert!(matches!(&*cause, MqttError::Handler(m) if m == "replaced"));
    assert!(matches!(
        wait_for(&events, |e| matches!(e, Event::Closed(_))),
        Some(Event::Closed(Some(_)))
    ));
}

#[test]
fn test_cancel_pending() {
    let manager = engine();
    let (id, mut peer, _events) = open(&manager);

    let pending = manager.manager().send(id, publish("a", "1", QoS::AtLeastOnce));
    assert!(matches!(peer.recv(), Packet::Publish(_)));
    assert_eq!(manager.cancel_pending(id).unwrap(), 1);
    assert!(pending.await_result(WAIT).unwrap_err().is_cancelled());
}

#[test]
fn test_transfer_moves_unsent_messages() {
    let manager = engine();
    let (old, mut old_peer, _old_events) = open(&manager);

    let _first = manager.manager().send(old, publish("t", "first", QoS::AtLeastOnce));
    let Packet::Publish(original) = old_peer.recv() else {
        panic!("expected PUBLISH");
    };
    manager.close(old, None).unwrap();

    let (new, mut new_peer, _new_events) = open(&manager);
    assert_eq!(manager.transfer(old, new).unwrap(), 1);

    let Packet::Publish(moved) = new_peer.recv() else {
        panic!("expected transferred PUBLISH");
    };
    assert_eq!(moved.payload, original.payload);
    assert!(moved.dup);

    // The old handle now routes to the new channel.
    assert_eq!(manager.send(old, publish("t", "second", QoS::AtMostOnce)).unwrap(), None);
    let Packet::Publish(routed) = new_peer.recv() else {
        panic!("expected PUBLISH via old handle");
    };
    assert_eq!(&routed.payload[..], b"second");
}

#[test]
fn test_alias_dropped_once_target_is_gone() {
    let manager = engine();
    let (old, mut old_peer, _old_events) = open(&manager);

    let _first = manager.manager().send(old, publish("t", "first", QoS::AtLeastOnce));
    assert!(matches!(old_peer.recv(), Packet::Publish(_)));
    manager.close(old, None).unwrap();

    let (new, mut new_peer, _new_events) = open(&manager);
    assert_eq!(manager.transfer(old, new).unwrap(), 1);
    let Packet::Publish(moved) = new_peer.recv() else {
        panic!("expected transferred PUBLISH");
    };
    new_peer.send(Packet::PubAck(PubAck::new(moved.message_id)));

    let second = manager.manager().send(old, publish("t", "second", QoS::AtLeastOnce));
    let Packet::Publish(routed) = new_peer.recv() else {
        panic!("expected PUBLISH via old handle");
    };
    new_peer.send(Packet::PubAck(PubAck::new(routed.message_id)));
    assert!(second.await_result(WAIT).unwrap().is_some());

    let stats = manager.get_stats(false).unwrap();
    assert_eq!(stats.aliased_channels, 1);
    assert_eq!(stats.messages_in_flight, 0);

    manager.close(new, None).unwrap();
    let stats = manager.get_stats(false).unwrap();
    assert_eq!(stats.aliased_channels, 0);
    assert_eq!(stats.retired_channels, 0);
    assert!(matches!(
        manager.send(old, Packet::PingReq),
        Err(CommandError::Fault(MqttError::UnknownChannel(_)))
    ));
}

#[test]
fn test_transfer_without_free_ids_keeps_messages() {
    let manager = engine();
    let (old, mut old_peer, _old_events) = open(&manager);

    let _kept = manager.manager().send(old, publish("t", "kept", QoS::AtLeastOnce));
    assert!(matches!(old_peer.recv(), Packet::Publish(_)));
    manager.close(old, None).unwrap();

    // Reserve every message id on the target.
    let (new, _new_peer, _new_events) = open(&manager);
    let fill: Vec<_> = (0..u16::MAX)
        .map(|_| manager.manager().send(new, publish("fill", "x", QoS::AtLeastOnce)))
        .collect();

    assert!(matches!(
        manager.transfer(old, new),
        Err(CommandError::Fault(MqttError::MessageIdsExhausted))
    ));
    let unsent = manager.get_unsent_messages(old).unwrap();
    assert_eq!(unsent.len(), 1);
    assert!(matches!(unsent[0].packet(), Packet::Publish(p) if &p.payload[..] == b"kept"));
    assert!(fill.iter().all(|op| !op.is_done()));
}

#[test]
fn test_detach_and_attach_across_engines() {
    let first = engine();
    let second = engine();
    let (id, mut peer, events) = open(&first);

    let detached = first.detach(id).unwrap();
    assert_eq!(detached.id(), id);
    assert_eq!(detached.state(), ChannelState::Connected);
    assert!(wait_for(&events, |e| *e == Event::Detached).is_some());
    assert!(matches!(
        first.send(id, Packet::PingReq),
        Err(CommandError::Fault(MqttError::UnknownChannel(_)))
    ));

    assert_eq!(second.attach(detached).unwrap(), id);
    assert!(wait_for(&events, |e| *e == Event::Attached).is_some());
    assert_eq!(second.send(id, Packet::PingReq).unwrap(), None);
    assert_eq!(peer.recv(), Packet::PingReq);

    peer.send(Packet::PingResp);
    assert!(wait_for(&events, |e| *e == Event::Received(Packet::PingResp)).is_some());
}

#[test]
fn test_shutdown_drains_pending_operations() {
    let manager = engine();
    let (id, mut peer, events) = open(&manager);

    let pending = manager.manager().send(id, publish("a", "1", QoS::AtLeastOnce));
    assert!(matches!(peer.recv(), Packet::Publish(_)));

    manager.shutdown().unwrap();
    assert!(pending.await_result(WAIT).is_err());
    assert!(wait_for(&events, |e| matches!(e, Event::Closed(_))).is_some());
    assert_eq!(manager.status(), EngineStatus::Stopped);
    assert!(matches!(
        manager.send(id, Packet::PingReq),
        Err(CommandError::Engine(_))
    ));
    assert!(peer.closed_within(WAIT));
}

struct Faulty;

impl Handler for Faulty {
    fn on_publish(&self, _ctx: &mut ChannelContext<'_, '_>, _packet: &Publish) -> HandlerResult {
        Err(MqttError::Handler("rejected".to_string()))
    }
}

#[test]
fn test_handler_fault_closes_channel() {
    let manager = engine();
    let (listener, addr) = listener();
    let id = manager.new_client_channel(&addr, Arc::new(Faulty)).unwrap();
    let mut peer = RawPeer::accept(&listener);

    peer.send(Packet::Publish(Publish::new("x", "y")));
    assert!(peer.closed_within(WAIT));
    assert!(manager.send(id, Packet::PingReq).is_err());
    assert!(manager.status().is_running());
}

#[test]
fn test_connect_refused_address() {
    let manager = engine();
    let (listener, addr) = listener();
    drop(listener);
    let (handler, _events) = Recorder::new();
    assert!(manager.new_client_channel(&addr, handler).is_err());
    assert!(manager.status().is_running());
}
