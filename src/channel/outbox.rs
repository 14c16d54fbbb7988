//! Outbound bookkeeping: the FIFO send queue and the in-flight table.

use super::id::MessageIdAllocator;
use crate::command::{CommandError, Completion};
use crate::packet::{Message, MqttError, MqttResult, Packet, PacketType};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Result of a send: the acknowledging packet for messages that need one,
/// `None` for messages that complete once written.
pub type Delivery = Option<Packet>;

struct Queued {
    message: Message,
    completion: Option<Completion<Delivery>>,
    written: usize,
    resend: bool,
    was_sent: bool,
    seq: u64,
}

struct InFlight {
    message: Message,
    completion: Option<Completion<Delivery>>,
    first_sent: Instant,
    last_sent: Instant,
    resend_queued: bool,
    seq: u64,
}

/// A message fully written to the socket.
#[derive(Debug)]
pub struct Written {
    /// The message as it went out.
    pub message: Message,
    /// Whether this was a resend of an in-flight message.
    pub resend: bool,
}

/// A message handed over by a channel that is going away.
#[derive(Debug)]
pub struct Unsent {
    /// The message.
    pub message: Message,
    /// The caller still waiting on it, if any.
    pub completion: Option<Completion<Delivery>>,
    /// Whether it had been written at least once.
    pub was_sent: bool,
}

/// Send queue plus in-flight table for one channel.
///
/// A message id stays reserved from the moment its message is queued until
/// the matching acknowledgment removes it from the in-flight table.
#[derive(Default)]
pub struct Outbox {
    queue: VecDeque<Queued>,
    in_flight: HashMap<u16, InFlight>,
    ids_in_use: HashSet<u16>,
    ids: MessageIdAllocator,
    next_seq: u64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message. Messages needing acknowledgment get an id if they
    /// carry 0.
    ///
    /// # Errors
    ///
    /// [`MqttError::MessageIdInUse`] for an explicit id already reserved,
    /// [`MqttError::MessageIdsExhausted`] when no id is free.
    pub fn enqueue(
        &mut self,
        message: Message,
        completion: Option<Completion<Delivery>>,
    ) -> MqttResult<()> {
        let mut slot = completion;
        self.push(message, &mut slot, false, false)
    }

    /// Like [`Outbox::enqueue`], taking the completion out of `slot` only
    /// once the message is accepted.
    pub fn enqueue_from(
        &mut self,
        message: Message,
        slot: &mut Option<Completion<Delivery>>,
    ) -> MqttResult<()> {
        self.push(message, slot, false, false)
    }

    /// Queue a message taken over from another channel. Its id is kept when
    /// free here and replaced otherwise; a message that already went out once
    /// is flagged as a duplicate.
    pub fn adopt(&mut self, unsent: Unsent) -> MqttResult<()> {
        let message = if unsent.was_sent {
            unsent.message.with_dup()?
        } else {
            unsent.message
        };
        let mut slot = unsent.completion;
        self.push(message, &mut slot, unsent.was_sent, true)
    }

    fn push(
        &mut self,
        mut message: Message,
        slot: &mut Option<Completion<Delivery>>,
        was_sent: bool,
        reassign_conflicts: bool,
    ) -> MqttResult<()> {
        if message.packet().requires_ack() {
            let requested = message.packet().message_id().unwrap_or(0);
            let id = if requested == 0 {
                self.allocate()?
            } else if self.ids_in_use.contains(&requested) {
                if !reassign_conflicts {
                    return Err(MqttError::MessageIdInUse(requested));
                }
                self.allocate()?
            } else {
                requested
            };
            if id != requested {
                message = message.with_message_id(id)?;
            }
            self.ids_in_use.insert(id);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(Queued {
            message,
            completion: slot.take(),
            written: 0,
            resend: false,
            was_sent,
            seq,
        });
        Ok(())
    }

    fn allocate(&mut self) -> MqttResult<u16> {
        let in_use = &self.ids_in_use;
        self.ids.allocate(|id| in_use.contains(&id))
    }

    /// Bytes still to write for the front of the queue. Resends whose
    /// original was acknowledged meanwhile are dropped here.
    pub fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            let front = self.queue.front()?;
            if front.resend && front.written == 0 && !self.is_in_flight(&front.message) {
                self.queue.pop_front();
                continue;
            }
            return Some(front.message.encoded().slice(front.written..));
        }
    }

    fn is_in_flight(&self, message: &Message) -> bool {
        message
            .packet()
            .message_id()
            .is_some_and(|id| self.in_flight.contains_key(&id))
    }

    /// Record `n` bytes written from the front of the queue. Returns the
    /// message once all of it is on the wire.
    pub fn advance(&mut self, n: usize, now: Instant) -> Option<Written> {
        let front = self.queue.front_mut()?;
        front.written += n;
        if front.written < front.message.encoded().len() {
            return None;
        }
        let done = self.queue.pop_front()?;

        if done.resend {
            if let Some(id) = done.message.packet().message_id() {
                if let Some(entry) = self.in_flight.get_mut(&id) {
                    entry.last_sent = now;
                    entry.resend_queued = false;
                }
            }
            return Some(Written {
                message: done.message,
                resend: true,
            });
        }

        match done.message.packet().message_id() {
            Some(id) if done.message.packet().requires_ack() => {
                self.in_flight.insert(
                    id,
                    InFlight {
                        message: done.message.clone(),
                        completion: done.completion,
                        first_sent: now,
                        last_sent: now,
                        resend_queued: false,
                        seq: done.seq,
                    },
                );
            },
            _ => {
                if let Some(completion) = done.completion {
                    completion.complete(None);
                }
            },
        }
        Some(Written {
            message: done.message,
            resend: false,
        })
    }

    /// Settle the in-flight message `id` of kind `kind` with `ack`. Returns
    /// the time since it was first sent.
    pub fn acknowledge(
        &mut self,
        id: u16,
        kind: PacketType,
        ack: &Packet,
        now: Instant,
    ) -> Option<Duration> {
        let matches = self
            .in_flight
            .get(&id)
            .is_some_and(|entry| entry.message.packet().packet_type() == kind);
        if !matches {
            return None;
        }
        let entry = self.in_flight.remove(&id)?;
        self.ids_in_use.remove(&id);
        if let Some(completion) = entry.completion {
            completion.complete(Some(ack.clone()));
        }
        Some(now.saturating_duration_since(entry.first_sent))
    }

    /// Queue a duplicate of every in-flight message unacknowledged for
    /// `interval`. Returns how many were queued and the delay until the next
    /// one falls due.
    pub fn schedule_resends(
        &mut self,
        now: Instant,
        interval: Duration,
    ) -> MqttResult<(usize, Option<Duration>)> {
        let mut due: Vec<(u64, u16)> = Vec::new();
        let mut next: Option<Duration> = None;

        for (id, entry) in &self.in_flight {
            if entry.resend_queued {
                continue;
            }
            let waited = now.saturating_duration_since(entry.last_sent);
            if waited >= interval {
                due.push((entry.seq, *id));
            } else {
                let wait = interval - waited;
                next = Some(next.map_or(wait, |d| d.min(wait)));
            }
        }
        due.sort_unstable();

        for (_, id) in &due {
            if let Some(entry) = self.in_flight.get_mut(id) {
                entry.message = entry.message.with_dup()?;
                entry.resend_queued = true;
                self.queue.push_back(Queued {
                    message: entry.message.clone(),
                    completion: None,
                    written: 0,
                    resend: true,
                    was_sent: true,
                    seq: entry.seq,
                });
            }
        }
        if !due.is_empty() {
            next = Some(next.map_or(interval, |d| d.min(interval)));
        }
        Ok((due.len(), next))
    }

    /// Whether anything is waiting to be written.
    pub fn has_pending_writes(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Whether a partially written message sits at the front of the queue.
    pub fn mid_write(&self) -> bool {
        self.queue.front().is_some_and(|q| q.written > 0)
    }

    /// Messages still queued, resends excluded.
    pub fn queued_len(&self) -> usize {
        self.queue.iter().filter(|q| !q.resend).count()
    }

    /// Messages written and awaiting acknowledgment.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Messages holding a message id, queued or in flight.
    pub fn reserved_ids(&self) -> usize {
        self.ids_in_use.len()
    }

    /// Ids still available to new or adopted messages.
    pub fn free_ids(&self) -> usize {
        usize::from(u16::MAX) - self.ids_in_use.len()
    }

    /// Unacknowledged and unwritten messages in send order, connection
    /// control packets excluded.
    pub fn unsent_messages(&self) -> Vec<Message> {
        let mut pending: Vec<(u64, &Message)> = self
            .queue
            .iter()
            .filter(|q| !q.resend)
            .map(|q| (q.seq, &q.message))
            .chain(self.in_flight.values().map(|e| (e.seq, &e.message)))
            .filter(|(_, m)| !m.packet().is_connection_control())
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, m)| m.clone()).collect()
    }

    /// Remove everything, in send order. Connection-control packets are
    /// completed with a failure and left out.
    pub fn take_all(&mut self, error: impl Fn() -> CommandError) -> Vec<Unsent> {
        let mut pending: Vec<(u64, Unsent)> = Vec::new();
        for q in self.queue.drain(..) {
            if q.resend {
                continue;
            }
            pending.push((
                q.seq,
                Unsent {
                    was_sent: q.was_sent || q.written > 0,
                    message: q.message,
                    completion: q.completion,
                },
            ));
        }
        for (_, e) in self.in_flight.drain() {
            pending.push((
                e.seq,
                Unsent {
                    message: e.message,
                    completion: e.completion,
                    was_sent: true,
                },
            ));
        }
        self.ids_in_use.clear();
        pending.sort_by_key(|(seq, _)| *seq);

        pending
            .into_iter()
            .map(|(_, unsent)| unsent)
            .filter_map(|unsent| {
                if unsent.message.packet().is_connection_control() {
                    if let Some(completion) = unsent.completion {
                        completion.fail(error());
                    }
                    None
                } else {
                    Some(unsent)
                }
            })
            .collect()
    }

    /// Fail every waiting caller while keeping the messages queued.
    pub fn fail_waiters(&mut self, error: impl Fn() -> CommandError) -> usize {
        let queued = self.queue.iter_mut().filter_map(|q| q.completion.take());
        let in_flight = self.in_flight.values_mut().filter_map(|e| e.completion.take());
        let mut count = 0;
        for completion in queued.chain(in_flight) {
            completion.fail(error());
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PendingOperation;
    use crate::packet::{PubAck, Publish, QoS, SubAck, Subscribe, Subscription};

    fn publish(qos: QoS) -> Message {
        Message::outbound(Packet::Publish(Publish::new("a/b", "x").with_qos(qos))).unwrap()
    }

    fn flush(outbox: &mut Outbox, now: Instant) -> Vec<Written> {
        let mut written = Vec::new();
        while let Some(chunk) = outbox.next_chunk() {
            if let Some(w) = outbox.advance(chunk.len(), now) {
                written.push(w);
            }
        }
        written
    }

    fn puback(id: u16) -> Packet {
        Packet::PubAck(PubAck::new(id))
    }

    #[test]
    fn test_reserved_and_free_ids() {
        let mut outbox = Outbox::new();
        assert_eq!(outbox.free_ids(), 65_535);
        outbox.enqueue(publish(QoS::AtLeastOnce), None).unwrap();
        outbox.enqueue(publish(QoS::AtMostOnce), None).unwrap();
        assert_eq!(outbox.reserved_ids(), 1);
        assert_eq!(outbox.free_ids(), 65_534);

        flush(&mut outbox, Instant::now());
        assert_eq!(outbox.reserved_ids(), 1);
        outbox.acknowledge(1, PacketType::Publish, &puback(1), Instant::now());
        assert_eq!(outbox.reserved_ids(), 0);
    }

    #[test]
    fn test_qos0_completes_on_write() {
        let mut outbox = Outbox::new();
        let (op, completion) = PendingOperation::new();
        outbox.enqueue(publish(QoS::AtMostOnce), Some(completion)).unwrap();
        assert!(!op.is_done());

        let written = flush(&mut outbox, Instant::now());
        assert_eq!(written.len(), 1);
        assert!(op.try_result().unwrap().unwrap().is_none());
        assert_eq!(outbox.in_flight_len(), 0);
    }

    #[test]
    fn test_qos1_completes_on_ack() {
        let mut outbox = Outbox::new();
        let (op, completion) = PendingOperation::new();
        outbox.enqueue(publish(QoS::AtLeastOnce), Some(completion)).unwrap();

        let t0 = Instant::now();
        let written = flush(&mut outbox, t0);
        let id = written[0].message.packet().message_id().unwrap();
        assert_eq!(id, 1);
        assert_eq!(outbox.in_flight_len(), 1);
        assert!(!op.is_done());

        let latency = outbox.acknowledge(id, PacketType::Publish, &puback(id), t0 + Duration::from_millis(5));
        assert_eq!(latency, Some(Duration::from_millis(5)));
        assert_eq!(op.try_result().unwrap().unwrap(), Some(puback(id)));
        assert_eq!(outbox.in_flight_len(), 0);
    }

    #[test]
    fn test_ack_for_wrong_kind_ignored() {
        let mut outbox = Outbox::new();
        outbox.enqueue(publish(QoS::AtLeastOnce), None).unwrap();
        flush(&mut outbox, Instant::now());

        let suback = Packet::SubAck(SubAck::new(1, vec![0]));
        assert!(outbox.acknowledge(1, PacketType::Subscribe, &suback, Instant::now()).is_none());
        assert!(outbox.acknowledge(9, PacketType::Publish, &puback(9), Instant::now()).is_none());
        assert_eq!(outbox.in_flight_len(), 1);
    }

    #[test]
    fn test_explicit_id_conflict() {
        let mut outbox = Outbox::new();
        let msg = publish(QoS::AtLeastOnce).with_message_id(7).unwrap();
        outbox.enqueue(msg.clone(), None).unwrap();
        assert!(matches!(
            outbox.enqueue(msg, None),
            Err(MqttError::MessageIdInUse(7))
        ));
    }

    #[test]
    fn test_partial_writes() {
        let mut outbox = Outbox::new();
        outbox.enqueue(publish(QoS::AtMostOnce), None).unwrap();
        let total = outbox.next_chunk().unwrap().len();

        assert!(outbox.advance(2, Instant::now()).is_none());
        assert!(outbox.mid_write());
        assert_eq!(outbox.next_chunk().unwrap().len(), total - 2);
        assert!(outbox.advance(total - 2, Instant::now()).is_some());
        assert!(outbox.next_chunk().is_none());
    }

    #[test]
    fn test_resend_after_interval() {
        let mut outbox = Outbox::new();
        let t0 = Instant::now();
        let interval = Duration::from_secs(30);
        outbox.enqueue(publish(QoS::AtLeastOnce), None).unwrap();
        flush(&mut outbox, t0);

        let (n, next) = outbox.schedule_resends(t0 + Duration::from_secs(10), interval).unwrap();
        assert_eq!(n, 0);
        assert_eq!(next, Some(Duration::from_secs(20)));

        let (n, _) = outbox.schedule_resends(t0 + interval, interval).unwrap();
        assert_eq!(n, 1);
        // Already queued; not queued twice.
        let (n, _) = outbox.schedule_resends(t0 + interval, interval).unwrap();
        assert_eq!(n, 0);

        let written = flush(&mut outbox, t0 + interval);
        assert_eq!(written.len(), 1);
        assert!(written[0].resend);
        assert!(written[0].message.packet().dup());
        assert_eq!(outbox.in_flight_len(), 1);
    }

    #[test]
    fn test_resend_skipped_when_acked_first() {
        let mut outbox = Outbox::new();
        let t0 = Instant::now();
        let interval = Duration::from_secs(1);
        outbox.enqueue(publish(QoS::AtLeastOnce), None).unwrap();
        flush(&mut outbox, t0);
        outbox.schedule_resends(t0 + interval, interval).unwrap();

        outbox.acknowledge(1, PacketType::Publish, &puback(1), t0 + interval);
        assert!(flush(&mut outbox, t0 + interval).is_empty());
    }

    #[test]
    fn test_unsent_messages_order_and_filter() {
        let mut outbox = Outbox::new();
        outbox.enqueue(publish(QoS::AtLeastOnce), None).unwrap();
        flush(&mut outbox, Instant::now());
        outbox.enqueue(Message::outbound(Packet::PingReq).unwrap(), None).unwrap();
        let sub = Subscribe::new(vec![Subscription::new("a/#", QoS::AtLeastOnce)]);
        outbox.enqueue(Message::outbound(Packet::Subscribe(sub)).unwrap(), None).unwrap();

        let unsent = outbox.unsent_messages();
        assert_eq!(unsent.len(), 2);
        assert_eq!(unsent[0].packet().packet_type(), PacketType::Publish);
        assert_eq!(unsent[1].packet().packet_type(), PacketType::Subscribe);
    }

    #[test]
    fn test_take_all_and_adopt() {
        let mut old = Outbox::new();
        let (op, completion) = PendingOperation::new();
        old.enqueue(publish(QoS::AtLeastOnce), Some(completion)).unwrap();
        flush(&mut old, Instant::now());
        old.enqueue(publish(QoS::AtLeastOnce), None).unwrap();

        let taken = old.take_all(|| CommandError::Cancelled);
        assert_eq!(taken.len(), 2);
        assert!(taken[0].was_sent);
        assert!(!taken[1].was_sent);
        assert_eq!(old.in_flight_len(), 0);

        let mut new = Outbox::new();
        let busy = publish(QoS::AtLeastOnce).with_message_id(1).unwrap();
        new.enqueue(busy, None).unwrap();
        for unsent in taken {
            new.adopt(unsent).unwrap();
        }

        let unsent = new.unsent_messages();
        let ids: Vec<u16> = unsent.iter().filter_map(|m| m.packet().message_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(unsent[1].packet().dup());

        // The original waiter now follows the message on its new channel.
        flush(&mut new, Instant::now());
        new.acknowledge(ids[1], PacketType::Publish, &puback(ids[1]), Instant::now());
        assert!(op.try_result().unwrap().is_ok());
    }

    #[test]
    fn test_fail_waiters_keeps_messages() {
        let mut outbox = Outbox::new();
        let (op, completion) = PendingOperation::new();
        outbox.enqueue(publish(QoS::AtLeastOnce), Some(completion)).unwrap();
        assert_eq!(outbox.fail_waiters(|| CommandError::Cancelled), 1);
        assert!(op.try_result().unwrap().unwrap_err().is_cancelled());
        assert_eq!(outbox.queued_len(), 1);
    }

    #[test]
    fn test_ids_reserved_until_ack() {
        let mut outbox = Outbox::new();
        for _ in 0..65_535 {
            outbox.enqueue(publish(QoS::AtLeastOnce), None).unwrap();
        }
        assert!(matches!(
            outbox.enqueue(publish(QoS::AtLeastOnce), None),
            Err(MqttError::MessageIdsExhausted)
        ));
        flush(&mut outbox, Instant::now());
        outbox.acknowledge(40_000, PacketType::Publish, &puback(40_000), Instant::now());
        outbox.enqueue(publish(QoS::AtLeastOnce), None).unwrap();
        let last = outbox.unsent_messages().pop().unwrap();
        assert_eq!(last.packet().message_id(), Some(40_000));
    }
}
