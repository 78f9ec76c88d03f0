//! Inter-stage packet queues and queue handlers.
//!
//! The queue is a mutex + condvar protected FIFO; all blocking waits are
//! timed so a raised kill flag unblocks every thread within one quantum.
//! The flow-affine handler hashes the 5-tuple to a fixed downstream slot,
//! guaranteeing all packets of a flow land on the same worker without any
//! per-flow locking in the queue layer.

use crate::flow::FlowKey;
use crate::packet::Packet;

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// A bounded MPMC packet FIFO.
#[derive(Debug)]
pub struct PacketQueue {
    name: String,
    cap: usize,
    inner: Mutex<VecDeque<Packet>>,
    cond_pop: Condvar,
    cond_push: Condvar,
}

impl PacketQueue {
    pub fn new(name: &str, cap: usize) -> Self {
        PacketQueue {
            name: name.to_string(),
            cap: cap.max(1),
            inner: Mutex::new(VecDeque::new()),
            cond_pop: Condvar::new(),
            cond_push: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues, waiting while the queue is at capacity. The wait is timed;
    /// on repeated timeout the packet is enqueued anyway rather than lost
    /// (shutdown drains the excess).
    pub fn push(&self, pkt: Packet) {
        let mut q = self.inner.lock().unwrap();
        let mut waits = 0;
        while q.len() >= self.cap && waits < 10 {
            let (guard, _res) = self
                .cond_push
                .wait_timeout(q, Duration::from_millis(100))
                .unwrap();
            q = guard;
            waits += 1;
        }
        q.push_back(pkt);
        drop(q);
        self.cond_pop.notify_one();
    }

    /// Dequeues, waiting up to `timeout` for a packet.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Packet> {
        let mut q = self.inner.lock().unwrap();
        if q.is_empty() {
            let (guard, _res) = self.cond_pop.wait_timeout(q, timeout).unwrap();
            q = guard;
        }
        let pkt = q.pop_front();
        if pkt.is_some() {
            drop(q);
            self.cond_push.notify_one();
        }
        pkt
    }

    /// Drains everything currently queued.
    pub fn drain(&self) -> Vec<Packet> {
        let mut q = self.inner.lock().unwrap();
        let drained = q.drain(..).collect();
        drop(q);
        self.cond_push.notify_all();
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes packets from a stage to its downstream queues.
#[derive(Debug, Clone)]
pub enum QueueHandler {
    /// One shared FIFO; any downstream worker may take any packet.
    Simple(Arc<PacketQueue>),
    /// Hash the flow tuple to a fixed worker so per-flow order holds.
    FlowAffine(Vec<Arc<PacketQueue>>),
}

impl QueueHandler {
    pub fn dispatch(&self, pkt: Packet) {
        match self {
            QueueHandler::Simple(q) => q.push(pkt),
            QueueHandler::FlowAffine(queues) => {
                let idx = Self::flow_slot(&pkt, queues.len());
                queues[idx].push(pkt);
            }
        }
    }

    /// Deterministic worker slot for a packet's conversation.
    fn flow_slot(pkt: &Packet, n: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        match FlowKey::from_packet(pkt) {
            Some((key, _, _)) => key.hash(&mut hasher),
            // Undecoded packets all land on slot of the empty hash.
            None => 0u8.hash(&mut hasher),
        }
        (hasher.finish() as usize) % n
    }

    /// All queues this handler can reach.
    pub fn queues(&self) -> Vec<Arc<PacketQueue>> {
        match self {
            QueueHandler::Simple(q) => vec![Arc::clone(q)],
            QueueHandler::FlowAffine(qs) => qs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Datalink;
    use crate::utils::time::Timestamp;

    #[test]
    fn fifo_order() {
        let q = PacketQueue::new("t", 16);
        for i in 0..3u8 {
            let mut pkt = Packet::default();
            pkt.init(&[i], Datalink::Ethernet, Timestamp::new(0, 0));
            q.push(pkt);
        }
        for i in 0..3u8 {
            let pkt = q.pop_timeout(Duration::from_millis(10)).unwrap();
            assert_eq!(pkt.data, vec![i]);
        }
        assert!(q.pop_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn pop_unblocks_on_timeout() {
        let q = PacketQueue::new("t", 4);
        let start = std::time::Instant::now();
        assert!(q.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn flow_affinity_is_stable() {
        let queues: Vec<Arc<PacketQueue>> = (0..4)
            .map(|i| Arc::new(PacketQueue::new(&format!("w{}", i), 16)))
            .collect();
        let handler = QueueHandler::FlowAffine(queues.clone());

        // Same conversation, both directions, many packets: one queue gets
        // them all.
        for _ in 0..5 {
            let pkt = crate::flow::table::tests::meta_packet(
                [10, 0, 0, 1],
                [10, 0, 0, 2],
                4000,
                80,
                Timestamp::new(0, 0),
            );
            handler.dispatch(pkt);
            let rev = crate::flow::table::tests::meta_packet(
                [10, 0, 0, 2],
                [10, 0, 0, 1],
                80,
                4000,
                Timestamp::new(0, 0),
            );
            handler.dispatch(rev);
        }
        let populated: Vec<usize> = queues
            .iter()
            .enumerate()
            .filter(|(_, q)| !q.is_empty())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(populated.len(), 1);
        assert_eq!(queues[populated[0]].len(), 10);
    }
}
