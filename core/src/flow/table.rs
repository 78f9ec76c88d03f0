//! The flow hash table.
//!
//! Fixed bucket count, one mutex per bucket, bucket-local operations only
//! while the lock is held. Lookup canonicalises the 5-tuple so both
//! directions land in the same bucket; creation is refused (and emergency
//! mode entered) once the flow budget is spent.

use crate::config::FlowConfig;
use crate::flow::{Flow, FlowKey, FlowPhase, FlowTimeouts, FLOW_EMERG};
use crate::packet::{Packet, PacketFlags};
use crate::utils::time::Timestamp;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hashlink::LinkedHashMap;

type Bucket = Mutex<LinkedHashMap<FlowKey, Arc<Flow>>>;

/// How a packet's flow lookup was satisfied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Attach {
    Existing,
    Created,
}

/// The engine-wide flow table.
pub struct FlowTable {
    buckets: Vec<Bucket>,
    hash_seed: u64,
    max_flows: usize,
    flow_cnt: AtomicUsize,
    emergency: AtomicBool,
    emerg_entered: AtomicU64,
    timeouts: FlowTimeouts,
}

impl FlowTable {
    pub fn new(cfg: &FlowConfig) -> Self {
        let bucket_cnt = cfg.hash_size.max(1);
        let mut buckets = Vec::with_capacity(bucket_cnt);
        for _ in 0..bucket_cnt {
            buckets.push(Mutex::new(LinkedHashMap::new()));
        }
        FlowTable {
            buckets,
            hash_seed: cfg.hash_seed,
            max_flows: cfg.max_flows,
            flow_cnt: AtomicUsize::new(0),
            emergency: AtomicBool::new(false),
            emerg_entered: AtomicU64::new(0),
            timeouts: FlowTimeouts::from(cfg),
        }
    }

    fn bucket_of(&self, key: &FlowKey) -> &Bucket {
        let mut hasher = DefaultHasher::new();
        self.hash_seed.hash(&mut hasher);
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.buckets.len();
        &self.buckets[idx]
    }

    /// Looks up or creates the flow for `pkt` and attaches it: sets the
    /// packet's flow reference and direction, bumps `use_cnt`, stamps
    /// `lastts`, and updates the per-direction counters.
    ///
    /// Returns `None` when no flow could be attached (undecoded packet, or
    /// budget exhausted).
    pub fn handle_packet(&self, pkt: &mut Packet) -> Option<Attach> {
        let (key, src, dst) = match FlowKey::from_packet(pkt) {
            Some(parts) => parts,
            None => return None,
        };

        let (flow, attach) = {
            let mut bucket = self.bucket_of(&key).lock().unwrap();
            if let Some(flow) = bucket.get(&key) {
                (Arc::clone(flow), Attach::Existing)
            } else {
                if self.flow_cnt.load(Ordering::Acquire) >= self.max_flows {
                    self.enter_emergency();
                    return None;
                }
                let flow = Arc::new(Flow::new(key.clone(), src, dst, pkt.ts));
                if self.emergency.load(Ordering::Acquire) {
                    flow.set_flags(FLOW_EMERG);
                }
                bucket.insert(key, Arc::clone(&flow));
                self.flow_cnt.fetch_add(1, Ordering::AcqRel);
                (flow, Attach::Created)
            }
        };

        flow.touch(pkt.ts);
        flow.incr_use();
        let dir = flow.direction_of(src);
        flow.account(dir, pkt.data.len() as u64);
        if flow.phase() == FlowPhase::Established {
            pkt.flags |= PacketFlags::Established;
        }
        pkt.direction = dir;
        pkt.flow = Some(flow);
        Some(attach)
    }

    /// Plain lookup without attachment.
    pub fn lookup(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.bucket_of(key).lock().unwrap().get(key).cloned()
    }

    /// Removes flows idle past their timeout with no outstanding
    /// references. Returns the number reclaimed.
    pub fn expire(&self, now: Timestamp) -> usize {
        let emerg = self.in_emergency();
        let mut removed = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().unwrap();
            let expired: Vec<FlowKey> = bucket
                .iter()
                .filter(|(_, flow)| {
                    if flow.use_cnt() != 0 {
                        return false;
                    }
                    let timeout = self
                        .timeouts
                        .for_proto(flow.key().proto())
                        .pick(flow.phase(), emerg);
                    now.secs_since(flow.last_ts()) >= timeout
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                bucket.remove(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            self.flow_cnt.fetch_sub(removed, Ordering::AcqRel);
            self.maybe_recover();
        }
        removed
    }

    /// Drops every flow with no outstanding references. Used at shutdown
    /// after the pipeline has drained.
    pub fn drain(&self) -> usize {
        let mut removed = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().unwrap();
            let keys: Vec<FlowKey> = bucket
                .iter()
                .filter(|(_, f)| f.use_cnt() == 0)
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                bucket.remove(&key);
                removed += 1;
            }
        }
        self.flow_cnt.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    fn enter_emergency(&self) {
        if !self.emergency.swap(true, Ordering::AcqRel) {
            self.emerg_entered.fetch_add(1, Ordering::Relaxed);
            log::warn!("flow table full ({} flows), entering emergency mode", self.max_flows);
        }
    }

    fn maybe_recover(&self) {
        if self.emergency.load(Ordering::Acquire)
            && self.flow_cnt.load(Ordering::Acquire) < self.max_flows * 3 / 4
        {
            self.emergency.store(false, Ordering::Release);
            log::info!("flow table pressure subsided, leaving emergency mode");
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.flow_cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn in_emergency(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    pub fn emerg_entered_count(&self) -> u64 {
        self.emerg_entered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::FlowConfig;
    use crate::packet::{Datalink, Direction, IpMeta, TcpMeta, Transport};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(max_flows: usize) -> FlowConfig {
        FlowConfig {
            max_flows,
            hash_size: 16,
            ..FlowConfig::default()
        }
    }

    pub(crate) fn meta_packet(
        src: [u8; 4],
        dst: [u8; 4],
        sport: u16,
        dport: u16,
        ts: Timestamp,
    ) -> Packet {
        let mut pkt = Packet::default();
        pkt.init(&[0u8; 60], Datalink::Ethernet, ts);
        pkt.l3 = Some(IpMeta {
            src: IpAddr::V4(Ipv4Addr::from(src)),
            dst: IpAddr::V4(Ipv4Addr::from(dst)),
            proto: 6,
            version: 4,
            hdr_offset: 14,
            hdr_len: 20,
            payload_len: 20,
        });
        pkt.transport = Some(Transport::Tcp(TcpMeta {
            sport,
            dport,
            payload_offset: 54,
            payload_len: 0,
            ..TcpMeta::default()
        }));
        pkt
    }

    fn release(pkt: &mut Packet) {
        if let Some(flow) = pkt.flow.take() {
            flow.decr_use();
        }
    }

    #[test]
    fn both_directions_hit_one_flow() {
        let table = FlowTable::new(&test_config(10));
        let mut fwd = meta_packet([10, 0, 0, 1], [10, 0, 0, 2], 4000, 80, Timestamp::new(1, 0));
        let mut rev = meta_packet([10, 0, 0, 2], [10, 0, 0, 1], 80, 4000, Timestamp::new(2, 0));
        assert_eq!(table.handle_packet(&mut fwd), Some(Attach::Created));
        assert_eq!(table.handle_packet(&mut rev), Some(Attach::Existing));
        assert_eq!(table.len(), 1);
        assert_eq!(fwd.direction, Direction::ToServer);
        assert_eq!(rev.direction, Direction::ToClient);
        let flow = fwd.flow.as_ref().unwrap();
        assert_eq!(flow.use_cnt(), 2);
        assert_eq!(flow.last_ts(), Timestamp::new(2, 0));
        release(&mut fwd);
        release(&mut rev);
    }

    #[test]
    fn budget_exhaustion_enters_emergency() {
        let table = FlowTable::new(&test_config(1));
        let mut a = meta_packet([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, Timestamp::new(1, 0));
        let mut b = meta_packet([3, 3, 3, 3], [4, 4, 4, 4], 3, 4, Timestamp::new(1, 0));
        assert_eq!(table.handle_packet(&mut a), Some(Attach::Created));
        assert_eq!(table.handle_packet(&mut b), None);
        assert!(table.in_emergency());
        assert!(b.flow.is_none());
        release(&mut a);
    }

    #[test]
    fn expire_honours_use_cnt_and_timeout() {
        let cfg = test_config(10);
        let table = FlowTable::new(&cfg);
        let mut pkt = meta_packet([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, Timestamp::new(100, 0));
        table.handle_packet(&mut pkt);

        // Referenced: never reclaimed regardless of age.
        let far_future = Timestamp::new(100 + cfg.tcp_timeout_new + 10, 0);
        assert_eq!(table.expire(far_future), 0);

        release(&mut pkt);
        // Unreferenced but not yet timed out.
        assert_eq!(table.expire(Timestamp::new(101, 0)), 0);
        // Unreferenced and aged out.
        assert_eq!(table.expire(far_future), 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn emergency_uses_shorter_timeouts_and_recovers() {
        let mut cfg = test_config(1);
        cfg.tcp_timeout_new = 1000;
        cfg.tcp_emerg_timeout_new = 1;
        let table = FlowTable::new(&cfg);

        let mut a = meta_packet([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, Timestamp::new(10, 0));
        table.handle_packet(&mut a);
        release(&mut a);

        // Fill pressure: second distinct tuple is refused.
        let mut b = meta_packet([3, 3, 3, 3], [4, 4, 4, 4], 3, 4, Timestamp::new(11, 0));
        assert_eq!(table.handle_packet(&mut b), None);
        assert!(table.in_emergency());

        // Under emergency the 1s timeout applies instead of 1000s.
        assert_eq!(table.expire(Timestamp::new(20, 0)), 1);
        assert!(!table.in_emergency());
    }
}
