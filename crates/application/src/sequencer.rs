use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use domain::{RoomId, SequenceNumber};

/// 房间序号登记表
/// 每个房间一个原子计数器；不同房间互不阻塞，分配过程不做任何 I/O
#[derive(Default)]
pub struct RoomSequencer {
    counters: DashMap<RoomId, Arc<AtomicU64>>,
}

impl RoomSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 房间计数器是否已恢复
    pub fn is_tracked(&self, room_id: RoomId) -> bool {
        self.counters.contains_key(&room_id)
    }

    /// 用持久化的最大序号初始化计数器；已存在时保持不变，返回当前已分配的最大值
    pub fn restore(&self, room_id: RoomId, high_water: u64) -> u64 {
        let counter = self
            .counters
            .entry(room_id)
            .or_insert_with(|| {
                tracing::debug!(room_id = %room_id, high_water, "restored room sequence");
                Arc::new(AtomicU64::new(high_water))
            })
            .clone();
        counter.load(Ordering::Acquire)
    }

    /// 分配下一个序号。未恢复过的房间从 1 开始
    pub fn issue_next(&self, room_id: RoomId) -> SequenceNumber {
        let counter = self.counter(room_id);
        SequenceNumber(counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    // 先克隆出 Arc 再自增，避免在分片锁内做原子操作以外的事情
    fn counter(&self, room_id: RoomId) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.get(&room_id) {
            return counter.clone();
        }
        self.counters
            .entry(room_id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequence_starts_at_one() {
        let sequencer = RoomSequencer::new();
        let room_id = RoomId::random();

        assert_eq!(sequencer.issue_next(room_id), SequenceNumber(1));
        assert_eq!(sequencer.issue_next(room_id), SequenceNumber(2));
    }

    #[test]
    fn test_restore_continues_after_high_water_mark() {
        let sequencer = RoomSequencer::new();
        let room_id = RoomId::random();

        assert_eq!(sequencer.restore(room_id, 41), 41);
        assert_eq!(sequencer.issue_next(room_id), SequenceNumber(42));
    }

    #[test]
    fn test_restore_never_rewinds_a_live_counter() {
        let sequencer = RoomSequencer::new();
        let room_id = RoomId::random();

        sequencer.restore(room_id, 5);
        sequencer.issue_next(room_id);
        assert_eq!(sequencer.restore(room_id, 0), 6);
        assert_eq!(sequencer.issue_next(room_id), SequenceNumber(7));
    }

    #[test]
    fn test_rooms_are_independent() {
        let sequencer = RoomSequencer::new();
        let first = RoomId::random();
        let second = RoomId::random();

        sequencer.issue_next(first);
        sequencer.issue_next(first);
        assert_eq!(sequencer.issue_next(second), SequenceNumber(1));
        assert_eq!(sequencer.issue_next(first), SequenceNumber(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_issuance_is_gapless() {
        let sequencer = Arc::new(RoomSequencer::new());
        let room_id = RoomId::random();
        sequencer.restore(room_id, 0);

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let sequencer = sequencer.clone();
                tokio::spawn(async move { sequencer.issue_next(room_id).value() })
            })
            .collect();

        let mut issued = HashSet::new();
        for handle in handles {
            assert!(issued.insert(handle.await.unwrap()));
        }
        assert_eq!(issued, (1..=200).collect::<HashSet<u64>>());
    }
}
