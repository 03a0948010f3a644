//! Partition selection for the distributed transport.
//!
//! Keyed events are hashed with murmur2, the same function Kafka clients use
//! by default, so producers written in other languages agree on placement.
//! Unkeyed events are spread round-robin.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Kafka-compatible murmur2 hash.
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h: u32 = SEED ^ (length as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h as i32
}

/// Chooses the partition for each outgoing record.
#[derive(Debug, Default)]
pub struct Partitioner {
    next: AtomicUsize,
}

impl Partitioner {
    /// Create a partitioner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition for a record on a topic with `partitions` partitions.
    ///
    /// Records sharing a key always land on the same partition.
    pub fn partition(&self, key: Option<&str>, partitions: u32) -> u32 {
        if partitions <= 1 {
            return 0;
        }
        match key {
            Some(key) => {
                let positive = (murmur2(key.as_bytes()) & 0x7fff_ffff) as u32;
                positive % partitions
            }
            None => (self.next.fetch_add(1, Ordering::Relaxed) % partitions as usize) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur2_matches_kafka() {
        assert_eq!(murmur2(b"21"), -973_932_308);
        assert_eq!(murmur2(b"foobar"), -790_332_482);
        assert_eq!(murmur2(b"a-little-bit-long-string"), -985_981_536);
        assert_eq!(murmur2(b"a-little-bit-longer-string"), -1_486_304_829);
        assert_eq!(
            murmur2(b"lkjh234lh9fiuh90y23oiuhsafujhadof229phr9h19h89h8"),
            -58_897_971
        );
        assert_eq!(murmur2(b"abc"), 479_470_107);
    }

    #[test]
    fn test_keyed_partition_is_stable() {
        let partitioner = Partitioner::new();
        let first = partitioner.partition(Some("user-1"), 6);
        for _ in 0..10 {
            assert_eq!(partitioner.partition(Some("user-1"), 6), first);
        }
        assert_eq!(partitioner.partition(Some("abc"), 6), 3);
    }

    #[test]
    fn test_round_robin_without_key() {
        let partitioner = Partitioner::new();
        let picked: Vec<u32> = (0..6).map(|_| partitioner.partition(None, 3)).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_single_partition() {
        let partitioner = Partitioner::new();
        assert_eq!(partitioner.partition(Some("x"), 1), 0);
        assert_eq!(partitioner.partition(None, 0), 0);
    }
}
