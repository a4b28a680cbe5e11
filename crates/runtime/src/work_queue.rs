/// Deterministic weighted priority queue for fetch-style task scheduling.
///
/// Key properties:
/// - Work is grouped into buckets (typically one per layer), each with a weight.
/// - Buckets are serviced by smooth weighted round-robin: over any window of
///   `sum(weights)` selections each non-empty bucket is picked `weight` times.
/// - Inside a bucket the highest priority runs first; equal priorities run
///   newest first (timestamp, then insertion order).
/// - Bucket iteration uses a `BTreeMap`, so ties always resolve the same way.
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Key {
    // Larger values run earlier.
    priority: i32,
    timestamp: u64,
    id: WorkId,
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        // Total ordering: (priority, timestamp, id), all "bigger wins".
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Item<T> {
    key: Key,
    payload: T,
}

impl<T> PartialEq for Item<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for Item<T> {}

impl<T> PartialOrd for Item<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Item<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// One priority heap plus its round-robin bookkeeping.
#[derive(Debug)]
pub struct Bucket<T> {
    items: BinaryHeap<Item<T>>,
    weight: u32,
    accumulator: i64,
}

impl<T> Bucket<T> {
    fn new(weight: u32) -> Self {
        Self {
            items: BinaryHeap::new(),
            weight: weight.max(1),
            accumulator: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn accumulator(&self) -> i64 {
        self.accumulator
    }
}

#[derive(Debug)]
pub struct WeightedQueue<K, T> {
    next_id: u64,
    buckets: BTreeMap<K, Bucket<T>>,
}

impl<K: Ord + Clone, T> Default for WeightedQueue<K, T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            buckets: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, T> WeightedQueue<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Bucket::is_empty)
    }

    pub fn bucket(&self, key: &K) -> Option<&Bucket<T>> {
        self.buckets.get(key)
    }

    pub fn bucket_len(&self, key: &K) -> usize {
        self.buckets.get(key).map(Bucket::len).unwrap_or(0)
    }

    /// Pushes `payload` into `bucket`, creating it on first use.
    ///
    /// `weight` replaces the bucket's current weight (a zero weight is
    /// clamped to 1 so the bucket cannot starve).
    pub fn push(
        &mut self,
        bucket: K,
        weight: u32,
        priority: i32,
        timestamp: u64,
        payload: T,
    ) -> WorkId {
        let id = WorkId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let b = self
            .buckets
            .entry(bucket)
            .or_insert_with(|| Bucket::new(weight));
        b.weight = weight.max(1);
        b.items.push(Item {
            key: Key {
                priority,
                timestamp,
                id,
            },
            payload,
        });
        id
    }

    /// One weighted round-robin step.
    ///
    /// Every non-empty bucket adds its weight to a running sum and to its own
    /// accumulator; the largest accumulator wins (first in key order on ties)
    /// and gives back the sum.
    pub fn select_bucket(&mut self) -> Option<K> {
        let mut sum: i64 = 0;
        let mut best: Option<(&K, i64)> = None;
        for (key, bucket) in self.buckets.iter_mut() {
            if bucket.items.is_empty() {
                continue;
            }
            sum += bucket.weight as i64;
            bucket.accumulator += bucket.weight as i64;
            match best {
                Some((_, acc)) if acc >= bucket.accumulator => {}
                _ => best = Some((key, bucket.accumulator)),
            }
        }

        let key = best?.0.clone();
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.accumulator -= sum;
        }
        Some(key)
    }

    /// Pops the head of `bucket` without touching the round-robin state.
    pub fn pop_from(&mut self, bucket: &K) -> Option<(WorkId, T)> {
        let item = self.buckets.get_mut(bucket)?.items.pop()?;
        Some((item.key.id, item.payload))
    }

    /// Selects a bucket and pops its head.
    pub fn pop_next(&mut self) -> Option<(K, WorkId, T)> {
        let key = self.select_bucket()?;
        let (id, payload) = self.pop_from(&key)?;
        Some((key, id, payload))
    }

    /// Removes every item of `bucket` matching `pred`, highest priority first.
    ///
    /// Remaining items keep their relative order.
    pub fn extract_where(&mut self, bucket: &K, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let Some(b) = self.buckets.get_mut(bucket) else {
            return Vec::new();
        };
        let mut sorted = std::mem::take(&mut b.items).into_sorted_vec();
        sorted.reverse();

        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(sorted.len());
        for item in sorted {
            if pred(&item.payload) {
                taken.push(item.payload);
            } else {
                kept.push(item);
            }
        }
        b.items = BinaryHeap::from(kept);
        taken
    }

    /// Empties every bucket, returning payloads in bucket key order.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for bucket in self.buckets.values_mut() {
            let mut sorted = std::mem::take(&mut bucket.items).into_sorted_vec();
            sorted.reverse();
            out.extend(sorted.into_iter().map(|i| i.payload));
            bucket.accumulator = 0;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::WeightedQueue;
    use std::collections::BTreeMap;

    #[test]
    fn higher_priority_runs_first() {
        let mut q = WeightedQueue::new();
        q.push("l", 1, 1, 0, "low");
        q.push("l", 1, 10, 0, "high");
        q.push("l", 1, 5, 0, "mid");

        let order: Vec<_> = std::iter::from_fn(|| q.pop_next().map(|(_, _, v)| v)).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[test]
    fn equal_priority_runs_newest_first() {
        let mut q = WeightedQueue::new();
        q.push("l", 1, 3, 100, "old");
        q.push("l", 1, 3, 200, "new");
        q.push("l", 1, 3, 200, "newer-insert");

        let order: Vec<_> = std::iter::from_fn(|| q.pop_next().map(|(_, _, v)| v)).collect();
        assert_eq!(order, vec!["newer-insert", "new", "old"]);
    }

    #[test]
    fn weights_one_and_three_share_sixteen_pops() {
        let mut q = WeightedQueue::new();
        for i in 0..16 {
            q.push("a", 1, 0, i, i);
            q.push("b", 3, 0, i, i);
        }

        let mut served: BTreeMap<&str, u32> = BTreeMap::new();
        for _ in 0..16 {
            let (k, _, _) = q.pop_next().unwrap();
            *served.entry(k).or_default() += 1;
        }
        assert!(served["a"].abs_diff(4) <= 1, "a served {}", served["a"]);
        assert!(served["b"].abs_diff(12) <= 1, "b served {}", served["b"]);
    }

    #[test]
    fn weighted_fairness_holds_for_several_weight_sets() {
        let weight_sets: [&[u32]; 4] = [&[1, 1], &[1, 2, 5], &[3, 7], &[2, 2, 2, 9]];
        for weights in weight_sets {
            let rounds: u32 = 10;
            let total: u32 = weights.iter().sum();
            let mut q = WeightedQueue::new();
            for (bucket, &w) in weights.iter().enumerate() {
                for i in 0..(total * rounds) {
                    q.push(bucket, w, 0, i as u64, ());
                }
            }

            let mut served = vec![0u32; weights.len()];
            for _ in 0..(total * rounds) {
                let (k, _, _) = q.pop_next().unwrap();
                served[k] += 1;
            }
            for (bucket, &w) in weights.iter().enumerate() {
                let expected = w * rounds;
                assert!(
                    served[bucket].abs_diff(expected) <= 1,
                    "weights {weights:?}: bucket {bucket} served {} expected {expected}",
                    served[bucket]
                );
            }
        }
    }

    #[test]
    fn empty_buckets_do_not_take_turns() {
        let mut q = WeightedQueue::new();
        q.push("a", 5, 0, 0, 1);
        q.push("b", 1, 0, 0, 2);
        assert_eq!(q.pop_next().map(|(k, _, _)| k), Some("a"));
        assert_eq!(q.pop_next().map(|(k, _, _)| k), Some("b"));
        assert!(q.pop_next().is_none());
        assert!(q.select_bucket().is_none());
    }

    #[test]
    fn extract_where_keeps_remaining_order() {
        let mut q = WeightedQueue::new();
        q.push("l", 1, 1, 0, 1);
        q.push("l", 1, 2, 0, 2);
        q.push("l", 1, 3, 0, 3);
        q.push("l", 1, 4, 0, 4);

        let taken = q.extract_where(&"l", |v| v % 2 == 0);
        assert_eq!(taken, vec![4, 2]);
        assert_eq!(q.bucket_len(&"l"), 2);
        assert_eq!(q.pop_next().map(|(_, _, v)| v), Some(3));
        assert_eq!(q.pop_next().map(|(_, _, v)| v), Some(1));
    }
}
