//! K-way streaming merge.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::error::Error;
use std::mem;

use log;

use crate::chunk::{PartitionSource, Pull};
use crate::record::Record;

/// Strategy picking the partition whose head record is emitted next.
pub trait MergeSelector {
    /// Called once with the first head of every partition.
    fn init(&mut self, heads: &[Pull]);

    /// Returns the index of the minimum head, or [`None`] if every partition is exhausted.
    /// Ties are resolved in favour of the lowest index.
    fn select(&mut self, heads: &[Pull]) -> Option<usize>;

    /// Called after the selected slot has been refilled.
    fn refill(&mut self, index: usize, head: &Pull);
}

/// Linear scan over all heads, *O(n)* per emitted record. Fine for tens of partitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearScanSelector;

impl MergeSelector for LinearScanSelector {
    fn init(&mut self, _heads: &[Pull]) {}

    fn select(&mut self, heads: &[Pull]) -> Option<usize> {
        let mut min: Option<(i64, usize)> = None;
        for (idx, head) in heads.iter().enumerate() {
            if let Pull::Record(record) = head {
                match min {
                    Some((key, _)) if key <= record.key => {}
                    _ => min = Some((record.key, idx)),
                }
            }
        }

        return min.map(|(_, idx)| idx);
    }

    fn refill(&mut self, _index: usize, _head: &Pull) {}
}

/// Binary heap selector, *O(log n)* per emitted record.
#[derive(Debug, Default, Clone)]
pub struct BinaryHeapSelector {
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    keys: BinaryHeap<Reverse<(i64, usize)>>,
}

impl BinaryHeapSelector {
    fn push(&mut self, index: usize, head: &Pull) {
        if let Pull::Record(record) = head {
            self.keys.push(Reverse((record.key, index)));
        }
    }
}

impl MergeSelector for BinaryHeapSelector {
    fn init(&mut self, heads: &[Pull]) {
        self.keys = BinaryHeap::with_capacity(heads.len());
        for (idx, head) in heads.iter().enumerate() {
            self.push(idx, head);
        }
    }

    fn select(&mut self, _heads: &[Pull]) -> Option<usize> {
        self.keys.pop().map(|Reverse((_, idx))| idx)
    }

    fn refill(&mut self, index: usize, head: &Pull) {
        self.push(index, head);
    }
}

/// Merge summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Number of merged partitions.
    pub partitions: usize,
    /// Number of emitted records.
    pub emitted: u64,
    /// Number of spilled records dropped because they could not be decoded.
    pub decode_failures: u64,
    /// Number of producers that panicked.
    pub failed_producers: usize,
}

/// K-way merger. Merges sorted partition sources into a single sorted stream
/// keeping only the current head of every partition in memory.
pub struct KWayMerger<D, S = LinearScanSelector>
where
    D: Error + Send + 'static,
    S: MergeSelector,
{
    sources: Vec<PartitionSource<D>>,
    heads: Vec<Pull>,
    selector: S,
    finished: usize,
    emitted: u64,
    initiated: bool,
}

impl<D, S> KWayMerger<D, S>
where
    D: Error + Send + 'static,
    S: MergeSelector,
{
    /// Creates a merger over the sources. Source records should be sorted in ascending key order
    /// otherwise the result is undefined.
    pub fn new(sources: Vec<PartitionSource<D>>, selector: S) -> Self {
        let heads = Vec::with_capacity(sources.len());

        return KWayMerger {
            sources,
            heads,
            selector,
            finished: 0,
            emitted: 0,
            initiated: false,
        };
    }

    pub fn partitions(&self) -> usize {
        self.sources.len()
    }

    /// Number of partitions that signaled end-of-stream.
    pub fn finished(&self) -> usize {
        self.finished
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    fn pull(&mut self, idx: usize) -> Pull {
        let head = self.sources[idx].pull();
        if matches!(head, Pull::Exhausted) {
            self.finished += 1;
            log::debug!(
                "partition {} exhausted ({}/{})",
                self.sources[idx].index(),
                self.finished,
                self.sources.len()
            );
        }

        return head;
    }

    /// Closes all sources and joins their producers.
    pub fn finish(self) -> MergeStats {
        let mut stats = MergeStats {
            partitions: self.sources.len(),
            emitted: self.emitted,
            ..MergeStats::default()
        };

        for source in self.sources {
            let index = source.index();
            stats.decode_failures += source.decode_failures();
            if !source.finish() {
                log::error!("partition {} producer panicked", index);
                stats.failed_producers += 1;
            }
        }

        return stats;
    }
}

impl<D, S> Iterator for KWayMerger<D, S>
where
    D: Error + Send + 'static,
    S: MergeSelector,
{
    type Item = Record;

    /// Returns the next record from the sources in ascending key order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            for idx in 0..self.sources.len() {
                let head = self.pull(idx);
                self.heads.push(head);
            }
            self.selector.init(&self.heads);
            self.initiated = true;
        }

        let idx = match self.selector.select(&self.heads) {
            Some(idx) => idx,
            None => {
                debug_assert_eq!(self.finished, self.sources.len());
                return None;
            }
        };

        let next = self.pull(idx);
        self.selector.refill(idx, &next);

        match mem::replace(&mut self.heads[idx], next) {
            Pull::Record(record) => {
                self.emitted += 1;
                Some(record)
            }
            Pull::Exhausted => unreachable!("selector picked exhausted partition {}", idx),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use rstest::*;

    use super::{BinaryHeapSelector, KWayMerger, LinearScanSelector, MergeSelector, MergeStats};
    use crate::chunk::{PartitionSource, Pull};
    use crate::record::Record;

    fn sources(partitions: Vec<Vec<Record>>) -> Vec<PartitionSource<io::Error>> {
        partitions
            .into_iter()
            .enumerate()
            .map(|(idx, records)| PartitionSource::from_records(idx, records).unwrap())
            .collect()
    }

    fn tagged(partitions: Vec<Vec<i64>>) -> Vec<Vec<Record>> {
        partitions
            .into_iter()
            .enumerate()
            .map(|(idx, keys)| keys.into_iter().map(|key| Record::new(key, idx)).collect())
            .collect()
    }

    fn merge<S: MergeSelector>(partitions: Vec<Vec<i64>>, selector: S) -> (Vec<(i64, u64)>, MergeStats) {
        let mut merger = KWayMerger::new(sources(tagged(partitions)), selector);
        let merged: Vec<(i64, u64)> = merger
            .by_ref()
            .map(|record| (record.key, record.value.as_u64().unwrap()))
            .collect();
        assert_eq!(merger.finished(), merger.partitions());

        (merged, merger.finish())
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![vec![], vec![]], vec![])]
    #[case(vec![vec![1, 4, 5], vec![2, 3]], vec![1, 2, 3, 4, 5])]
    #[case(vec![vec![4, 5, 7], vec![1, 6], vec![3], vec![]], vec![1, 3, 4, 5, 6, 7])]
    #[case(vec![vec![3, 3], vec![1]], vec![1, 3, 3])]
    #[case(vec![vec![i64::MAX, i64::MAX], vec![i64::MIN, i64::MAX]], vec![i64::MIN, i64::MAX, i64::MAX, i64::MAX])]
    #[case(vec![vec![2, 1, 3]], vec![1, 2, 3])]
    fn test_merger(#[case] partitions: Vec<Vec<i64>>, #[case] expected: Vec<i64>) {
        let expected_stats = MergeStats {
            partitions: partitions.len(),
            emitted: expected.len() as u64,
            decode_failures: 0,
            failed_producers: 0,
        };

        for (merged, stats) in [
            merge(partitions.clone(), LinearScanSelector),
            merge(partitions, BinaryHeapSelector::default()),
        ] {
            let keys: Vec<i64> = merged.iter().map(|(key, _)| *key).collect();
            assert_eq!(keys, expected);
            assert_eq!(stats, expected_stats);
        }
    }

    #[test]
    fn test_selectors_agree_on_ties() {
        let partitions = vec![vec![1, 2, 2, 9], vec![2, 2, 5], vec![0, 2, 9], vec![2]];

        let (linear, _) = merge(partitions.clone(), LinearScanSelector);
        let (heap, _) = merge(partitions, BinaryHeapSelector::default());

        assert_eq!(linear, heap);
        // the lowest partition index wins a tie
        assert_eq!(&linear[1..3], &[(1, 0), (2, 0)]);
    }

    #[test]
    fn test_linear_scan_first_minimum() {
        let mut selector = LinearScanSelector;
        let heads = vec![
            Pull::Exhausted,
            Pull::Record(Record::new(4, "0")),
            Pull::Record(Record::new(2, "0")),
            Pull::Record(Record::new(2, "0")),
        ];

        selector.init(&heads);
        assert_eq!(selector.select(&heads), Some(2));
        assert_eq!(selector.select(&[Pull::Exhausted, Pull::Exhausted]), None);
    }

    #[test]
    fn test_max_key_is_not_exhaustion() {
        let (merged, stats) = merge(vec![vec![i64::MAX], vec![]], LinearScanSelector);

        assert_eq!(merged, vec![(i64::MAX, 0)]);
        assert_eq!(stats.emitted, 1);
    }

    #[test]
    fn test_failed_producer_is_reported() {
        let failing = PartitionSource::<io::Error>::spawn(1, |sender| {
            sender.send(Ok(Record::new(2, "0"))).unwrap();
            panic!("producer failure");
        })
        .unwrap();
        let sources = vec![PartitionSource::from_records(0, vec![Record::new(1, "0")]).unwrap(), failing];

        let mut merger = KWayMerger::new(sources, LinearScanSelector);
        let keys: Vec<i64> = merger.by_ref().map(|record| record.key).collect();
        let stats = merger.finish();

        assert_eq!(keys, vec![1, 2]);
        assert_eq!(stats.failed_producers, 1);
    }
}
