//! Input partitioning and per-partition sorting.

use rayon;

use crate::record::Record;

/// Upper bound of records reserved up front for a bounded partition buffer.
const MAX_PREALLOCATED: u64 = 64 * 1024;

/// Partitioning plan. Splits `total` records into `partitions` consecutive blocks of
/// `total / partitions` records, the last partition absorbs the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlan {
    total: u64,
    partitions: usize,
    block_size: u64,
}

impl PartitionPlan {
    pub fn new(total: u64, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        PartitionPlan {
            total,
            partitions,
            block_size: total / partitions as u64,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Returns the capacity of the partition. The last partition is unbounded.
    pub fn capacity(&self, index: usize) -> Option<u64> {
        if index + 1 >= self.partitions {
            None
        } else {
            Some(self.block_size)
        }
    }

    /// Creates an empty buffer for the partition.
    pub fn buffer(&self, index: usize) -> PartitionBuffer {
        match self.capacity(index) {
            Some(limit) => PartitionBuffer::with_limit(index, limit),
            None => PartitionBuffer::unbounded(index),
        }
    }

    /// Splits owned records into partitions following the plan. Empty partitions are omitted.
    pub fn split(&self, records: Vec<Record>) -> Vec<PartitionBuffer> {
        let mut partitions = Vec::with_capacity(self.partitions);
        let mut index = 0;
        let mut buffer = self.buffer(index);

        for record in records {
            while buffer.is_full() {
                if buffer.len() > 0 {
                    partitions.push(buffer);
                }
                index += 1;
                buffer = self.buffer(index);
            }
            buffer.push(record);
        }

        if buffer.len() > 0 {
            partitions.push(buffer);
        }

        return partitions;
    }
}

/// Partition buffer limited by records count.
pub struct PartitionBuffer {
    index: usize,
    limit: Option<u64>,
    inner: Vec<Record>,
}

impl PartitionBuffer {
    /// Creates a buffer holding at most `limit` records. Only a bounded part of the limit
    /// is reserved up front.
    pub fn with_limit(index: usize, limit: u64) -> Self {
        PartitionBuffer {
            index,
            limit: Some(limit),
            inner: Vec::with_capacity(limit.min(MAX_PREALLOCATED) as usize),
        }
    }

    pub fn unbounded(index: usize) -> Self {
        PartitionBuffer {
            index,
            limit: None,
            inner: Vec::new(),
        }
    }

    /// Partition index the buffer was created for.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn push(&mut self, record: Record) {
        self.inner.push(record);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Checks if the buffer reached the limit.
    pub fn is_full(&self) -> bool {
        match self.limit {
            Some(limit) => self.inner.len() as u64 >= limit,
            None => false,
        }
    }

    pub fn as_slice(&self) -> &[Record] {
        &self.inner
    }

    pub fn into_vec(self) -> Vec<Record> {
        self.inner
    }
}

impl IntoIterator for PartitionBuffer {
    type Item = Record;
    type IntoIter = <Vec<Record> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl rayon::slice::ParallelSliceMut<Record> for PartitionBuffer {
    fn as_parallel_slice_mut(&mut self) -> &mut [Record] {
        self.inner.as_mut_slice()
    }
}

/// Sorts one partition in place by key. Not stable.
pub fn sort_partition(records: &mut [Record]) {
    records.sort_unstable_by_key(|record| record.key);
}

/// Parallel version of [`sort_partition`], runs on the current rayon pool.
pub fn par_sort_partition(buffer: &mut PartitionBuffer) {
    use rayon::slice::ParallelSliceMut;

    buffer.par_sort_unstable_by_key(|record| record.key);
}
