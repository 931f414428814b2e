//! Output sinks and the batching merge loop.

use std::convert::Infallible;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use log;

use crate::chunk::SpillError;
use crate::merger::{KWayMerger, MergeSelector, MergeStats};
use crate::record::{LineCodec, Record};

/// Destination of the merged stream. Batches must be persisted in the order they are written.
pub trait OutputSink {
    type Error: Error;

    /// Appends a batch of records.
    fn write_batch(&mut self, batch: &[Record]) -> Result<(), Self::Error>;

    /// Called once after the last batch.
    fn finish(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Appends records to a file, one encoded record per line. The writer is flushed after every batch.
pub struct FileSink<C: LineCodec> {
    writer: io::BufWriter<fs::File>,
    codec: C,
}

impl<C: LineCodec> FileSink<C> {
    pub fn create(path: &Path, codec: C, buf_size: Option<usize>) -> io::Result<Self> {
        let file = fs::File::create(path)?;
        let writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        return Ok(FileSink { writer, codec });
    }
}

impl<C: LineCodec> OutputSink for FileSink<C> {
    type Error = SpillError<C::EncodeError>;

    fn write_batch(&mut self, batch: &[Record]) -> Result<(), Self::Error> {
        for record in batch {
            self.codec
                .encode(record, &mut self.writer)
                .map_err(SpillError::SerializationError)?;
        }

        self.writer.flush().map_err(SpillError::IO)
    }

    fn finish(&mut self) -> Result<(), Self::Error> {
        self.writer.get_ref().sync_all().map_err(SpillError::IO)
    }
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<Record>,
}

impl MemorySink {
    pub fn with_capacity(capacity: usize) -> Self {
        MemorySink {
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

impl OutputSink for MemorySink {
    type Error = Infallible;

    fn write_batch(&mut self, batch: &[Record]) -> Result<(), Self::Error> {
        self.records.extend_from_slice(batch);
        Ok(())
    }
}

/// Merge error.
#[derive(Debug)]
pub enum MergeError<E: Error> {
    /// Output sink error.
    Sink(E),
    /// The number of merged records differs from the expected total.
    Integrity {
        produced: u64,
        expected: u64,
        decode_failures: u64,
    },
}

impl<E: Error + 'static> Error for MergeError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            MergeError::Sink(err) => Some(err),
            MergeError::Integrity { .. } => None,
        }
    }
}

impl<E: Error> Display for MergeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            MergeError::Sink(err) => write!(f, "output sink error: {}", err),
            MergeError::Integrity {
                produced,
                expected,
                decode_failures,
            } => write!(
                f,
                "sorted records produced ({}) does not match expected total ({}), {} records failed to decode",
                produced, expected, decode_failures
            ),
        }
    }
}

fn drain<D, S, K>(merger: &mut KWayMerger<D, S>, sink: &mut K, batch_size: usize) -> Result<(), K::Error>
where
    D: Error + Send + 'static,
    S: MergeSelector,
    K: OutputSink,
{
    let mut batch = Vec::with_capacity(batch_size);
    for record in merger {
        batch.push(record);
        if batch.len() >= batch_size {
            sink.write_batch(&batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        sink.write_batch(&batch)?;
    }

    sink.finish()
}

/// Drains the merger into the sink in batches of `batch_size` records and verifies that exactly
/// `expected` records were emitted.
pub fn merge_into<D, S, K>(
    mut merger: KWayMerger<D, S>,
    sink: &mut K,
    batch_size: usize,
    expected: u64,
) -> Result<MergeStats, MergeError<K::Error>>
where
    D: Error + Send + 'static,
    S: MergeSelector,
    K: OutputSink,
{
    let result = drain(&mut merger, sink, batch_size.max(1));
    let stats = merger.finish();
    result.map_err(MergeError::Sink)?;

    log::info!(
        "merged {} records from {} partitions ({} decode failures)",
        stats.emitted,
        stats.partitions,
        stats.decode_failures
    );

    if stats.emitted != expected {
        return Err(MergeError::Integrity {
            produced: stats.emitted,
            expected,
            decode_failures: stats.decode_failures,
        });
    }

    return Ok(stats);
}

#[cfg(test)]
mod test {
    use std::fmt;
    use std::fs;
    use std::io;

    use rstest::*;

    use super::{merge_into, FileSink, MemorySink, MergeError, OutputSink};
    use crate::chunk::{spill_path, write_spill, PartitionSource};
    use crate::merger::{BinaryHeapSelector, KWayMerger, LinearScanSelector};
    use crate::record::{JsonLineCodec, Record};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn records(keys: &[i64]) -> Vec<Record> {
        keys.iter().map(|key| Record::new(*key, "0")).collect()
    }

    fn memory_merger(partitions: &[&[i64]]) -> KWayMerger<io::Error> {
        let sources = partitions
            .iter()
            .enumerate()
            .map(|(idx, keys)| PartitionSource::from_records(idx, records(keys)).unwrap())
            .collect();

        KWayMerger::new(sources, LinearScanSelector)
    }

    /// Sink recording the size of every batch.
    #[derive(Default)]
    struct BatchRecorder {
        batches: Vec<usize>,
        finished: bool,
    }

    impl OutputSink for BatchRecorder {
        type Error = fmt::Error;

        fn write_batch(&mut self, batch: &[Record]) -> Result<(), Self::Error> {
            self.batches.push(batch.len());
            Ok(())
        }

        fn finish(&mut self) -> Result<(), Self::Error> {
            self.finished = true;
            Ok(())
        }
    }

    #[rstest]
    #[case(2, vec![2, 2, 1])]
    #[case(5, vec![5])]
    #[case(0, vec![1, 1, 1, 1, 1])]
    fn test_batching(#[case] batch_size: usize, #[case] expected_batches: Vec<usize>) {
        let mut sink = BatchRecorder::default();

        let stats = merge_into(memory_merger(&[&[5, 1, 4], &[2, 3]]), &mut sink, batch_size, 5).unwrap();

        assert_eq!(stats.emitted, 5);
        assert_eq!(sink.batches, expected_batches);
        assert!(sink.finished);
    }

    #[test]
    fn test_memory_sink_order() {
        let mut sink = MemorySink::default();

        merge_into(memory_merger(&[&[5, 1, 4], &[2, 3]]), &mut sink, 2, 5).unwrap();

        let keys: Vec<i64> = sink.into_records().iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[rstest]
    #[case(4)]
    #[case(6)]
    fn test_integrity_failure(#[case] expected: u64) {
        let mut sink = MemorySink::default();

        let err = merge_into(memory_merger(&[&[5, 1, 4], &[2, 3]]), &mut sink, 2, expected).unwrap_err();

        match err {
            MergeError::Integrity {
                produced,
                expected: total,
                decode_failures,
            } => {
                assert_eq!(produced, 5);
                assert_eq!(total, expected);
                assert_eq!(decode_failures, 0);
            }
            other => panic!("unexpected error: {}", other),
        }
        let err = MergeError::<fmt::Error>::Integrity {
            produced: 0,
            expected: 3,
            decode_failures: 0,
        };
        assert_eq!(
            err.to_string(),
            "sorted records produced (0) does not match expected total (3), 0 records failed to decode"
        );
    }

    #[rstest]
    fn test_file_sink_with_corrupt_spill(tmp_dir: tempfile::TempDir) {
        let first = spill_path(tmp_dir.path(), 0);
        let second = spill_path(tmp_dir.path(), 1);
        write_spill(&first, records(&[1, 4, 5]), &JsonLineCodec, None).unwrap();
        fs::write(&second, "{\"key\":2,\"value\":\"0\"}\ngarbage\n{\"key\":6,\"value\":\"0\"}\n").unwrap();

        let sources = vec![
            PartitionSource::from_file(0, first, JsonLineCodec, None).unwrap(),
            PartitionSource::from_file(1, second, JsonLineCodec, None).unwrap(),
        ];
        let output = tmp_dir.path().join("result.txt");
        let mut sink = FileSink::create(&output, JsonLineCodec, Some(64)).unwrap();

        let err = merge_into(KWayMerger::new(sources, BinaryHeapSelector::default()), &mut sink, 2, 6).unwrap_err();
        match err {
            MergeError::Integrity {
                produced,
                expected,
                decode_failures,
            } => {
                assert_eq!(produced, 5);
                assert_eq!(decode_failures, 1);
                assert_eq!(expected, 6);
            }
            other => panic!("unexpected error: {}", other),
        }

        let content = fs::read_to_string(&output).unwrap();
        let keys: Vec<i64> = content
            .lines()
            .map(|line| serde_json::from_str::<Record>(line).unwrap().key)
            .collect();
        assert_eq!(keys, vec![1, 2, 4, 5, 6]);
    }

    #[rstest]
    fn test_file_sink_create_failure(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("missing").join("result.txt");

        assert!(FileSink::create(&output, JsonLineCodec, None).is_err());
    }
}
