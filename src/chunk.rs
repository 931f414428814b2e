//! Spilled partitions and concurrent partition sources.
//!
//! A [`PartitionSource`] exposes one sorted partition as a pull-based stream. The partition is
//! produced by a dedicated thread that hands records over one at a time through a zero-capacity
//! channel, so the producer never runs more than one record ahead of the merge.

use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log;

use crate::buffer::sort_partition;
use crate::record::{LineCodec, Record};

/// Record that could not be decoded from a spill file line.
#[derive(Debug)]
pub struct DecodeError<D: Error> {
    /// Partition index.
    pub partition: usize,
    /// One-based line number inside the spill file.
    pub line: u64,
    pub source: D,
}

impl<D: Error + 'static> Error for DecodeError<D> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

impl<D: Error> Display for DecodeError<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition {} line {} is not a valid record: {}",
            self.partition, self.line, self.source
        )
    }
}

/// Spill file write error.
#[derive(Debug)]
pub enum SpillError<S: Error> {
    /// Common I/O error.
    IO(io::Error),
    /// Record serialization error.
    SerializationError(S),
}

impl<S: Error + 'static> Error for SpillError<S> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            SpillError::IO(err) => err,
            SpillError::SerializationError(err) => err,
        })
    }
}

impl<S: Error> Display for SpillError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SpillError::IO(err) => write!(f, "spill file I/O failed: {}", err),
            SpillError::SerializationError(err) => write!(f, "record serialization error: {}", err),
        }
    }
}

/// Item handed over from a producer to the merge.
pub type Produced<D> = Result<Record, DecodeError<D>>;

/// Result of a single pull from a partition source.
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    /// Next record of the partition.
    Record(Record),
    /// The partition has no further records.
    Exhausted,
}

/// Returns the spill file path of the partition.
pub fn spill_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("sub-{}.txt", index))
}

/// Writes sorted records to a spill file, one encoded record per line.
pub fn write_spill<C: LineCodec>(
    path: &Path,
    records: impl IntoIterator<Item = Record>,
    codec: &C,
    buf_size: Option<usize>,
) -> Result<u64, SpillError<C::EncodeError>> {
    let file = fs::File::create(path).map_err(SpillError::IO)?;
    let mut writer = match buf_size {
        Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
        None => io::BufWriter::new(file),
    };

    let mut written = 0;
    for record in records {
        codec
            .encode(&record, &mut writer)
            .map_err(SpillError::SerializationError)?;
        written += 1;
    }
    writer.flush().map_err(SpillError::IO)?;

    return Ok(written);
}

/// Pull-based ordered stream of one sorted partition, backed by a producer thread.
pub struct PartitionSource<D: Error> {
    index: usize,
    receiver: Receiver<Produced<D>>,
    handle: Option<thread::JoinHandle<()>>,
    decode_failures: u64,
}

impl<D> PartitionSource<D>
where
    D: Error + Send + 'static,
{
    /// Starts a producer thread. The producer owns the only sender of a zero-capacity channel,
    /// the channel is closed when the producer returns (or panics).
    pub fn spawn<F>(index: usize, producer: F) -> io::Result<Self>
    where
        F: FnOnce(Sender<Produced<D>>) + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        let handle = thread::Builder::new()
            .name(format!("partition-{}", index))
            .spawn(move || producer(sender))?;

        return Ok(PartitionSource {
            index,
            receiver,
            handle: Some(handle),
            decode_failures: 0,
        });
    }

    /// Streams a spill file line by line. A file that can not be opened produces no records.
    pub fn from_file<C>(index: usize, path: PathBuf, codec: C, buf_size: Option<usize>) -> io::Result<Self>
    where
        C: LineCodec<DecodeError = D>,
    {
        Self::spawn(index, move |sender| {
            let file = match fs::File::open(&path) {
                Ok(file) => file,
                Err(err) => {
                    log::error!("failed to open partition {} file {}: {}", index, path.display(), err);
                    return;
                }
            };
            let reader = match buf_size {
                Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
                None => io::BufReader::new(file),
            };

            for (number, line) in reader.lines().enumerate() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        log::error!("failed to read partition {} file {}: {}", index, path.display(), err);
                        return;
                    }
                };
                let item = codec.decode(&line).map_err(|source| DecodeError {
                    partition: index,
                    line: number as u64 + 1,
                    source,
                });
                if sender.send(item).is_err() {
                    return;
                }
            }
        })
    }

    /// Sorts the partition on the producer thread and streams it from memory.
    pub fn from_records(index: usize, mut records: Vec<Record>) -> io::Result<Self> {
        Self::spawn(index, move |sender| {
            sort_partition(&mut records);
            log::debug!("partition {} sorted ({} records)", index, records.len());

            for record in records {
                if sender.send(Ok(record)).is_err() {
                    return;
                }
            }
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of records dropped so far because they could not be decoded.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    /// Blocks until the producer hands over the next record or closes the stream.
    /// Undecodable records are counted and skipped.
    pub fn pull(&mut self) -> Pull {
        loop {
            match self.receiver.recv() {
                Ok(Ok(record)) => return Pull::Record(record),
                Ok(Err(err)) => {
                    self.decode_failures += 1;
                    log::warn!("{}", err);
                }
                Err(_) => return Pull::Exhausted,
            }
        }
    }

    /// Closes the stream and waits for the producer. Returns `false` if the producer panicked.
    pub fn finish(mut self) -> bool {
        let handle = self.handle.take();
        drop(self);

        match handle.map(|handle| handle.join()) {
            Some(Err(_)) => false,
            _ => true,
        }
    }
}

impl<D: Error> Debug for PartitionSource<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionSource")
            .field("index", &self.index)
            .field("decode_failures", &self.decode_failures)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use rstest::*;

    use super::{spill_path, write_spill, PartitionSource, Pull};
    use crate::record::{JsonLineCodec, Record};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn drain(source: &mut PartitionSource<serde_json::Error>) -> Vec<i64> {
        let mut keys = Vec::new();
        while let Pull::Record(record) = source.pull() {
            keys.push(record.key);
        }
        keys
    }

    fn records(keys: &[i64]) -> Vec<Record> {
        keys.iter().map(|key| Record::new(*key, "0")).collect()
    }

    #[rstest]
    fn test_spill_file_source(tmp_dir: tempfile::TempDir) {
        let path = spill_path(tmp_dir.path(), 3);
        assert!(path.ends_with("sub-3.txt"));

        let written = write_spill(&path, records(&[1, 4, 5]), &JsonLineCodec, Some(16)).unwrap();
        assert_eq!(written, 3);

        let mut source = PartitionSource::from_file(3, path, JsonLineCodec, None).unwrap();
        assert_eq!(drain(&mut source), vec![1, 4, 5]);
        assert_eq!(source.pull(), Pull::Exhausted);
        assert_eq!(source.decode_failures(), 0);
        assert!(source.finish());
    }

    #[rstest]
    fn test_missing_file_source(tmp_dir: tempfile::TempDir) {
        let path = spill_path(tmp_dir.path(), 0);

        let mut source = PartitionSource::from_file(0, path, JsonLineCodec, None).unwrap();
        assert_eq!(source.pull(), Pull::Exhausted);
        assert!(source.finish());
    }

    #[rstest]
    fn test_corrupt_line_is_skipped_and_counted(tmp_dir: tempfile::TempDir) {
        let path = spill_path(tmp_dir.path(), 1);
        fs::write(
            &path,
            "{\"key\":1,\"value\":\"0\"}\n{\"key\":oops}\n{\"key\":2,\"value\":\"0\"}\n{\"key\":3,\"value\":\"0\"}\n",
        )
        .unwrap();

        let mut source = PartitionSource::from_file(1, path, JsonLineCodec, None).unwrap();
        assert_eq!(drain(&mut source), vec![1, 2, 3]);
        assert_eq!(source.decode_failures(), 1);
        assert!(source.finish());
    }

    #[test]
    fn test_records_source_sorts() {
        let mut source = PartitionSource::from_records(0, records(&[5, 1, 4])).unwrap();

        assert_eq!(drain(&mut source), vec![1, 4, 5]);
        assert!(source.finish());
    }

    #[test]
    fn test_producer_panic_closes_stream() {
        let mut source = PartitionSource::<io::Error>::spawn(0, |sender| {
            sender.send(Ok(Record::new(1, "0"))).unwrap();
            panic!("producer failure");
        })
        .unwrap();

        assert_eq!(source.pull(), Pull::Record(Record::new(1, "0")));
        assert_eq!(source.pull(), Pull::Exhausted);
        assert_eq!(source.finish(), false);
    }

    #[test]
    fn test_early_finish_releases_producer() {
        let source = PartitionSource::<io::Error>::from_records(0, records(&[3, 2, 1])).unwrap();

        assert!(source.finish());
    }

    #[test]
    fn test_producer_backpressure() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();

        let mut source = PartitionSource::<io::Error>::spawn(0, move |sender| {
            for key in 0..100 {
                counter.fetch_add(1, Ordering::SeqCst);
                if sender.send(Ok(Record::new(key, "0"))).is_err() {
                    return;
                }
            }
        })
        .unwrap();

        let mut received = 0;
        while let Pull::Record(_) = source.pull() {
            received += 1;
            std::thread::yield_now();
            let in_flight = produced.load(Ordering::SeqCst) - received;
            assert!(in_flight <= 1, "producer ran {} records ahead", in_flight);
        }

        assert_eq!(received, 100);
        assert!(source.finish());
    }
}
