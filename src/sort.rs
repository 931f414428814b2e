//! External multiway merge sorter.

use log;
use std::convert::Infallible;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::buffer::{par_sort_partition, PartitionBuffer, PartitionPlan};
use crate::chunk::{spill_path, write_spill, PartitionSource, SpillError};
use crate::merger::{BinaryHeapSelector, KWayMerger, LinearScanSelector, MergeStats};
use crate::record::{JsonLineCodec, LineCodec, Record};
use crate::sink::{merge_into, FileSink, MemorySink, MergeError, OutputSink};

/// Sorting error.
#[derive(Debug)]
pub enum SortError<S: Error, D: Error> {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Data serialization error.
    SerializationError(S),
    /// Source file line could not be decoded.
    InputError { line: u64, source: D },
    /// Input or output path names one of the spill files.
    SpillConflict(PathBuf),
    /// Merged records count differs from the expected total.
    Integrity {
        produced: u64,
        expected: u64,
        decode_failures: u64,
    },
}

impl<S, D> Error for SortError<S, D>
where
    S: Error + 'static,
    D: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::SerializationError(err) => Some(err),
            SortError::InputError { source, .. } => Some(source),
            SortError::SpillConflict(_) => None,
            SortError::Integrity { .. } => None,
        }
    }
}

impl<S: Error, D: Error> Display for SortError<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::InputError { line, source } => write!(f, "input line {} deserialization error: {}", line, source),
            SortError::SpillConflict(path) => write!(f, "path {} collides with a spill file", path.display()),
            SortError::Integrity {
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

impl<S: Error, D: Error> From<SpillError<S>> for SortError<S, D> {
    fn from(err: SpillError<S>) -> Self {
        match err {
            SpillError::IO(err) => SortError::IO(err),
            SpillError::SerializationError(err) => SortError::SerializationError(err),
        }
    }
}

impl<S: Error, D: Error, E: Into<SortError<S, D>> + Error> From<MergeError<E>> for SortError<S, D> {
    fn from(err: MergeError<E>) -> Self {
        match err {
            MergeError::Sink(err) => err.into(),
            MergeError::Integrity {
                produced,
                expected,
                decode_failures,
            } => SortError::Integrity {
                produced,
                expected,
                decode_failures,
            },
        }
    }
}

impl<S: Error, D: Error> From<Infallible> for SortError<S, D> {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}

/// Merge selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Linear scan over partition heads.
    LinearScan,
    /// Binary heap keyed by partition heads.
    BinaryHeap,
}

impl Default for Selection {
    fn default() -> Self {
        Selection::LinearScan
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<C = JsonLineCodec>
where
    C: LineCodec,
{
    /// Number of partitions the input is split into.
    partitions: Option<usize>,
    /// Number of threads to be used to sort partitions in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store spill files.
    tmp_dir: Option<Box<Path>>,
    /// Spill and output file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Number of records handed to the output sink at once.
    batch_size: Option<usize>,
    /// Merge selection strategy.
    selection: Selection,
    /// Record line codec.
    codec: C,
}

impl<C: LineCodec + Default> ExternalSorterBuilder<C> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }
}

impl<C: LineCodec> ExternalSorterBuilder<C> {
    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<C>, SortError<C::EncodeError, C::DecodeError>> {
        ExternalSorter::new(
            self.partitions,
            self.threads_number,
            self.tmp_dir.as_deref(),
            self.rw_buf_size,
            self.batch_size,
            self.selection,
            self.codec,
        )
    }

    /// Sets number of partitions.
    pub fn with_partitions(mut self, partitions: usize) -> ExternalSorterBuilder<C> {
        self.partitions = Some(partitions);
        return self;
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store spill files.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets spill and output file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<C> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets output batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> ExternalSorterBuilder<C> {
        self.batch_size = Some(batch_size);
        return self;
    }

    /// Sets merge selection strategy.
    pub fn with_selection(mut self, selection: Selection) -> ExternalSorterBuilder<C> {
        self.selection = selection;
        return self;
    }

    /// Sets record codec.
    pub fn with_codec<T: LineCodec>(self, codec: T) -> ExternalSorterBuilder<T> {
        ExternalSorterBuilder {
            partitions: self.partitions,
            threads_number: self.threads_number,
            tmp_dir: self.tmp_dir,
            rw_buf_size: self.rw_buf_size,
            batch_size: self.batch_size,
            selection: self.selection,
            codec,
        }
    }
}

impl<C: LineCodec + Default> Default for ExternalSorterBuilder<C> {
    fn default() -> Self {
        ExternalSorterBuilder {
            partitions: None,
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            batch_size: None,
            selection: Selection::default(),
            codec: C::default(),
        }
    }
}

/// External sorter.
pub struct ExternalSorter<C = JsonLineCodec>
where
    C: LineCodec,
{
    /// Number of partitions, [`None`] selects the mode default.
    partitions: Option<usize>,
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Private spill directory.
    tmp_dir: Option<tempfile::TempDir>,
    /// Spill and output file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Output batch size, [`None`] means the number of partitions.
    batch_size: Option<usize>,
    /// Merge selection strategy.
    selection: Selection,
    /// Record line codec.
    codec: C,
}

impl<C: LineCodec> ExternalSorter<C> {
    /// Default number of partitions in disk mode.
    pub const DISK_PARTITIONS: usize = 20;
    /// Default number of partitions in memory mode.
    pub const MEMORY_PARTITIONS: usize = 40;

    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `partitions` - Number of partitions. If the parameter is [`None`] [`Self::DISK_PARTITIONS`] or
    ///   [`Self::MEMORY_PARTITIONS`] is used depending on the mode.
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to create a private spill directory in. If the parameter is [`None`] spill files
    ///   are placed next to the source file.
    /// * `rw_buf_size` - Spill and output files read/write buffer size.
    /// * `batch_size` - Number of merged records written to the output at once.
    /// * `selection` - Merge selection strategy.
    /// * `codec` - Record line codec.
    pub fn new(
        partitions: Option<usize>,
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        rw_buf_size: Option<usize>,
        batch_size: Option<usize>,
        selection: Selection,
        codec: C,
    ) -> Result<Self, SortError<C::EncodeError, C::DecodeError>> {
        return Ok(ExternalSorter {
            partitions,
            rw_buf_size,
            batch_size,
            selection,
            codec,
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: Self::init_tmp_directory(tmp_path)?,
        });
    }

    fn init_thread_pool(
        threads_number: Option<usize>,
    ) -> Result<rayon::ThreadPool, SortError<C::EncodeError, C::DecodeError>> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(
        tmp_path: Option<&Path>,
    ) -> Result<Option<tempfile::TempDir>, SortError<C::EncodeError, C::DecodeError>> {
        let tmp_path = match tmp_path {
            Some(tmp_path) => tmp_path,
            None => return Ok(None),
        };

        let tmp_dir = tempfile::tempdir_in(tmp_path).map_err(|err| SortError::TempDir(err))?;
        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(Some(tmp_dir));
    }

    fn spill_dir(&self, input: &Path) -> PathBuf {
        match &self.tmp_dir {
            Some(tmp_dir) => tmp_dir.path().to_path_buf(),
            None => match input.parent() {
                Some(parent) if parent.as_os_str().len() > 0 => parent.to_path_buf(),
                _ => PathBuf::from("."),
            },
        }
    }

    /// Sorts a file of encoded records into `output` spilling sorted partitions to disk.
    ///
    /// # Arguments
    /// * `input` - Source file, one encoded record per line
    /// * `output` - Result file
    /// * `total` - Number of records in the source file
    pub fn sort_file(
        &self,
        input: &Path,
        output: &Path,
        total: u64,
    ) -> Result<MergeStats, SortError<C::EncodeError, C::DecodeError>> {
        let plan = PartitionPlan::new(total, self.partitions.unwrap_or(Self::DISK_PARTITIONS));
        let spill_dir = self.spill_dir(input);
        log::info!(
            "sorting {} ({} records, {} partitions of {})",
            input.display(),
            plan.total(),
            plan.partitions(),
            plan.block_size()
        );

        for path in [input, output] {
            if collides_with_spill(path, &spill_dir, plan.partitions()) {
                return Err(SortError::SpillConflict(path.to_path_buf()));
            }
        }

        let started = Instant::now();
        let mut spills = Vec::with_capacity(plan.partitions());
        if let Err(err) = self.split_file(input, &plan, &spill_dir, &mut spills) {
            if self.tmp_dir.is_none() {
                remove_spills(&spills);
            }
            return Err(err);
        }
        log::info!("phase 1 took {} ms", started.elapsed().as_millis());

        let started = Instant::now();
        let stats = self.merge_spills(&spills, output, &plan);
        if self.tmp_dir.is_none() {
            remove_spills(&spills);
        }
        let stats = stats?;
        log::info!("phase 2 took {} ms", started.elapsed().as_millis());
        log::info!("successfully sorted {} -> {}", input.display(), output.display());

        return Ok(stats);
    }

    fn merge_spills(
        &self,
        spills: &[(usize, PathBuf)],
        output: &Path,
        plan: &PartitionPlan,
    ) -> Result<MergeStats, SortError<C::EncodeError, C::DecodeError>> {
        let mut sink = FileSink::create(output, self.codec.clone(), self.rw_buf_size).map_err(SortError::IO)?;

        let mut sources = Vec::with_capacity(spills.len());
        for (index, path) in spills {
            let source = PartitionSource::from_file(*index, path.clone(), self.codec.clone(), self.rw_buf_size)
                .map_err(SortError::IO)?;
            sources.push(source);
        }

        self.merge(sources, &mut sink, plan)
    }

    fn split_file(
        &self,
        input: &Path,
        plan: &PartitionPlan,
        spill_dir: &Path,
        spills: &mut Vec<(usize, PathBuf)>,
    ) -> Result<(), SortError<C::EncodeError, C::DecodeError>> {
        let file = fs::File::open(input).map_err(SortError::IO)?;
        let reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        let mut buffer = plan.buffer(0);

        for (number, line) in reader.lines().enumerate() {
            let line = line.map_err(SortError::IO)?;
            if line.is_empty() {
                continue;
            }
            let record = self.codec.decode(&line).map_err(|source| SortError::InputError {
                line: number as u64 + 1,
                source,
            })?;

            while buffer.is_full() {
                let next = plan.buffer(buffer.index() + 1);
                if buffer.len() > 0 {
                    spills.push(self.spill_partition(buffer, spill_dir)?);
                }
                buffer = next;
            }
            buffer.push(record);
        }

        if buffer.len() > 0 {
            spills.push(self.spill_partition(buffer, spill_dir)?);
        }

        return Ok(());
    }

    fn spill_partition(
        &self,
        mut buffer: PartitionBuffer,
        spill_dir: &Path,
    ) -> Result<(usize, PathBuf), SortError<C::EncodeError, C::DecodeError>> {
        let index = buffer.index();

        log::debug!("sorting partition {} ({} records) ...", index, buffer.len());
        self.thread_pool.install(|| {
            par_sort_partition(&mut buffer);
        });

        let path = spill_path(spill_dir, index);
        log::debug!("saving partition {} to {}", index, path.display());
        write_spill(&path, buffer, &self.codec, self.rw_buf_size)?;

        return Ok((index, path));
    }

    /// Sorts records in memory. Every partition is sorted and streamed by its own producer thread.
    /// Returns sorted records.
    ///
    /// # Arguments
    /// * `records` - Records to be sorted
    pub fn sort_records(
        &self,
        records: Vec<Record>,
    ) -> Result<(Vec<Record>, MergeStats), SortError<C::EncodeError, C::DecodeError>> {
        let total = records.len() as u64;
        let plan = PartitionPlan::new(total, self.partitions.unwrap_or(Self::MEMORY_PARTITIONS));
        log::info!(
            "sorting {} records in memory ({} partitions of {})",
            plan.total(),
            plan.partitions(),
            plan.block_size()
        );

        let started = Instant::now();
        let partitions = plan.split(records);
        let mut sources = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let source =
                PartitionSource::<C::DecodeError>::from_records(partition.index(), partition.into_vec())
                    .map_err(SortError::IO)?;
            sources.push(source);
        }

        let mut sink = MemorySink::with_capacity(total as usize);
        let stats = self.merge(sources, &mut sink, &plan)?;
        log::info!("in-memory sort took {} ms", started.elapsed().as_millis());

        return Ok((sink.into_records(), stats));
    }

    fn merge<K>(
        &self,
        sources: Vec<PartitionSource<C::DecodeError>>,
        sink: &mut K,
        plan: &PartitionPlan,
    ) -> Result<MergeStats, SortError<C::EncodeError, C::DecodeError>>
    where
        K: OutputSink,
        K::Error: Into<SortError<C::EncodeError, C::DecodeError>>,
    {
        let total = plan.total();
        let batch_size = self.batch_size(plan);
        log::debug!("merging {} partitions ({:?})", sources.len(), self.selection);

        let stats = match self.selection {
            Selection::LinearScan => merge_into(KWayMerger::new(sources, LinearScanSelector), sink, batch_size, total)?,
            Selection::BinaryHeap => merge_into(
                KWayMerger::new(sources, BinaryHeapSelector::default()),
                sink,
                batch_size,
                total,
            )?,
        };

        return Ok(stats);
    }

    /// Number of merged records handed to the output sink at once.
    fn batch_size(&self, plan: &PartitionPlan) -> usize {
        self.batch_size.unwrap_or(plan.partitions())
    }
}

/// Checks if `path` names the spill file of one of the plan partitions in `spill_dir`.
fn collides_with_spill(path: &Path, spill_dir: &Path, partitions: usize) -> bool {
    let name = match path.file_name() {
        Some(name) => name,
        None => return false,
    };
    let index = name
        .to_str()
        .and_then(|name| name.strip_prefix("sub-"))
        .and_then(|name| name.strip_suffix(".txt"))
        .and_then(|index| index.parse::<usize>().ok());
    let index = match index {
        Some(index) if index < partitions => index,
        _ => return false,
    };
    if spill_path(spill_dir, index).file_name() != Some(name) {
        return false;
    }

    let parent = match path.parent() {
        Some(parent) if parent.as_os_str().len() > 0 => parent,
        _ => Path::new("."),
    };
    match (fs::canonicalize(parent), fs::canonicalize(spill_dir)) {
        (Ok(parent), Ok(spill_dir)) => parent == spill_dir,
        _ => parent == spill_dir,
    }
}

fn remove_spills(spills: &[(usize, PathBuf)]) {
    for (_, path) in spills {
        if let Err(err) = fs::remove_file(path) {
            log::warn!("failed to remove spill file {}: {}", path.display(), err);
        }
    }
}

/// Counts non-empty lines of a file, i.e. the number of encoded records.
pub fn count_records(path: &Path) -> io::Result<u64> {
    let reader = io::BufReader::new(fs::File::open(path)?);

    let mut count = 0;
    for line in reader.lines() {
        if !line?.is_empty() {
            count += 1;
        }
    }

    return Ok(count);
}
