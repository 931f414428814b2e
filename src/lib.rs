//! `multiway-sort` is an external multiway merge sort of keyed records.
//!
//! Sorting is achieved in two phases. During the first phase the input is split into a fixed number
//! of bounded-size partitions and every partition is sorted independently. During the second phase
//! the sorted partitions are merged back into a single sorted output by a streaming k-way merge.
//! Every partition is streamed to the merge by its own producer thread through a zero-capacity
//! channel, so the merge never holds more than one record per partition.
//!
//! # Overview
//!
//! Two modes share the same merge:
//!
//! * **Disk mode:**
//!   partitions are sorted one at a time, spilled to `sub-<index>.txt` files and read back by the
//!   producers during the merge. See [`ExternalSorter::sort_file`].
//! * **Memory mode:**
//!   partitions are sorted concurrently by their producers and streamed from memory.
//!   See [`ExternalSorter::sort_records`].
//!
//! The merge verifies that the number of emitted records equals the expected total, a mismatch
//! fails the whole run.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use multiway_sort::{ExternalSorter, ExternalSorterBuilder, Selection};
//!
//! fn main() {
//!     let input = Path::new("source.txt");
//!     let total = multiway_sort::count_records(input).unwrap();
//!
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_partitions(20)
//!         .with_selection(Selection::BinaryHeap)
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter.sort_file(input, Path::new("result.txt"), total).unwrap();
//!     println!("sorted {} records", stats.emitted);
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod gen;
pub mod merger;
pub mod record;
pub mod sink;
pub mod sort;

pub use buffer::{PartitionBuffer, PartitionPlan};
pub use chunk::{PartitionSource, Pull};
pub use merger::{BinaryHeapSelector, KWayMerger, LinearScanSelector, MergeSelector, MergeStats};
pub use record::{JsonLineCodec, LineCodec, Record};
pub use sink::{merge_into, FileSink, MemorySink, OutputSink};
pub use sort::{count_records, ExternalSorter, ExternalSorterBuilder, Selection, SortError};
