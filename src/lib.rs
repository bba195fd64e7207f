//! `line-ext-sort` is an external sort for line oriented text files.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. Sorting is achieved in two passes. During the
//! first pass it sorts chunks of data that each fit in RAM, during the second pass it merges the sorted chunks
//! together. For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Typed record keys:**
//!   lines are split into fields by a separator, any field can be the key. The key field is compared first,
//!   followed by the remaining fields in their original order. Leading fields can be compared as integers.
//! * **Exact output:**
//!   records are never rewritten, the output contains the input lines byte for byte, reordered.
//! * **Memory budget:**
//!   the input is read in fixed size blocks and the number of sorted runs waiting to be written is bounded
//!   by the memory budget.
//! * **Multithreading support:**
//!   runs are merged level by level, at most 20 runs per job, by a pool of worker threads.
//! * **Progress reporting:**
//!   the sort reports its phase and the completed part of it.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use line_ext_sort::{ExternalSorter, ExternalSorterBuilder, State};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_separator(";")
//!         .with_key_field(2)
//!         .with_field_types("n")
//!         .with_memory_budget(50_000_000)
//!         .build()
//!         .unwrap();
//!
//!     let mut progress = |state: State, fraction: f64| println!("{} {:.2}%", state, fraction * 100.0);
//!     sorter
//!         .sort_with_progress(Path::new("input.txt"), Path::new("output.txt"), &mut progress)
//!         .unwrap();
//! }
//! ```

pub mod key;
pub mod merge;
pub mod merger;
pub mod progress;
pub(crate) mod run;
pub mod sort;
pub mod split;

pub use key::{FieldType, Integer, Key, KeyExtractor, KeyField, Order, Record};
pub use merger::BinaryHeapMerger;
pub use progress::{Progress, ProgressSink, State};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError};
