//! External sorter.

use log;
use std::cmp;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

use crate::key::{KeyExtractor, Order};
use crate::merge::{tree_height, MergeScheduler, FAN_IN};
use crate::progress::{ProgressReporter, ProgressSink, State};
use crate::run::RunDir;
use crate::split::{RunSplitter, BLOCK_SIZE};

/// Default memory budget in bytes.
pub const MEMORY_BUDGET: i64 = 1 << 23;

const MIN_MERGE_BUFFER: usize = 1 << 20;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Invalid sorter configuration.
    InvalidArgument(String),
    /// A record has fewer fields than the key field index.
    MalformedRecord { field: usize, fields: usize, line: String },
    /// A field declared as integer could not be parsed.
    InvalidFieldType { position: usize, value: String, line: String },
    /// A worker stopped without reporting its result.
    InvalidState(String),
    /// Temporary directory creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        let source: &(dyn Error + 'static) = match &self {
            SortError::TempDir(err) => err,
            SortError::ThreadPoolBuildError(err) => err,
            SortError::IO(err) => err,
            _ => return None,
        };
        Some(source)
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            SortError::MalformedRecord { field, fields, line } => write!(
                f,
                "line has no field {} (found {} fields): {}",
                field, fields, line
            ),
            SortError::InvalidFieldType { position, value, line } => write!(
                f,
                "key field {} is not an integer: {:?} in line: {}",
                position, value, line
            ),
            SortError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
        }
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone, Debug)]
pub struct ExternalSorterBuilder {
    /// Number of threads to be used to merge runs in parallel.
    threads_number: Option<usize>,
    /// Directory the per-sort working directory is created in.
    tmp_dir: Option<Box<Path>>,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Memory budget in bytes.
    memory_budget: i64,
    /// Sort direction.
    order: Order,
    /// Field separator.
    separator: String,
    /// Key field index starting at 1.
    key_field: usize,
    /// Field type symbols counted from the key field.
    field_types: String,
    /// Maximum number of runs merged by one job.
    fan_in: usize,
    /// Bytes read per split iteration.
    block_size: usize,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    /// All arguments are validated here, before any file is touched.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        let extractor = KeyExtractor::new(&self.separator, self.key_field, &self.field_types)?;

        ExternalSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            extractor,
            self.order,
            self.memory_budget,
            self.fan_in,
            self.block_size,
            self.rw_buf_size,
        )
    }

    /// Sets number of threads to be used to merge runs in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.threads_number = Some(threads_number);
        self
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.tmp_dir = Some(path.into());
        self
    }

    /// Sets run read/write buffer size, used by both the split and the merge phase.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        self
    }

    /// Sets memory budget in bytes. Half of it bounds the run writes in flight during the split
    /// phase, the other half is shared by the merge jobs as output buffers.
    pub fn with_memory_budget(mut self, memory_budget: i64) -> ExternalSorterBuilder {
        self.memory_budget = memory_budget;
        self
    }

    /// Sets sort direction.
    pub fn with_order(mut self, order: Order) -> ExternalSorterBuilder {
        self.order = order;
        self
    }

    /// Sorts in descending order when `reverse` is set.
    pub fn with_reverse(self, reverse: bool) -> ExternalSorterBuilder {
        self.with_order(Order::from_reverse(reverse))
    }

    /// Sets field separator.
    pub fn with_separator(mut self, separator: &str) -> ExternalSorterBuilder {
        self.separator = separator.to_string();
        self
    }

    /// Sets key field index, starting at 1.
    pub fn with_key_field(mut self, key_field: usize) -> ExternalSorterBuilder {
        self.key_field = key_field;
        self
    }

    /// Sets field types of the key field and the fields following it: `n` for integer, `s` for
    /// string.
    pub fn with_field_types(mut self, field_types: &str) -> ExternalSorterBuilder {
        self.field_types = field_types.to_string();
        self
    }

    /// Sets maximum number of runs merged by one job.
    pub fn with_fan_in(mut self, fan_in: usize) -> ExternalSorterBuilder {
        self.fan_in = fan_in;
        self
    }

    /// Sets number of bytes read per split iteration.
    pub fn with_block_size(mut self, block_size: usize) -> ExternalSorterBuilder {
        self.block_size = block_size;
        self
    }
}

impl Default for ExternalSorterBuilder {
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            memory_budget: MEMORY_BUDGET,
            order: Order::Asc,
            separator: " ".to_string(),
            key_field: 1,
            field_types: String::new(),
            fan_in: FAN_IN,
            block_size: BLOCK_SIZE,
        }
    }
}

/// External sorter.
pub struct ExternalSorter {
    /// Merging thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory the per-sort working directory is created in.
    tmp_path: Option<Box<Path>>,
    /// Key extraction parameters.
    extractor: KeyExtractor,
    /// Sort direction.
    order: Order,
    /// Memory budget in bytes.
    memory_budget: i64,
    /// Maximum number of runs merged by one job.
    fan_in: usize,
    /// Bytes read per split iteration.
    block_size: usize,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
}

impl ExternalSorter {
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to merge runs in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory the working directory is created in. If parameter is [`None`] default OS temporary
    ///   directory will be used.
    /// * `extractor` - Comparison key parameters.
    /// * `order` - Sort direction.
    /// * `memory_budget` - Memory budget in bytes, must be non-negative.
    /// * `fan_in` - Maximum number of runs merged by one job, at least 2.
    /// * `block_size` - Number of bytes read per split iteration.
    /// * `rw_buf_size` - Run files read/write buffer size.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        extractor: KeyExtractor,
        order: Order,
        memory_budget: i64,
        fan_in: usize,
        block_size: usize,
        rw_buf_size: Option<usize>,
    ) -> Result<Self, SortError> {
        if memory_budget < 0 {
            return Err(SortError::InvalidArgument(format!(
                "memory budget must be non-negative, got {}",
                memory_budget
            )));
        }
        if fan_in < 2 {
            return Err(SortError::InvalidArgument(format!("fan-in must be at least 2, got {}", fan_in)));
        }
        if block_size == 0 {
            return Err(SortError::InvalidArgument("block size must be positive".to_string()));
        }
        if rw_buf_size == Some(0) {
            return Err(SortError::InvalidArgument("read/write buffer size must be positive".to_string()));
        }

        Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_path: tmp_path.map(Into::into),
            extractor,
            order,
            memory_budget,
            fan_in,
            block_size,
            rw_buf_size,
        })
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new().thread_name(|idx| format!("merger-{}", idx));

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(SortError::ThreadPoolBuildError)?;

        Ok(thread_pool)
    }

    fn init_tmp_directory(&self) -> Result<tempfile::TempDir, SortError> {
        let tmp_dir = if let Some(tmp_path) = &self.tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(SortError::TempDir)?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        Ok(tmp_dir)
    }

    /// Key extraction parameters used by this sorter.
    pub fn extractor(&self) -> &KeyExtractor {
        &self.extractor
    }

    /// Output buffer size of one merge job.
    fn merge_buffer_size(&self) -> usize {
        let shared = cmp::max(MIN_MERGE_BUFFER, (self.memory_budget / 2) as usize);
        cmp::max(shared / self.thread_pool.current_num_threads(), 8 * 1024)
    }

    /// Sorts the lines of `input` and writes them to `output`.
    ///
    /// # Arguments
    /// * `input` - File to be sorted
    /// * `output` - Result file, replaced if it exists
    pub fn sort(&self, input: &Path, output: &Path) -> Result<(), SortError> {
        self.sort_with_progress(input, output, &mut |_: State, _: f64| {})
    }

    /// Sorts the lines of `input` into `output` reporting progress to `sink`.
    ///
    /// The sink is called on every phase transition and whenever a part of a run has been written.
    /// The working directory holding the runs is removed when the call returns, whether it
    /// succeeded or not.
    pub fn sort_with_progress(
        &self,
        input: &Path,
        output: &Path,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), SortError> {
        let input_size = fs::metadata(input).map_err(SortError::IO)?.len();
        let work_dir = self.init_tmp_directory()?;
        let runs = RunDir::new(work_dir.path());
        let mut reporter = ProgressReporter::new(sink);

        log::info!("sorting {} ({} bytes) by {}", input.display(), input_size, self.extractor);
        reporter.advance(input_size);
        let splitter = RunSplitter {
            runs: &runs,
            extractor: &self.extractor,
            order: self.order,
            memory_budget: self.memory_budget / 2,
            block_size: self.block_size,
            rw_buf_size: self.rw_buf_size,
        };
        let run_count = splitter.split(input, &mut reporter)?;

        let height = tree_height(run_count, self.fan_in);
        log::info!("split into {} runs, merging in {} levels", run_count, height);
        reporter.advance(input_size.saturating_mul(height as u64));
        let scheduler = MergeScheduler {
            runs: &runs,
            extractor: &self.extractor,
            order: self.order,
            fan_in: self.fan_in,
            buffer_size: self.merge_buffer_size(),
            rw_buf_size: self.rw_buf_size,
            thread_pool: &self.thread_pool,
        };
        scheduler.merge_all(run_count, output, &mut reporter)?;

        reporter.advance(0);
        if let Err(err) = work_dir.close() {
            log::warn!("temporary directory not removed: {}", err);
        }
        log::info!("sorted {} into {}", input.display(), output.display());

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::path::{Path, PathBuf};

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, SortError};
    use crate::key::{KeyExtractor, Order};
    use crate::progress::State;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_lines(path: &Path, lines: &[&str]) {
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(path, content).unwrap();
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path).unwrap().lines().map(str::to_string).collect()
    }

    fn paths(tmp_dir: &tempfile::TempDir) -> (PathBuf, PathBuf, PathBuf) {
        let work = tmp_dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        (tmp_dir.path().join("input.txt"), tmp_dir.path().join("output.txt"), work)
    }

    #[rstest]
    #[case(&["b 2", "a 1", "c 3"], false, 1, "", &["a 1", "b 2", "c 3"])]
    #[case(&["b 2", "a 1", "c 3"], true, 1, "", &["c 3", "b 2", "a 1"])]
    #[case(&["x 30", "y 5"], false, 2, "n", &["y 5", "x 30"])]
    #[case(&["x 30", "y 5"], false, 1, "sn", &["x 30", "y 5"])]
    #[case(&["x 30", "y 5"], false, 2, "", &["x 30", "y 5"])]
    #[case(&["1 b", "1 a", "0 c"], false, 1, "n", &["0 c", "1 a", "1 b"])]
    fn test_sort_scenarios(
        tmp_dir: tempfile::TempDir,
        #[case] input_lines: &[&str],
        #[case] reverse: bool,
        #[case] key_field: usize,
        #[case] field_types: &str,
        #[case] expected: &[&str],
    ) {
        let (input, output, work) = paths(&tmp_dir);
        write_lines(&input, input_lines);

        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(&work)
            .with_reverse(reverse)
            .with_key_field(key_field)
            .with_field_types(field_types)
            .build()
            .unwrap();
        sorter.sort(&input, &output).unwrap();

        assert_eq!(read_lines(&output), expected);
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    #[rstest]
    #[case(false, 0)]
    #[case(true, 0)]
    #[case(false, 1 << 20)]
    #[case(true, 1 << 16)]
    fn test_sort_many_runs(tmp_dir: tempfile::TempDir, #[case] reverse: bool, #[case] memory_budget: i64) {
        let (input, output, work) = paths(&tmp_dir);
        let mut lines: Vec<String> = (0..2000).map(|i| format!("{};key{:05};{}", i % 13, i, i * 7)).collect();
        lines.shuffle(&mut rand::thread_rng());
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        write_lines(&input, &refs);

        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(&work)
            .with_threads_number(3)
            .with_separator(";")
            .with_key_field(2)
            .with_field_types("sn")
            .with_reverse(reverse)
            .with_memory_budget(memory_budget)
            .with_block_size(1024)
            .with_fan_in(3)
            .build()
            .unwrap();
        sorter.sort(&input, &output).unwrap();

        let actual = read_lines(&output);

        let mut expected_set = lines.clone();
        expected_set.sort();
        let mut actual_set = actual.clone();
        actual_set.sort();
        assert_eq!(actual_set, expected_set);

        let extractor = KeyExtractor::new(";", 2, "sn").unwrap();
        let order = Order::from_reverse(reverse);
        for pair in actual.windows(2) {
            let a = extractor.extract(pair[0].clone()).unwrap();
            let b = extractor.extract(pair[1].clone()).unwrap();
            assert_ne!(order.apply(a.cmp(&b)), std::cmp::Ordering::Greater, "{} > {}", pair[0], pair[1]);
        }
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    #[rstest]
    fn test_sort_is_idempotent(tmp_dir: tempfile::TempDir) {
        let (input, output, work) = paths(&tmp_dir);
        let lines: Vec<String> = (0..300).rev().map(|i| format!("{} {}", i, i % 5)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        write_lines(&input, &refs);

        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(&work)
            .with_field_types("n")
            .with_block_size(256)
            .with_fan_in(2)
            .build()
            .unwrap();
        sorter.sort(&input, &output).unwrap();

        let resorted = tmp_dir.path().join("resorted.txt");
        sorter.sort(&output, &resorted).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), std::fs::read(&resorted).unwrap());
    }

    #[rstest]
    fn test_sort_keeps_line_text(tmp_dir: tempfile::TempDir) {
        let (input, output, work) = paths(&tmp_dir);
        std::fs::write(&input, "b,,2\n\na,1\nc,3").unwrap();

        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(&work)
            .with_separator(",")
            .with_key_field(2)
            .with_field_types("n")
            .build()
            .unwrap();
        sorter.sort(&input, &output).unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "a,1\nb,,2\nc,3\n");
    }

    #[rstest]
    fn test_sort_empty_input(tmp_dir: tempfile::TempDir) {
        let (input, output, work) = paths(&tmp_dir);
        std::fs::write(&input, "").unwrap();

        let sorter = ExternalSorterBuilder::new().with_tmp_dir(&work).build().unwrap();
        sorter.sort(&input, &output).unwrap();

        assert_eq!(std::fs::metadata(&output).unwrap().len(), 0);
    }

    #[rstest]
    fn test_sort_reports_progress(tmp_dir: tempfile::TempDir) {
        let (input, output, work) = paths(&tmp_dir);
        let lines: Vec<String> = (0..1000).map(|i| format!("k{}", (i * 7919) % 1000)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        write_lines(&input, &refs);

        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(&work)
            .with_block_size(512)
            .with_fan_in(4)
            .build()
            .unwrap();

        let mut reports: Vec<(State, f64)> = Vec::new();
        let mut sink = |state: State, fraction: f64| reports.push((state, fraction));
        sorter.sort_with_progress(&input, &output, &mut sink).unwrap();

        assert!(reports.windows(2).all(|pair| pair[0].0 <= pair[1].0));
        assert!(reports.iter().all(|(_, fraction)| (0.0..=1.0).contains(fraction)));
        assert!(reports.iter().any(|(state, _)| *state == State::Splitting));
        assert!(reports.iter().any(|(state, _)| *state == State::Merging));
        assert_eq!(reports.last(), Some(&(State::Finished, 1.0)));
        for state in [State::Splitting, State::Merging] {
            let last = reports.iter().filter(|(s, _)| *s == state).last().unwrap();
            assert_eq!(last.1, 1.0);
        }
    }

    #[rstest]
    fn test_sort_malformed_record(tmp_dir: tempfile::TempDir) {
        let (input, output, work) = paths(&tmp_dir);
        write_lines(&input, &["a 1", "b 2", "c 3"]);

        let sorter = ExternalSorterBuilder::new().with_tmp_dir(&work).with_key_field(3).build().unwrap();
        let result = sorter.sort(&input, &output);

        assert!(matches!(result, Err(SortError::MalformedRecord { field: 3, fields: 2, .. })));
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    #[rstest]
    fn test_sort_invalid_field_type(tmp_dir: tempfile::TempDir) {
        let (input, output, work) = paths(&tmp_dir);
        write_lines(&input, &["a 1", "b two"]);

        let sorter = ExternalSorterBuilder::new().with_tmp_dir(&work).with_field_types("sn").build().unwrap();
        let result = sorter.sort(&input, &output);

        assert!(matches!(result, Err(SortError::InvalidFieldType { position: 2, .. })));
    }

    #[rstest]
    fn test_sort_leading_string_type_on_key_field(tmp_dir: tempfile::TempDir) {
        let (input, output, work) = paths(&tmp_dir);
        write_lines(&input, &["x 30", "y 5"]);

        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(&work)
            .with_key_field(2)
            .with_field_types("sn")
            .build()
            .unwrap();
        let result = sorter.sort(&input, &output);

        match result {
            Err(SortError::InvalidFieldType { position, value, .. }) => {
                assert_eq!(position, 2);
                assert!(value == "x" || value == "y", "unexpected value {:?}", value);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    #[rstest]
    fn test_sort_small_rw_buffers(tmp_dir: tempfile::TempDir) {
        let (input, output, work) = paths(&tmp_dir);
        let lines: Vec<String> = (0..300).rev().map(|i| format!("k{} {}", i % 7, i)).collect();
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        write_lines(&input, &lines);

        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(&work)
            .with_key_field(2)
            .with_field_types("n")
            .with_block_size(256)
            .with_fan_in(2)
            .with_rw_buf_size(16)
            .build()
            .unwrap();
        sorter.sort(&input, &output).unwrap();

        let expected: Vec<String> = (0..300).map(|i| format!("k{} {}", i % 7, i)).collect();
        assert_eq!(read_lines(&output), expected);
    }

    #[rstest]
    fn test_sort_missing_input(tmp_dir: tempfile::TempDir) {
        let (input, output, work) = paths(&tmp_dir);
        let sorter = ExternalSorterBuilder::new().with_tmp_dir(&work).build().unwrap();
        assert!(matches!(sorter.sort(&input, &output), Err(SortError::IO(_))));
    }

    #[rstest]
    #[case(ExternalSorterBuilder::new().with_memory_budget(-1))]
    #[case(ExternalSorterBuilder::new().with_key_field(0))]
    #[case(ExternalSorterBuilder::new().with_separator(""))]
    #[case(ExternalSorterBuilder::new().with_field_types("nq"))]
    #[case(ExternalSorterBuilder::new().with_fan_in(1))]
    #[case(ExternalSorterBuilder::new().with_block_size(0))]
    #[case(ExternalSorterBuilder::new().with_rw_buf_size(0))]
    fn test_invalid_configuration(#[case] builder: ExternalSorterBuilder) {
        assert!(matches!(builder.build(), Err(SortError::InvalidArgument(_))));
    }

    #[test]
    fn test_new_rejects_negative_budget() {
        let extractor = KeyExtractor::new(" ", 1, "").unwrap();
        let result = ExternalSorter::new(Some(1), None, extractor, Order::Asc, -5, 20, 1024, None);
        assert!(matches!(result, Err(SortError::InvalidArgument(_))));
    }
}
