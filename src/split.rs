//! Split phase: cuts the input into sorted runs.

use std::cmp;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use std::sync::mpsc;

use crate::key::{KeyExtractor, Order, Record};
use crate::progress::ProgressReporter;
use crate::run::{write_run, RunDir};
use crate::sort::SortError;

/// Default number of bytes read per split iteration.
pub const BLOCK_SIZE: usize = 1 << 16;

/// Reads an input in blocks of roughly `block_size` bytes that always end on a line boundary.
///
/// After each block the reader continues to the next newline, so a block can grow past
/// `block_size` by the length of one line.
pub(crate) struct BlockReader<R: BufRead> {
    reader: R,
    block_size: usize,
    exhausted: bool,
}

impl<R: BufRead> BlockReader<R> {
    pub(crate) fn new(reader: R, block_size: usize) -> Self {
        BlockReader {
            reader,
            block_size,
            exhausted: false,
        }
    }

    /// Returns the next block, `None` once the input is exhausted.
    pub(crate) fn next_block(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut block = Vec::with_capacity(self.block_size);
        self.reader.by_ref().take(self.block_size as u64).read_to_end(&mut block)?;
        if self.reader.read_until(b'\n', &mut block)? == 0 {
            self.exhausted = true;
        }

        Ok(Some(block))
    }
}

/// Overlapped run writes with a bound on the number of writes in flight.
struct PendingWrites {
    completions: mpsc::Receiver<Result<u64, SortError>>,
    in_flight: usize,
    limit: usize,
}

impl PendingWrites {
    fn is_full(&self) -> bool {
        self.in_flight >= self.limit
    }

    /// Blocks until one write completes and reports its size.
    fn wait_one(&mut self, reporter: &mut ProgressReporter<'_>) -> Result<(), SortError> {
        let completion = self
            .completions
            .recv()
            .map_err(|_| SortError::InvalidState("run writer terminated without reporting".to_string()))?;
        self.in_flight -= 1;

        let written = completion?;
        reporter.add(written);
        Ok(())
    }

    /// Waits for every outstanding write. The first failure is returned after all writes are done.
    fn drain(&mut self, reporter: &mut ProgressReporter<'_>) -> Result<(), SortError> {
        let mut failure = None;
        while self.in_flight > 0 {
            if let Err(err) = self.wait_one(reporter) {
                if let SortError::InvalidState(_) = err {
                    return Err(err);
                }
                failure.get_or_insert(err);
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Split phase of the external sort.
pub(crate) struct RunSplitter<'a> {
    pub(crate) runs: &'a RunDir,
    pub(crate) extractor: &'a KeyExtractor,
    pub(crate) order: Order,
    pub(crate) memory_budget: i64,
    pub(crate) block_size: usize,
    pub(crate) rw_buf_size: Option<usize>,
}

impl<'a> RunSplitter<'a> {
    /// Number of run writes allowed in flight for the memory budget, at least one.
    pub(crate) fn writers_limit(memory_budget: u64, block_size: usize) -> usize {
        cmp::max((memory_budget / cmp::max(block_size, 1) as u64) as usize, 1)
    }

    /// Splits `input` into sorted runs named `0..n` and returns `n`.
    ///
    /// Reading and sorting happen on the calling thread, the sorted runs are written by a thread
    /// pool owned by this call while the next block is being prepared.
    pub(crate) fn split(&self, input: &Path, reporter: &mut ProgressReporter<'_>) -> Result<usize, SortError> {
        if self.memory_budget < 0 {
            return Err(SortError::InvalidArgument(format!(
                "memory budget must be non-negative, got {}",
                self.memory_budget
            )));
        }

        let limit = Self::writers_limit(self.memory_budget as u64, self.block_size);
        let writer_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cmp::min(limit, rayon::current_num_threads()))
            .thread_name(|idx| format!("run-writer-{}", idx))
            .build()
            .map_err(SortError::ThreadPoolBuildError)?;
        log::debug!("splitting {} (writes in flight: {})", input.display(), limit);

        let file = fs::File::open(input).map_err(SortError::IO)?;
        let reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };
        let mut blocks = BlockReader::new(reader, self.block_size);

        let (sender, completions) = mpsc::channel();
        let mut pending = PendingWrites {
            completions,
            in_flight: 0,
            limit,
        };

        let split = self.split_blocks(&mut blocks, &writer_pool, &sender, &mut pending, reporter);
        let drained = pending.drain(reporter);

        let run_count = split?;
        drained?;
        log::debug!("input split into {} runs", run_count);

        Ok(run_count)
    }

    fn split_blocks<R: BufRead>(
        &self,
        blocks: &mut BlockReader<R>,
        writer_pool: &rayon::ThreadPool,
        sender: &mpsc::Sender<Result<u64, SortError>>,
        pending: &mut PendingWrites,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<usize, SortError> {
        let mut run_count = 0;

        while let Some(block) = blocks.next_block().map_err(SortError::IO)? {
            let records = self.sort_block(block)?;
            if records.is_empty() {
                continue;
            }

            let path = self.runs.path(run_count);
            let rw_buf_size = self.rw_buf_size;
            let sender = sender.clone();
            writer_pool.spawn(move || {
                let lines = records.into_iter().map(Record::into_line);
                let _ = sender.send(write_run(&path, lines, rw_buf_size));
            });
            run_count += 1;
            pending.in_flight += 1;

            while pending.is_full() {
                pending.wait_one(reporter)?;
            }
        }

        Ok(run_count)
    }

    fn sort_block(&self, block: Vec<u8>) -> Result<Vec<Record>, SortError> {
        let text = String::from_utf8(block)
            .map_err(|err| SortError::IO(io::Error::new(io::ErrorKind::InvalidData, err)))?;

        let mut records = text
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(|line| self.extractor.extract(line.to_string()))
            .collect::<Result<Vec<_>, _>>()?;

        let order = self.order;
        records.sort_by(|a, b| order.apply(a.cmp(b)));

        Ok(records)
    }
}
