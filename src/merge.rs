//! Merge phase: reduces the sorted runs level by level until a single run is left.

use std::fs;
use std::io::prelude::*;
use std::ops::Range;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use crate::key::{KeyExtractor, Order};
use crate::merger::BinaryHeapMerger;
use crate::progress::ProgressReporter;
use crate::run::{remove_run, RunDir, RunReader};
use crate::sort::SortError;

/// Default maximum number of runs merged by one job.
pub const FAN_IN: usize = 20;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of merge levels needed to reduce `run_count` runs to one:
/// the smallest `h` such that `fan_in^h >= run_count`.
pub fn tree_height(run_count: usize, fan_in: usize) -> u32 {
    let mut height = 0;
    let mut reach: usize = 1;
    while run_count > reach {
        height += 1;
        reach = reach.saturating_mul(fan_in);
    }
    height
}

enum MergeEvent {
    /// Bytes appended to the job's output run.
    Written(u64),
    /// Job completion, sent once after all of its `Written` events.
    Finished(Result<(), SortError>),
}

/// Merges a group of runs into a new run and deletes the merged runs.
struct MergeJob {
    runs: RunDir,
    sources: Range<usize>,
    target: usize,
    extractor: KeyExtractor,
    order: Order,
    buffer_size: usize,
    rw_buf_size: Option<usize>,
}

impl MergeJob {
    fn run(self, events: mpsc::Sender<MergeEvent>) {
        let result = self.merge(&events);
        if result.is_err() {
            let target = self.runs.path(self.target);
            if target.exists() {
                remove_run(&target);
            }
        }
        let _ = events.send(MergeEvent::Finished(result));
    }

    fn merge(&self, events: &mpsc::Sender<MergeEvent>) -> Result<(), SortError> {
        log::debug!(
            "merging runs {}..{} into {}",
            self.sources.start,
            self.sources.end,
            self.target
        );

        let readers = self
            .sources
            .clone()
            .map(|idx| RunReader::open(&self.runs.path(idx), self.extractor.clone(), self.rw_buf_size))
            .collect::<Result<Vec<_>, _>>()?;
        let merger = BinaryHeapMerger::new(readers, self.order);

        let mut output = fs::File::create(self.runs.path(self.target)).map_err(SortError::IO)?;
        let flush_threshold = self.buffer_size / 20;
        let mut buffered = String::new();

        for record in merger {
            let record = record?;
            buffered.push_str(record.line());
            buffered.push('\n');

            if buffered.len() > flush_threshold {
                Self::flush(&mut output, &mut buffered, events)?;
            }
        }
        if !buffered.is_empty() {
            Self::flush(&mut output, &mut buffered, events)?;
        }

        for idx in self.sources.clone() {
            remove_run(&self.runs.path(idx));
        }

        Ok(())
    }

    fn flush(output: &mut fs::File, buffered: &mut String, events: &mpsc::Sender<MergeEvent>) -> Result<(), SortError> {
        output.write_all(buffered.as_bytes()).map_err(SortError::IO)?;
        let _ = events.send(MergeEvent::Written(buffered.len() as u64));
        buffered.clear();
        Ok(())
    }
}

/// Merge phase of the external sort.
pub(crate) struct MergeScheduler<'a> {
    pub(crate) runs: &'a RunDir,
    pub(crate) extractor: &'a KeyExtractor,
    pub(crate) order: Order,
    pub(crate) fan_in: usize,
    /// Per job output buffer size. Output is flushed once a twentieth of it is accumulated.
    pub(crate) buffer_size: usize,
    /// Read buffer size of each merged run, the reader default when `None`.
    /// Read buffers are not part of the memory budget.
    pub(crate) rw_buf_size: Option<usize>,
    pub(crate) thread_pool: &'a rayon::ThreadPool,
}

impl<'a> MergeScheduler<'a> {
    /// Merges runs `0..run_count` and moves the result to `output`.
    ///
    /// An empty output file is created when there are no runs.
    pub(crate) fn merge_all(
        &self,
        run_count: usize,
        output: &Path,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<(), SortError> {
        if run_count == 0 {
            log::debug!("no runs to merge, creating empty output");
            fs::File::create(output).map_err(SortError::IO)?;
            return Ok(());
        }

        let mut left = 0;
        let mut right = run_count;
        let mut next = run_count;
        let mut level = 0;

        while right - left > 1 {
            level += 1;
            let (events, received) = mpsc::channel();
            let mut jobs = 0;

            for begin in (left..right).step_by(self.fan_in) {
                let job = MergeJob {
                    runs: self.runs.clone(),
                    sources: begin..usize::min(begin + self.fan_in, right),
                    target: next,
                    extractor: self.extractor.clone(),
                    order: self.order,
                    buffer_size: self.buffer_size,
                    rw_buf_size: self.rw_buf_size,
                };
                let events = events.clone();
                self.thread_pool.spawn(move || job.run(events));
                next += 1;
                jobs += 1;
            }
            drop(events);
            log::debug!("merge level {}: {} runs into {}", level, right - left, jobs);

            Self::await_level(jobs, &received, reporter)?;
            left = right;
            right = next;
        }

        Self::finalize(&self.runs.path(right - 1), output)
    }

    /// Applies progress events of a level's jobs until all of them finish.
    /// The first failure is returned once every job has finished.
    fn await_level(
        jobs: usize,
        received: &mpsc::Receiver<MergeEvent>,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<(), SortError> {
        let mut finished = 0;
        let mut failure = None;

        while finished < jobs {
            match received.recv_timeout(POLL_INTERVAL) {
                Ok(MergeEvent::Written(written)) => reporter.add(written),
                Ok(MergeEvent::Finished(result)) => {
                    finished += 1;
                    if let Err(err) = result {
                        log::error!("merge job failed: {}", err);
                        failure.get_or_insert(err);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(SortError::InvalidState(format!(
                        "{} merge jobs terminated without reporting",
                        jobs - finished
                    )))
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finalize(last: &Path, output: &Path) -> Result<(), SortError> {
        log::debug!("moving {} to {}", last.display(), output.display());
        if fs::rename(last, output).is_err() {
            fs::copy(last, output).map_err(SortError::IO)?;
            remove_run(last);
        }
        Ok(())
    }
}
