//! Sorting progress tracking.

use std::fmt;

/// Sorting phase. Phases only ever move forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Pending,
    Splitting,
    Merging,
    Finished,
}

impl State {
    fn next(self) -> State {
        match self {
            State::Pending => State::Splitting,
            State::Splitting => State::Merging,
            State::Merging | State::Finished => State::Finished,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Pending => "PENDING",
            State::Splitting => "SPLITTING",
            State::Merging => "MERGING",
            State::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current phase and the number of bytes produced within it.
///
/// `Progress` is a plain value with no interior locking; concurrent producers hand their
/// increments to a single owner which applies them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    state: State,
    printed: u64,
    expected: u64,
}

impl Progress {
    pub fn new() -> Self {
        Progress {
            state: State::Pending,
            printed: 0,
            expected: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn printed(&self) -> u64 {
        self.printed
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Moves to the next phase expecting `expected` bytes to be produced in it.
    /// Does nothing once the sort is finished.
    pub fn advance(&mut self, expected: u64) {
        if self.state == State::Finished {
            return;
        }
        self.state = self.state.next();
        self.printed = 0;
        self.expected = expected;
    }

    /// Accounts `amount` produced bytes to the current phase.
    pub fn add(&mut self, amount: u64) {
        if self.state == State::Finished {
            return;
        }
        self.printed = self.printed.saturating_add(amount);
    }

    /// Completed part of the current phase within `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.expected == 0 || self.state == State::Finished {
            return 1.0;
        }
        (self.printed as f64 / self.expected as f64).min(1.0)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Progress::new()
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state is {}, printed size is {}, expected is {}",
            self.state, self.printed, self.expected
        )
    }
}

/// Progress consumer. Receives the current phase and its completed fraction.
pub trait ProgressSink {
    fn report(&mut self, state: State, fraction: f64);
}

impl<F> ProgressSink for F
where
    F: FnMut(State, f64),
{
    fn report(&mut self, state: State, fraction: f64) {
        self(state, fraction)
    }
}

/// The only writer of a sort's [`Progress`]. Every change is forwarded to the sink.
pub(crate) struct ProgressReporter<'a> {
    progress: Progress,
    sink: &'a mut dyn ProgressSink,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(sink: &'a mut dyn ProgressSink) -> Self {
        ProgressReporter {
            progress: Progress::new(),
            sink,
        }
    }

    pub(crate) fn advance(&mut self, expected: u64) {
        self.progress.advance(expected);
        log::debug!("progress: {}", self.progress);
        self.notify();
    }

    pub(crate) fn add(&mut self, amount: u64) {
        self.progress.add(amount);
        self.notify();
    }

    #[cfg(test)]
    pub(crate) fn progress(&self) -> &Progress {
        &self.progress
    }

    fn notify(&mut self) {
        self.sink.report(self.progress.state(), self.progress.fraction());
    }
}
