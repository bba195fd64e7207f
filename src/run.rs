//! Sorted runs stored in the working directory.

use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use crate::key::{KeyExtractor, Record};
use crate::sort::SortError;

/// Working directory layout: every run is a file named by its integer index.
///
/// Indices are handed out monotonically by the sorter so that runs created by the split phase and
/// by every merge level never share a name.
#[derive(Clone, Debug)]
pub(crate) struct RunDir {
    dir: PathBuf,
}

impl RunDir {
    pub(crate) fn new(dir: &Path) -> Self {
        RunDir { dir: dir.to_path_buf() }
    }

    pub(crate) fn path(&self, index: usize) -> PathBuf {
        self.dir.join(index.to_string())
    }
}

/// Writes lines to a new run file, each terminated by a newline.
/// Returns the number of bytes written.
pub(crate) fn write_run(
    path: &Path,
    lines: impl IntoIterator<Item = String>,
    buf_size: Option<usize>,
) -> Result<u64, SortError> {
    let file = fs::File::create(path).map_err(SortError::IO)?;
    let mut run_writer = match buf_size {
        Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
        None => io::BufWriter::new(file),
    };

    let mut written = 0;
    for line in lines.into_iter() {
        run_writer.write_all(line.as_bytes()).map_err(SortError::IO)?;
        run_writer.write_all(b"\n").map_err(SortError::IO)?;
        written += line.len() as u64 + 1;
    }
    run_writer.flush().map_err(SortError::IO)?;

    Ok(written)
}

/// Deletes a consumed run. Failures leave a stale file behind which is cleaned up together with
/// the working directory, so they are only logged.
pub(crate) fn remove_run(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        log::warn!("run file {} not removed: {}", path.display(), err);
    }
}

/// Sequential reader of a run file yielding records with their comparison keys.
pub(crate) struct RunReader {
    reader: io::BufReader<fs::File>,
    extractor: KeyExtractor,
    line: String,
}

impl RunReader {
    pub(crate) fn open(path: &Path, extractor: KeyExtractor, buf_size: Option<usize>) -> Result<Self, SortError> {
        let file = fs::File::open(path).map_err(SortError::IO)?;
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        Ok(RunReader {
            reader,
            extractor,
            line: String::new(),
        })
    }
}

impl Iterator for RunReader {
    type Item = Result<Record, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(SortError::IO(err))),
            }

            let line = self.line.strip_suffix('\n').unwrap_or(&self.line);
            if !line.is_empty() {
                return Some(self.extractor.extract(line.to_string()));
            }
        }
    }
}
