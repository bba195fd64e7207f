use std::fs;
use std::io::{self, prelude::*};
use std::path;

use env_logger;
use log;

use line_ext_sort::{ExternalSorter, ExternalSorterBuilder, State};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input = path::Path::new("input.txt");
    let mut input_writer = io::BufWriter::new(fs::File::create(input).unwrap());
    for i in 0..100_000u64 {
        let id = (i * 7_919) % 100_000;
        writeln!(input_writer, "user{} {} {}", id % 97, id, i).unwrap();
    }
    input_writer.flush().unwrap();

    // second column as an integer key, the remaining columns break ties
    let sorter: ExternalSorter = ExternalSorterBuilder::new()
        .with_tmp_dir(path::Path::new("./"))
        .with_key_field(2)
        .with_field_types("n")
        .with_memory_budget(1 << 20)
        .build()
        .unwrap();

    let mut progress = |state: State, fraction: f64| log::debug!("{}: {:.1}%", state, fraction * 100.0);
    sorter
        .sort_with_progress(input, path::Path::new("output.txt"), &mut progress)
        .unwrap();
}
