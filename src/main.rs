use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use line_ext_sort::{ExternalSorter, ExternalSorterBuilder, State};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let reverse = arg_parser.is_present("reverse");
    let show_progress = arg_parser.is_present("progress");
    let separator = arg_parser.value_of("separator").expect("value has default");
    let field: usize = arg_parser.value_of_t_or_exit("field");
    let types = arg_parser.value_of("types").unwrap_or("");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let memory = arg_parser.value_of("memory").expect("value has default");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let input = arg_parser.value_of("input").expect("value is required");
    if let Err(err) = fs::File::open(input) {
        log::error!("input file opening error: {}", err);
        process::exit(1);
    }

    let output = arg_parser.value_of("output").expect("value is required");
    if let Err(err) = fs::OpenOptions::new().write(true).create(true).truncate(false).open(output) {
        log::error!("output file creation error: {}", err);
        process::exit(1);
    }

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_reverse(reverse)
        .with_separator(separator)
        .with_key_field(field)
        .with_field_types(types)
        .with_memory_budget(memory.parse::<ByteSize>().expect("value is pre-validated").as_u64() as i64);

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    let sorter: ExternalSorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let result = if show_progress {
        let mut stderr = io::stderr();
        let mut progress = |state: State, fraction: f64| print_progress(&mut stderr, state, fraction);
        sorter.sort_with_progress(path::Path::new(input), path::Path::new(output), &mut progress)
    } else {
        sorter.sort(path::Path::new(input), path::Path::new(output))
    };

    if let Err(err) = result {
        log::error!("data sorting error: {}", err);
        process::exit(1);
    }
}

/// Renders a 50 cell progress bar, one cell per 2%.
fn print_progress(out: &mut impl Write, state: State, fraction: f64) {
    let percent = fraction * 100.0;
    let filled = ((percent / 2.0).floor() as usize).min(50);
    let bar = format!("{}{}", "#".repeat(filled), ".".repeat(50 - filled));

    let _ = write!(out, "\r[{}] {} - {:.2}%", bar, state, percent);
    if state == State::Finished {
        let _ = writeln!(out, "\rREADY");
    }
    let _ = out.flush();
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("line-ext-sort")
        .about("external sorter for delimited text files")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("reverse")
                .short('r')
                .long("reverse")
                .help("sort in descending order"),
        )
        .arg(
            clap::Arg::new("separator")
                .short('s')
                .long("separator")
                .help("field separator")
                .takes_value(true)
                .default_value(" ")
                .validator(|v| match v.is_empty() {
                    false => Ok(()),
                    true => Err("separator must not be empty".to_string()),
                }),
        )
        .arg(
            clap::Arg::new("field")
                .short('f')
                .long("field")
                .help("key field, starting at 1")
                .takes_value(true)
                .default_value("1")
                .validator(|v| match v.parse::<usize>() {
                    Ok(field) if field >= 1 => Ok(()),
                    _ => Err(format!("Key field must be a positive integer: {}", v)),
                }),
        )
        .arg(
            clap::Arg::new("types")
                .long("types")
                .help("types of fields starting from the key field: n (integer) or s (string)")
                .takes_value(true)
                .validator(|v| match v.chars().find(|c| *c != 'n' && *c != 's') {
                    None => Ok(()),
                    Some(c) => Err(format!("Unrecognized type {}. Expected n or s.", c)),
                }),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("memory budget")
                .takes_value(true)
                .default_value("8MiB")
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Memory size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel merging")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("progress")
                .short('p')
                .long("progress")
                .help("print a progress bar to stderr"),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
