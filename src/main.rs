use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use multiway_sort::{gen, ExternalSorter, ExternalSorterBuilder, JsonLineCodec, LineCodec, Record, Selection};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let mode: Mode = arg_parser.value_of_t_or_exit("mode");
    let selector: Selector = arg_parser.value_of_t_or_exit("selector");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let rw_buf_size: Option<&str> = arg_parser.value_of("rw_buf_size");
    let partitions: Option<usize> = arg_parser
        .is_present("partitions")
        .then(|| arg_parser.value_of_t_or_exit("partitions"));
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let records: Option<u64> = arg_parser
        .is_present("records")
        .then(|| arg_parser.value_of_t_or_exit("records"));
    let generate: Option<u64> = arg_parser
        .is_present("generate")
        .then(|| arg_parser.value_of_t_or_exit("generate"));

    let input = path::Path::new(arg_parser.value_of("input").expect("value is required"));
    let output = path::Path::new(arg_parser.value_of("output").expect("value is required"));

    if let Some(count) = generate {
        log::info!("generating {} random records into {}", count, input.display());
        if let Err(err) = gen::write_random_file(input, count, &mut rand::thread_rng(), &JsonLineCodec) {
            log::error!("input file generation error: {}", err);
            process::exit(1);
        }
    }

    let mut sorter_builder = ExternalSorterBuilder::new().with_selection(match selector {
        Selector::Linear => Selection::LinearScan,
        Selector::Heap => Selection::BinaryHeap,
    });
    if let Some(partitions) = partitions {
        sorter_builder = sorter_builder.with_partitions(partitions);
    }

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(rw_buf_size) = rw_buf_size {
        sorter_builder = sorter_builder.with_rw_buf_size(
            rw_buf_size.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize,
        );
    }

    let sorter: ExternalSorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    match mode {
        Mode::Disk => sort_file(&sorter, input, output, records),
        Mode::Memory => sort_in_memory(&sorter, input, output),
    }
}

fn sort_file(sorter: &ExternalSorter, input: &path::Path, output: &path::Path, records: Option<u64>) {
    let total = match records {
        Some(total) => total,
        None => match multiway_sort::count_records(input) {
            Ok(total) => total,
            Err(err) => {
                log::error!("input file reading error: {}", err);
                process::exit(1);
            }
        },
    };

    if let Err(err) = sorter.sort_file(input, output, total) {
        log::error!("data sorting error: {}", err);
        process::exit(1);
    }
}

fn sort_in_memory(sorter: &ExternalSorter, input: &path::Path, output: &path::Path) {
    let input_stream = match fs::File::open(input) {
        Ok(file) => io::BufReader::new(file),
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };

    let mut records: Vec<Record> = Vec::new();
    for line in input_stream.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::error!("input file reading error: {}", err);
                process::exit(1);
            }
        };
        if line.is_empty() {
            continue;
        }
        match JsonLineCodec.decode(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                log::error!("input record deserialization error: {}", err);
                process::exit(1);
            }
        }
    }

    let sorted = match sorter.sort_records(records) {
        Ok((sorted, _)) => sorted,
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    };

    let mut output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };

    for record in sorted.iter() {
        if let Err(err) = JsonLineCodec.encode(record, &mut output_stream) {
            log::error!("data saving error: {}", err);
            process::exit(1);
        }
    }

    if let Err(err) = output_stream.flush() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }
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

#[derive(Copy, Clone, clap::ArgEnum)]
enum Mode {
    Disk,
    Memory,
}

impl Mode {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Mode::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Mode as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Selector {
    Linear,
    Heap,
}

impl Selector {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Selector::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Selector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Selector as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("multiway-sort")
        .about("external multiway merge sorter")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted, one JSON record per line")
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
            clap::Arg::new("mode")
                .short('m')
                .long("mode")
                .help("sort with spill files or fully in memory")
                .takes_value(true)
                .default_value("disk")
                .possible_values(Mode::possible_values()),
        )
        .arg(
            clap::Arg::new("partitions")
                .short('p')
                .long("partitions")
                .help("number of partitions (default: 20 on disk, 40 in memory)")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("records")
                .short('n')
                .long("records")
                .help("number of records in the input file, counted if omitted")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("selector")
                .short('s')
                .long("selector")
                .help("merge selection strategy")
                .takes_value(true)
                .default_value("linear")
                .possible_values(Selector::possible_values()),
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
                .help("number of threads to use for parallel partition sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store spill files (default: next to the input)")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("rw_buf_size")
                .short('b')
                .long("rw-buf-size")
                .help("spill and output file buffer size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Buffer size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("generate")
                .short('g')
                .long("generate")
                .help("write this many random records to the input file before sorting")
                .takes_value(true),
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
